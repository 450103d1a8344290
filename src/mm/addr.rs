//! 提供物理地址包装

use core::convert::TryFrom;
use core::result::Result;

use crate::consts::PGSIZE;

/// 地址通用操作
pub trait Addr {
    fn data_ref(&self) -> &usize;

    fn data_mut(&mut self) -> &mut usize;

    /// 向上取整到页边界
    #[inline]
    fn pg_round_up(&mut self) {
        *self.data_mut() = (*self.data_mut() + PGSIZE - 1) & !(PGSIZE - 1)
    }

    /// 前进一页
    #[inline]
    fn add_page(&mut self) {
        *self.data_mut() += PGSIZE;
    }

    #[inline]
    fn as_usize(&self) -> usize {
        *self.data_ref()
    }

    #[inline]
    fn as_mut_ptr(&mut self) -> *mut u8 {
        *self.data_mut() as *mut u8
    }
}

/// 物理地址
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PhysAddr(usize);

impl Addr for PhysAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl PhysAddr {
    /// # 安全性
    /// 调用者保证 `raw` 是一个有意义的物理地址，不做任何检查
    #[inline]
    pub unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn into_raw(self) -> usize {
        self.0
    }

    /// 是否按页对齐
    #[inline]
    pub fn is_page_aligned(&self) -> bool {
        self.0 % PGSIZE == 0
    }
}

impl TryFrom<usize> for PhysAddr {
    type Error = &'static str;

    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr % PGSIZE != 0 {
            return Err("PhysAddr addr not aligned");
        }
        Ok(PhysAddr(addr))
    }
}
