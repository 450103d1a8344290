//! 内存管理模块

use crate::consts::PGSIZE;

pub use addr::{Addr, PhysAddr};
pub use kalloc::Kmem;

mod addr;
pub mod kalloc;
mod list;

/// 单页大小（4096字节）的内存页结构
///
/// # 内存布局
/// - `#[repr(C, align(4096)]` 确保页对齐
/// - 固定大小：`PGSIZE`
#[repr(C, align(4096))]
pub struct RawSinglePage {
    data: [u8; PGSIZE]
}

impl RawSinglePage {
    pub const fn new() -> Self {
        Self { data: [0; PGSIZE] }
    }

    /// 用 `byte` 填满整页
    ///
    /// # 安全性
    /// `page` 必须指向一页可写且没有被其他人使用的内存
    pub unsafe fn fill(page: *mut RawSinglePage, byte: u8) {
        (*page).data.fill(byte);
    }
}

/// 向上取整到页边界
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + (PGSIZE - 1)) & !(PGSIZE - 1)
}
