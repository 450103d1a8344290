//! 串联空闲物理页的侵入式单向链表

use core::ptr;

/// 空闲页的头部：空闲期间页面的前 8 个字节用作指向下一空闲页的链接
#[repr(C)]
struct Run {
    next: *mut Run,
}

/// 空闲页链表
///
/// # 安全说明
/// - 所有节点都位于被管理的空闲物理页内部，链表自身不分配任何内存
/// - 页面一旦通过 `push` 挂入链表，在被 `pop` 或拆分出去之前不得被其他代码访问
pub struct FreeList {
    head: *mut Run,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: ptr::null_mut() }
    }

    /// 检查链表是否为空
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// 将一页压入链表头部
    ///
    /// # 安全性
    /// - `raw_addr` 必须是有效且对齐的页地址，且当前没有被任何其他链表或调用者持有
    /// - 调用后该页被链表接管，页头被覆盖为链接字段
    pub unsafe fn push(&mut self, raw_addr: usize) {
        let run = raw_addr as *mut Run;
        ptr::write(run, Run { next: self.head });
        self.head = run;
    }

    /// 从链表头部弹出一页，返回其地址；链表为空时返回 `None`
    pub fn pop(&mut self) -> Option<usize> {
        if self.head.is_null() {
            return None;
        }
        let run = self.head;
        // 安全性：run 由 push 写入，且仍归链表所有
        self.head = unsafe { (*run).next };
        Some(run as usize)
    }

    /// 遍历链表中每一页的地址
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            cur: self.head,
            _list: self,
        }
    }

    /// 将链表从中点一分为二，返回前半部分，`self` 保留后半部分
    ///
    /// # 功能说明
    /// 使用快慢指针一趟遍历找到中点，无需预先计数：
    /// 慢指针每次前进一个节点，快指针每次前进两个节点，
    /// 快指针到达末尾时慢指针所在节点即为前半部分的最后一个节点。
    ///
    /// # 返回值
    /// 长度为 `n` 的链表，返回的前半部分含 `(n + 1) / 2` 页（包括中点），
    /// `self` 保留剩余的 `n / 2` 页。单节点链表整个被拆出，`self` 变为空。
    pub fn split_front_half(&mut self) -> FreeList {
        if self.head.is_null() {
            return FreeList::new();
        }
        let front = self.head;
        let mut slow = self.head;
        unsafe {
            let mut fast = (*slow).next;
            while !fast.is_null() && !(*fast).next.is_null() {
                slow = (*slow).next;
                fast = (*(*fast).next).next;
            }
            self.head = (*slow).next;
            (*slow).next = ptr::null_mut();
        }
        FreeList { head: front }
    }
}

pub struct Iter<'a> {
    cur: *mut Run,
    _list: &'a FreeList,
}

impl<'a> Iterator for Iter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur.is_null() {
            return None;
        }
        let addr = self.cur as usize;
        self.cur = unsafe { (*self.cur).next };
        Some(addr)
    }
}
