//! 物理页分配器
//!
//! 每个 hart 拥有一个独立的空闲页池，常规分配与释放只访问本地池的锁；
//! 本地池耗尽时，从空闲页最多的其他池中借走一半。

use alloc::vec;

use array_macro::array;
use bit_field::BitField;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::consts::{JUNK_ALLOC, JUNK_FREE, NCPU, PGSIZE};
use crate::cpu::{self, pop_off, push_off};
use crate::spinlock::{SpinLock, SpinLockGuard};
use super::list::FreeList;
use super::{pg_round_up, Addr, PhysAddr, RawSinglePage};

/// 按 hart 划分的物理页分配器。
///
/// 为用户进程、内核栈、页表页以及管道缓冲区分配整页（4096 字节）物理内存。
/// 管理区间在 [`Kmem::init`] 时确定，之后不会增长。
///
/// # 不变式
/// - 每个空闲页恰好位于一个池的空闲链表中，或者已被分配，二者不可兼得；
/// - 每个池的 `freelen` 始终等于其链表的真实长度，由 [`Kmem::check`] 校验。
pub struct Kmem {
    /// 被管理区间的起始地址（页对齐）
    base: AtomicUsize,
    /// 被管理区间的结束地址，不包括该地址本身
    top: AtomicUsize,
    initialized: AtomicBool,
    cpus: [KmemCpu; NCPU],
}

/// 单个 hart 的空闲页池以及对外公布的空闲页数
struct KmemCpu {
    pool: SpinLock<Pool>,
    /// `pool.freelen` 的副本，只在持有 `pool` 锁时写入，
    /// 供不持锁的读者（借调扫描、统计）参考
    nfree: AtomicUsize,
}

impl KmemCpu {
    const fn new() -> Self {
        Self {
            pool: SpinLock::new(Pool::new(), "kmem"),
            nfree: AtomicUsize::new(0),
        }
    }

    fn publish(&self, pool: &Pool) {
        self.nfree.store(pool.freelen, Ordering::Relaxed);
    }
}

struct Pool {
    freelist: FreeList,
    freelen: usize,
}

// 因为 FreeList 内部是裸指针
unsafe impl Send for Pool {}

impl Pool {
    const fn new() -> Self {
        Self {
            freelist: FreeList::new(),
            freelen: 0,
        }
    }

    fn pop(&mut self) -> Option<PhysAddr> {
        let raw = self.freelist.pop()?;
        self.freelen -= 1;
        Some(unsafe { PhysAddr::from_raw(raw) })
    }
}

/// 一次借调的结果
enum Rebalance {
    /// 借调成功，返回从本地池弹出的一页
    Taken(PhysAddr),
    /// 本地池并不为空，无需借调
    Skipped,
    /// 所有池都没有空闲页
    Exhausted,
    /// 没有找到供体，但有正忙且公布了空闲页的池，调用者应释放本地锁后重试
    Contended,
}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            base: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            cpus: array![_ => KmemCpu::new(); NCPU],
        }
    }

    /// 初始化物理页分配器。
    ///
    /// # 功能说明
    /// 记录被管理的物理内存区间 `[pg_round_up(start), end)`，
    /// 然后逐页调用 [`Kmem::kfree`] 释放整个区间，所有页进入调用者所在 hart 的池中，
    /// 其他 hart 在首次分配时通过借调获得空闲页。
    ///
    /// # 参数
    /// - `start`: 可用物理内存的起始地址，通常为内核镜像结束地址；
    /// - `end`: 可用物理内存的结束地址，通常为 `PHYSTOP`。
    ///
    /// # 可能的错误
    /// 重复初始化会 panic。
    ///
    /// # 安全性
    /// 调用者保证 `[start, end)` 是可写的物理内存，且不被任何其他代码使用；
    /// 必须在其他 hart 使用分配器之前调用且只调用一次。
    pub unsafe fn init(&self, start: usize, end: usize) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            panic!("kmem: init twice");
        }
        let base = pg_round_up(start);
        self.base.store(base, Ordering::Relaxed);
        self.top.store(end, Ordering::Relaxed);
        println!("kmem: available physical memory [{:#x}, {:#x})", base, end);

        let mut pa = PhysAddr::from_raw(base);
        while pa.as_usize() + PGSIZE <= end {
            self.kfree(pa);
            pa.add_page();
        }
        println!("kmem: {} free pages across {} pools", self.nfree(), NCPU);

        #[cfg(feature = "verbose_init_info")]
        for (i, c) in self.cpus.iter().enumerate() {
            println!("  kmem: pool {} holds {} pages", i, c.nfree.load(Ordering::Relaxed));
        }
    }

    /// 释放一页物理内存到当前 hart 的池中。
    ///
    /// # 功能说明
    /// 该页通常由 [`Kmem::kalloc`] 分配（初始化时除外）。
    /// 释放前用 `JUNK_FREE` 填充整页，以便尽早暴露悬垂引用。
    ///
    /// # 可能的错误
    /// 地址未按页对齐或不在被管理区间内时 panic，这属于调用者的契约违背。
    ///
    /// # 安全性
    /// 调用者保证该页不再被任何人使用，且没有被重复释放。
    pub unsafe fn kfree(&self, mut pa: PhysAddr) {
        let raw = pa.as_usize();
        if !pa.is_page_aligned()
            || raw < self.base.load(Ordering::Relaxed)
            || raw > self.top.load(Ordering::Relaxed).saturating_sub(PGSIZE)
        {
            panic!("kfree");
        }

        // 填充垃圾数据以捕获悬垂引用
        RawSinglePage::fill(pa.as_mut_ptr() as *mut RawSinglePage, JUNK_FREE);

        push_off();
        let id = cpu::cpu_id();
        let c = &self.cpus[id];
        let mut pool = c.pool.lock();
        pool.freelist.push(raw);
        pool.freelen += 1;
        c.publish(&pool);
        drop(pool);
        pop_off();
    }

    /// 分配一页 4096 字节的物理内存。
    ///
    /// # 流程解释
    /// 1. 关中断，使当前 hart 编号在整个过程中保持不变；
    /// 2. 持有本地池的锁，若链表非空则弹出表头；
    /// 3. 否则在仍持有本地锁的情况下调用 `rebalance` 从其他池借调；
    /// 4. 借调遇到正忙的池时释放本地锁并重试，避免与其他借调者相互等待；
    /// 5. 用 `JUNK_ALLOC` 填充返回的页。
    ///
    /// # 返回值
    /// - `Some(pa)`：新分配页的物理地址；
    /// - `None`：所有池都没有空闲页，这是调用者需要处理的正常情况。
    pub fn kalloc(&self) -> Option<PhysAddr> {
        push_off();
        let id = cpu::cpu_id();
        let c = &self.cpus[id];

        let page = loop {
            let mut pool = c.pool.lock();
            let result = match pool.pop() {
                Some(pa) => Rebalance::Taken(pa),
                None => self.rebalance(id, &mut pool),
            };
            c.publish(&pool);
            drop(pool);

            match result {
                Rebalance::Taken(pa) => break Some(pa),
                Rebalance::Exhausted => break None,
                Rebalance::Skipped | Rebalance::Contended => core::hint::spin_loop(),
            }
        };
        pop_off();

        match page {
            Some(mut pa) => unsafe {
                RawSinglePage::fill(pa.as_mut_ptr() as *mut RawSinglePage, JUNK_ALLOC);
            },
            None => {
                #[cfg(feature = "kernel_warning")]
                println!("kmem: hart {} out of memory", id);
            }
        }
        page
    }

    /// 本地池耗尽时，从空闲页最多的其他池借走一半。
    ///
    /// # 功能说明
    /// 调用者必须持有本地池 `local` 的锁。若本地链表非空，说明此前的借调已经成功，直接返回。
    /// 否则依次探测其他每个池：持有目前最优的候选池的锁，遇到更优者时释放旧候选，
    /// 不更优的池立即释放。扫描结束后仍被锁住的就是供体。
    ///
    /// # 流程解释
    /// 1. 对其他池使用 `try_lock`，从不等待：正在借调的 hart 持有自己的锁，
    ///    若此处阻塞等待，两个同时借调的 hart 会互相死锁；
    /// 2. 供体链表用快慢指针一分为二，前半部分（含中点，共 `(n + 1) / 2` 页）移入本地池，
    ///    供体保留剩余 `n / 2` 页，页数总和精确守恒；
    /// 3. 释放供体锁，从本地池弹出一页返回。
    ///
    /// # 返回值
    /// 见 [`Rebalance`]。
    fn rebalance(&self, id: usize, local: &mut SpinLockGuard<'_, Pool>) -> Rebalance {
        if !local.freelist.is_empty() {
            return Rebalance::Skipped;
        }

        let mut donor: Option<(usize, SpinLockGuard<'_, Pool>)> = None;
        let mut contended = false;
        for (i, c) in self.cpus.iter().enumerate() {
            if i == id {
                continue;
            }
            let pool = match c.pool.try_lock() {
                Some(pool) => pool,
                None => {
                    if c.nfree.load(Ordering::Relaxed) > 0 {
                        contended = true;
                    }
                    continue;
                }
            };
            let best = donor.as_ref().map_or(0, |(_, d)| d.freelen);
            if pool.freelen > best {
                // 旧的候选在此被释放
                donor = Some((i, pool));
            }
        }

        let (donor_id, mut donor) = match donor {
            Some(donor) => donor,
            None if contended => return Rebalance::Contended,
            None => return Rebalance::Exhausted,
        };

        let n = donor.freelen;
        let moved = (n + 1) / 2;
        local.freelist = donor.freelist.split_front_half();
        local.freelen = moved;
        self.cpus[id].publish(local);
        donor.freelen = n - moved;
        self.cpus[donor_id].publish(&donor);
        drop(donor);

        match local.pop() {
            Some(pa) => Rebalance::Taken(pa),
            None => panic!("kmem: rebalance from pool {} moved no page", donor_id),
        }
    }

    /// 校验所有池的一致性，返回空闲页总数。
    ///
    /// # 功能说明
    /// 按编号升序锁住所有池（借调者从不阻塞等待其他池，因此不会形成环），
    /// 遍历每条空闲链表：
    /// - 每一页都必须按页对齐并位于被管理区间内；
    /// - 每一页只能出现一次，用位图记录已经见过的页；
    /// - 链表真实长度必须等于记录的 `freelen`。
    ///
    /// 仅用于内部一致性审计，不在分配的热路径上。
    ///
    /// # 可能的错误
    /// 任何不一致都会 panic。
    pub fn check(&self) -> usize {
        let base = self.base.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        let npages = top.saturating_sub(base) / PGSIZE;
        let mut seen = vec![0u8; (npages + 7) / 8];

        let pools: [SpinLockGuard<'_, Pool>; NCPU] = array![i => self.cpus[i].pool.lock(); NCPU];

        let mut total = 0;
        for (i, pool) in pools.iter().enumerate() {
            let mut len = 0;
            for raw in pool.freelist.iter() {
                if raw % PGSIZE != 0 || raw < base || raw + PGSIZE > top {
                    panic!("kmem check: pool {} holds foreign page {:#x}", i, raw);
                }
                let index = (raw - base) / PGSIZE;
                if seen[index / 8].get_bit(index % 8) {
                    panic!("kmem check: page {:#x} on two free lists", raw);
                }
                seen[index / 8].set_bit(index % 8, true);
                len += 1;
            }
            if len != pool.freelen {
                println!("cpu: {}, real: {}, freelen: {}", i, len, pool.freelen);
                panic!("kmem check: freelen not match");
            }
            total += len;
        }
        total
    }

    /// 空闲页总数。并发时为近似值，静止时精确。
    pub fn nfree(&self) -> usize {
        self.cpus.iter()
            .map(|c| c.nfree.load(Ordering::Relaxed))
            .sum()
    }

    /// 被管理区间 `[base, top)`
    pub fn range(&self) -> (usize, usize) {
        (self.base.load(Ordering::Relaxed), self.top.load(Ordering::Relaxed))
    }
}
