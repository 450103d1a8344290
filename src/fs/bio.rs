//! 缓存层
//!
//! 缓冲块按块号散列到 `NBUCKET` 个桶中，每个桶有自己的自旋锁。
//! 命中以及大部分替换只需要持有一个桶锁；只有当本桶没有可替换的缓冲块时，
//! 才持有全局锁，从其他桶中借调全局最久未使用的缓冲块。

use array_macro::array;

use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::cpu;
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};

/// 空链接；作为所属桶时表示该缓冲块从未被绑定，不在任何桶的链表中
const NIL: usize = usize::MAX;

/// 未绑定缓冲块的块号
const NO_BLOCK: u32 = u32::MAX;

#[inline]
fn hash(blockno: u32) -> usize {
    blockno as usize % NBUCKET
}

/// 缓冲区缓存（Buffer Cache），位于块设备驱动与文件系统之间。
///
/// `Bcache` 持有固定数量的缓冲块，缓存磁盘块的内容以减少重复的磁盘访问。
/// 同一个 `(dev, blockno)` 任意时刻至多绑定到一个缓冲块上。
///
/// # 锁的顺序
/// 桶锁 → 全局锁 `lock` → （只允许 `try_lock`）被借调缓冲块原来所在的桶锁。
///
/// # 字段说明
/// - `disk`: 底层块设备；
/// - `lock`: 全局锁，只在跨桶借调时持有；
/// - `buckets`: 散列桶，每个桶保护其链表以及链表上缓冲块的元信息；
/// - `ctrl`: 每个缓冲块的元信息，在所属桶的锁下修改；
/// - `bufs`: 每个缓冲块的数据，由睡眠锁保护。
pub struct Bcache<D: BlockDevice> {
    disk: D,
    lock: SpinLock<()>,
    buckets: [SpinLock<Bucket>; NBUCKET],
    ctrl: [BufCtrl; NBUF],
    bufs: [BufInner; NBUF],
}

/// 一次跨桶借调的结果
enum Steal {
    /// 借调到的缓冲块，已经挂入目标桶
    Stolen(usize),
    /// 缓冲块原来所在的桶正忙，调用者应释放所有锁后重试
    Contended,
}

impl<D: BlockDevice> Bcache<D> {
    pub const fn new(disk: D) -> Self {
        Self {
            disk,
            lock: SpinLock::new((), "bcache"),
            buckets: array![_ => SpinLock::new(Bucket::new(), "bcache.bucket"); NBUCKET],
            ctrl: array![_ => BufCtrl::new(); NBUF],
            bufs: array![_ => BufInner::new(); NBUF],
        }
    }

    /// 初始化缓冲区缓存。
    ///
    /// # 功能说明
    /// 清空所有桶的链表，并把每个缓冲块恢复为未绑定状态：
    /// 块号为哨兵值、引用计数与时间戳为 0、数据无效、不属于任何桶。
    /// 未绑定的缓冲块在第一次缺失时被直接挂入目标桶。
    ///
    /// 应在系统启动时、任何缓冲块被使用之前调用一次。
    pub fn binit(&self) {
        for bucket in self.buckets.iter() {
            bucket.lock().head = NIL;
        }
        for (b, inner) in self.ctrl.iter().zip(self.bufs.iter()) {
            b.reset();
            inner.valid.store(false, Ordering::Relaxed);
        }
        println!("bcache: {} buffers in {} buckets", NBUF, NBUCKET);
    }

    /// 获取绑定到 `(dev, blockno)` 的缓冲块，返回时已持有其睡眠锁。
    ///
    /// # 流程解释
    /// 1. 锁住 `hash(blockno)` 对应的桶；
    /// 2. 命中：引用计数加一，释放桶锁后获取睡眠锁（可能阻塞等待当前持有者）；
    /// 3. 未命中：在本桶中挑选引用计数为 0 且时间戳最小的缓冲块；
    /// 4. 本桶没有候选时，持有全局锁借调全局最久未使用的缓冲块，见 `steal`；
    ///    借调遇到正忙的桶时，释放所有锁，让出 hart 后从第 1 步重新开始；
    /// 5. 绑定：设置设备号与块号，标记数据无效，引用计数置为 1，释放桶锁后获取睡眠锁。
    ///
    /// 该函数不读取磁盘，数据是否有效由 `bread` 处理。
    ///
    /// # 可能的错误
    /// 所有缓冲块都被引用时 panic（`"bget: no buffers"`）。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let idx = hash(blockno);
        let index = loop {
            let mut bucket = self.buckets[idx].lock();

            // 查找缓存块
            if let Some(index) = self.find_cached(&bucket, dev, blockno) {
                let b = &self.ctrl[index];
                b.refcnt.store(b.refcnt.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
                drop(bucket);
                return self.handle(index, dev, blockno);
            }

            // 未缓存，先回收本桶内最近最少使用的空闲缓冲块
            let index = match self.recycle(&bucket) {
                Some(index) => index,
                None => {
                    let global = self.lock.lock();
                    match self.steal(idx, &mut bucket) {
                        Steal::Stolen(index) => {
                            drop(global);
                            index
                        }
                        Steal::Contended => {
                            drop(global);
                            drop(bucket);
                            #[cfg(feature = "kernel_warning")]
                            println!("bget: bucket busy while fetching block {}, retry", blockno);
                            cpu::platform().yield_now();
                            continue;
                        }
                    }
                }
            };

            let b = &self.ctrl[index];
            b.dev.store(dev, Ordering::Relaxed);
            b.blockno.store(blockno, Ordering::Relaxed);
            b.refcnt.store(1, Ordering::Relaxed);
            self.bufs[index].valid.store(false, Ordering::Relaxed);
            drop(bucket);
            break index;
        };
        self.handle(index, dev, blockno)
    }

    /// 从缓存中读取指定设备与块号对应的数据。
    ///
    /// 若缓冲块的数据无效（刚被绑定），先从块设备同步读取一次并标记为有效。
    /// 返回的 `Buf` 持有睡眠锁，离开作用域时自动释放。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            self.disk.rw(dev, blockno, &mut b, false);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 显式释放缓冲块，与丢弃 `Buf` 等价。
    pub fn brelse(&self, b: Buf<'_, D>) {
        if !ptr::eq(b.cache, self) {
            panic!("brelse");
        }
        drop(b);
    }

    /// 底层块设备
    pub fn disk(&self) -> &D {
        &self.disk
    }

    fn handle(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_, D> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 在桶的链表中查找 `(dev, blockno)`。调用者持有该桶的锁。
    fn find_cached(&self, bucket: &Bucket, dev: u32, blockno: u32) -> Option<usize> {
        let mut i = bucket.head;
        while i != NIL {
            let b = &self.ctrl[i];
            if b.dev.load(Ordering::Relaxed) == dev
                && b.blockno.load(Ordering::Relaxed) == blockno
            {
                return Some(i);
            }
            i = b.next.load(Ordering::Relaxed);
        }
        None
    }

    /// 在桶的链表中挑选引用计数为 0 且时间戳最小的缓冲块。调用者持有该桶的锁。
    fn recycle(&self, bucket: &Bucket) -> Option<usize> {
        let mut victim: Option<(usize, u32)> = None;
        let mut i = bucket.head;
        while i != NIL {
            let b = &self.ctrl[i];
            if b.refcnt.load(Ordering::Relaxed) == 0 {
                let ts = b.timestamp.load(Ordering::Relaxed);
                if victim.map_or(true, |(_, oldest)| ts < oldest) {
                    victim = Some((i, ts));
                }
            }
            i = b.next.load(Ordering::Relaxed);
        }
        victim.map(|(i, _)| i)
    }

    /// 不持有任何桶锁，扫描全部缓冲块，返回全局最久未使用的空闲缓冲块。
    /// 结果只是提示，调用者需在所属桶的锁下再次确认。
    fn oldest_unused(&self) -> Option<usize> {
        let mut victim: Option<(usize, u32)> = None;
        for (i, b) in self.ctrl.iter().enumerate() {
            if b.refcnt.load(Ordering::Relaxed) != 0 {
                continue;
            }
            let ts = b.timestamp.load(Ordering::Relaxed);
            if victim.map_or(true, |(_, oldest)| ts < oldest) {
                victim = Some((i, ts));
            }
        }
        victim.map(|(i, _)| i)
    }

    /// 从其他桶借调一个空闲缓冲块并挂入桶 `idx`。
    ///
    /// # 功能说明
    /// 调用者持有目标桶 `bucket` 的锁以及全局锁。
    /// 选出全局时间戳最小的空闲缓冲块后：
    /// - 从未绑定过的缓冲块不在任何链表中，直接挂入目标桶；
    /// - 否则用 `try_lock` 获取其所在的桶，确认引用计数仍为 0 后从原链表摘除并挂入目标桶。
    ///   确认失败说明它在扫描之后被重新使用了，重新扫描。
    ///
    /// 持有全局锁时绝不阻塞等待另一个桶锁：那个桶的持有者可能正在等待全局锁。
    ///
    /// # 返回值
    /// - `Steal::Stolen(index)`：借调成功；
    /// - `Steal::Contended`：原来的桶正忙，调用者应释放全部锁后重试。
    ///
    /// # 可能的错误
    /// 没有任何空闲缓冲块时 panic（`"bget: no buffers"`）。
    fn steal(&self, idx: usize, bucket: &mut SpinLockGuard<'_, Bucket>) -> Steal {
        loop {
            let index = match self.oldest_unused() {
                Some(index) => index,
                None => panic!("bget: no buffers"),
            };
            let b = &self.ctrl[index];
            let owner = b.bucket.load(Ordering::Relaxed);

            if owner == NIL {
                // 未绑定的缓冲块只会在全局锁下被挂入桶中
                b.bucket.store(idx, Ordering::Relaxed);
                self.push_front(bucket, index);
                return Steal::Stolen(index);
            }

            if owner == idx {
                if b.refcnt.load(Ordering::Relaxed) == 0 {
                    return Steal::Stolen(index);
                }
                continue;
            }

            let mut old = match self.buckets[owner].try_lock() {
                Some(old) => old,
                None => return Steal::Contended,
            };
            if b.refcnt.load(Ordering::Relaxed) != 0 {
                drop(old);
                continue;
            }
            self.unlink(&mut old, index);
            b.bucket.store(idx, Ordering::Relaxed);
            drop(old);
            self.push_front(bucket, index);
            return Steal::Stolen(index);
        }
    }

    fn push_front(&self, bucket: &mut Bucket, index: usize) {
        self.ctrl[index].next.store(bucket.head, Ordering::Relaxed);
        bucket.head = index;
    }

    fn unlink(&self, bucket: &mut Bucket, index: usize) {
        let next = self.ctrl[index].next.load(Ordering::Relaxed);
        if bucket.head == index {
            bucket.head = next;
        } else {
            let mut i = bucket.head;
            while i != NIL {
                let b = &self.ctrl[i];
                if b.next.load(Ordering::Relaxed) == index {
                    b.next.store(next, Ordering::Relaxed);
                    break;
                }
                i = b.next.load(Ordering::Relaxed);
            }
            if i == NIL {
                panic!("bcache: buffer {} not on bucket list", index);
            }
        }
        self.ctrl[index].next.store(NIL, Ordering::Relaxed);
    }

    /// 锁住缓冲块当前所属的桶。
    /// 只对被引用的缓冲块调用，被引用的缓冲块不会被借调，因此所属的桶不会改变。
    fn owner_lock(&self, index: usize) -> SpinLockGuard<'_, Bucket> {
        self.buckets[self.ctrl[index].bucket.load(Ordering::Relaxed)].lock()
    }

    /// 引用计数减一，归零时记录释放时刻，供之后的替换按时间排序。
    fn release(&self, index: usize) {
        let bucket = self.owner_lock(index);
        let b = &self.ctrl[index];
        let rc = b.refcnt.load(Ordering::Relaxed);
        if rc == 0 {
            panic!("brelse: refcnt underflow");
        }
        b.refcnt.store(rc - 1, Ordering::Relaxed);
        if rc == 1 {
            b.timestamp.store(cpu::ticks(), Ordering::Relaxed);
        }
        drop(bucket);
    }
}

/// 已绑定并持有睡眠锁的缓冲块。
///
/// 由 `bread` 创建，在生命周期结束时自动释放睡眠锁并减少引用计数。
pub struct Buf<'a, D: BlockDevice> {
    cache: &'a Bcache<D>,
    /// 缓冲块在 `ctrl` 与 `bufs` 中的下标
    index: usize,
    dev: u32,
    blockno: u32,
    /// 在 `Buf` 生命周期内始终为 `Some`，`Drop` 中先取出以便先释放睡眠锁
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a, D: BlockDevice> Buf<'a, D> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 把缓冲块的内容同步写回磁盘。调用者必须持有睡眠锁。
    pub fn bwrite(&mut self) {
        let guard = match self.data.as_mut() {
            Some(guard) if guard.holding() => guard,
            _ => panic!("bwrite"),
        };
        self.cache.disk.rw(self.dev, self.blockno, &mut **guard, true);
    }

    /// 将当前缓冲块的引用计数加一，“钉住”该块，防止其被替换。
    ///
    /// 只持有桶锁，与睡眠锁无关，因此可以在释放 `Buf` 之后继续保持常驻，
    /// 例如日志层在事务提交前钉住被修改的块。必须与 `unpin` 配对使用。
    pub fn pin(&self) {
        let bucket = self.cache.owner_lock(self.index);
        let b = &self.cache.ctrl[self.index];
        b.refcnt.store(b.refcnt.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
        drop(bucket);
    }

    /// 与 `pin` 对应，将引用计数减一。
    ///
    /// # 可能的错误
    /// 引用计数不大于 1（即只剩当前 `Buf` 自身的引用）时 panic，说明 `pin` 与 `unpin` 不配对。
    pub fn unpin(&self) {
        let bucket = self.cache.owner_lock(self.index);
        let b = &self.cache.ctrl[self.index];
        let rc = b.refcnt.load(Ordering::Relaxed);
        if rc <= 1 {
            panic!("buf unpin not match");
        }
        b.refcnt.store(rc - 1, Ordering::Relaxed);
        drop(bucket);
    }
}

impl<'a, D: BlockDevice> Deref for Buf<'a, D> {
    type Target = BufData;

    fn deref(&self) -> &BufData {
        match self.data.as_ref() {
            Some(guard) => &**guard,
            None => panic!("buf: data lock released"),
        }
    }
}

impl<'a, D: BlockDevice> DerefMut for Buf<'a, D> {
    fn deref_mut(&mut self) -> &mut BufData {
        match self.data.as_mut() {
            Some(guard) => &mut **guard,
            None => panic!("buf: data lock released"),
        }
    }
}

impl<'a, D: BlockDevice> Drop for Buf<'a, D> {
    fn drop(&mut self) {
        match self.data.take() {
            Some(guard) => drop(guard),
            None => panic!("brelse"),
        }
        self.cache.release(self.index);
    }
}

/// 散列桶，链表上是当前属于该桶的缓冲块下标
struct Bucket {
    head: usize,
}

impl Bucket {
    const fn new() -> Self {
        Self { head: NIL }
    }
}

/// 缓冲块的元信息。
///
/// 除 `bucket` 外的字段只在所属桶的锁下修改；`bucket` 需要同时持有所属桶的锁与全局锁。
/// 借调时的全局扫描不持桶锁读取这些字段，读到的值只作为提示。
struct BufCtrl {
    dev: AtomicU32,
    blockno: AtomicU32,
    /// 正在使用该缓冲块的 `Buf` 数量加上 `pin` 的次数，为 0 时才可被替换
    refcnt: AtomicUsize,
    /// 引用计数最后一次归零时的时钟滴答
    timestamp: AtomicU32,
    /// 所属的桶，`NIL` 表示从未被绑定
    bucket: AtomicUsize,
    /// 桶链表中的下一个缓冲块
    next: AtomicUsize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: AtomicU32::new(0),
            blockno: AtomicU32::new(NO_BLOCK),
            refcnt: AtomicUsize::new(0),
            timestamp: AtomicU32::new(0),
            bucket: AtomicUsize::new(NIL),
            next: AtomicUsize::new(NIL),
        }
    }

    fn reset(&self) {
        self.dev.store(0, Ordering::Relaxed);
        self.blockno.store(NO_BLOCK, Ordering::Relaxed);
        self.refcnt.store(0, Ordering::Relaxed);
        self.timestamp.store(0, Ordering::Relaxed);
        self.bucket.store(NIL, Ordering::Relaxed);
        self.next.store(NIL, Ordering::Relaxed);
    }
}

/// 缓冲块的数据部分
struct BufInner {
    /// 数据是否已经从磁盘读入。
    /// 在 `bget` 中持有桶锁时清除，在 `bread` 中持有睡眠锁时设置。
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &[u8; BSIZE] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}
