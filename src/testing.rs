//! 宿主机上运行单元测试所需的平台实现
//!
//! 每个测试线程模拟一个 hart：hart 编号、中断开关以及 `Cpu` 记录都是线程局部的。

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::consts::{fs::BSIZE, PGSIZE};
use crate::cpu::{self, Cpu, Platform};
use crate::driver::BlockDevice;
use crate::fs::BufData;
use crate::mm::RawSinglePage;

struct HostPlatform;

static HOST: HostPlatform = HostPlatform;
static TICKS: AtomicU32 = AtomicU32::new(0);
static YIELDS: AtomicUsize = AtomicUsize::new(0);
static CONSOLE: Mutex<Vec<u8>> = Mutex::new(Vec::new());
static SERIAL: Mutex<()> = Mutex::new(());

thread_local! {
    static HART: Cell<usize> = Cell::new(0);
    static INTR: Cell<bool> = Cell::new(true);
    static CPU: Cell<&'static Cpu> = Cell::new(Box::leak(Box::new(Cpu::new())));
}

impl Platform for HostPlatform {
    fn cpu_id(&self) -> usize {
        HART.with(|h| h.get())
    }

    fn intr_get(&self) -> bool {
        INTR.with(|i| i.get())
    }

    fn intr_on(&self) {
        INTR.with(|i| i.set(true));
    }

    fn intr_off(&self) {
        INTR.with(|i| i.set(false));
    }

    fn cpu(&self) -> &Cpu {
        CPU.with(|c| c.get())
    }

    fn ticks(&self) -> u32 {
        TICKS.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn yield_now(&self) {
        YIELDS.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
    }

    fn putc(&self, c: u8) {
        CONSOLE.lock().unwrap_or_else(|e| e.into_inner()).push(c);
    }
}

/// 注册宿主平台，并串行化使用全局锁与 hart 编号的测试。
///
/// 当前线程被重置为 hart 0、中断开启、嵌套计数为 0。
pub fn setup() -> MutexGuard<'static, ()> {
    cpu::install(&HOST);
    let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    HART.with(|h| h.set(0));
    INTR.with(|i| i.set(true));
    CPU.with(|c| c.set(Box::leak(Box::new(Cpu::new()))));
    guard
}

/// 以 hart `id` 的身份在当前线程上执行 `f`
pub fn on_cpu<R>(id: usize, f: impl FnOnce() -> R) -> R {
    let old = HART.with(|h| h.replace(id));
    let ret = f();
    HART.with(|h| h.set(old));
    ret
}

/// 所有 hart 调用 `yield_now` 的总次数
pub fn yields() -> usize {
    YIELDS.load(Ordering::SeqCst)
}

/// 取出并清空控制台输出
pub fn take_console() -> String {
    let mut console = CONSOLE.lock().unwrap_or_else(|e| e.into_inner());
    String::from_utf8_lossy(&std::mem::take(&mut *console)).into_owned()
}

/// 一段页对齐的内存，充当被管理的物理内存
pub struct Arena {
    pages: Vec<RawSinglePage>,
    base: *mut RawSinglePage,
}

impl Arena {
    pub fn new(n: usize) -> Self {
        let mut pages = Vec::with_capacity(n);
        pages.resize_with(n, RawSinglePage::new);
        let base = pages.as_mut_ptr();
        Self { pages, base }
    }

    pub fn start(&self) -> usize {
        self.base as usize
    }

    pub fn end(&self) -> usize {
        self.start() + self.pages.len() * PGSIZE
    }

    /// 第 `i` 页的地址
    pub fn page(&self, i: usize) -> usize {
        assert!(i < self.pages.len());
        self.start() + i * PGSIZE
    }

    /// 读取 `pa` 所在页的全部内容
    pub fn bytes_of(&self, pa: usize) -> Vec<u8> {
        assert!(pa >= self.start() && pa + PGSIZE <= self.end());
        unsafe { std::slice::from_raw_parts(pa as *const u8, PGSIZE).to_vec() }
    }
}

/// 内存中的块设备，记录读写次数。
///
/// 从未写过的块内容为其块号的低 8 位。
pub struct RamDisk {
    blocks: Mutex<HashMap<(u32, u32), Vec<u8>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 直接读取磁盘上的块内容，不经过缓存
    pub fn block(&self, dev: u32, blockno: u32) -> Vec<u8> {
        let blocks = self.blocks.lock().unwrap();
        match blocks.get(&(dev, blockno)) {
            Some(data) => data.clone(),
            None => vec![blockno as u8; BSIZE],
        }
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        if writing {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.blocks.lock().unwrap().insert((dev, blockno), data.to_vec());
        } else {
            self.reads.fetch_add(1, Ordering::SeqCst);
            data.copy_from_slice(&self.block(dev, blockno));
        }
    }
}
