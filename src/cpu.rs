//! 处理器状态管理：当前 hart 编号、中断开关嵌套以及平台钩子

use core::cell::Cell;

use spin::Once;

/// 内核向本库提供的平台接口。
///
/// 本库不直接访问任何硬件寄存器，读取 hart 编号、开关中断、时钟滴答、
/// 让出处理器以及控制台输出都通过该 trait 由内核实现，
/// 并在启动早期通过 [`install`] 注册一次。
pub trait Platform: Sync {
    /// 当前 hart 的编号，取值范围为 `0..NCPU`。
    ///
    /// 必须在禁用中断的情况下调用，
    /// 以防止与进程被迁移到另一个 CPU 时出现竞争条件。
    fn cpu_id(&self) -> usize;

    /// 当前 hart 是否开启了设备中断
    fn intr_get(&self) -> bool;

    /// 开启当前 hart 的设备中断
    fn intr_on(&self);

    /// 关闭当前 hart 的设备中断
    fn intr_off(&self);

    /// 返回当前 hart 的 [`Cpu`] 记录，必须禁用中断。
    fn cpu(&self) -> &Cpu;

    /// 单调递增的时钟滴答计数
    fn ticks(&self) -> u32;

    /// 让出当前 hart，调度其他进程运行，被重新调度后返回。
    fn yield_now(&self);

    /// 向控制台输出单个字节
    fn putc(&self, c: u8);
}

static PLATFORM: Once<&'static dyn Platform> = Once::new();

/// 注册平台实现。
///
/// 只有第一次调用生效，之后的调用被忽略。
/// 必须在任何锁、分配器或缓存被使用之前调用。
pub fn install(platform: &'static dyn Platform) {
    PLATFORM.call_once(|| platform);
}

/// 返回已注册的平台实现，未注册时 panic。
pub fn platform() -> &'static dyn Platform {
    match PLATFORM.get() {
        Some(p) => *p,
        None => panic!("cpu: platform not installed"),
    }
}

/// 当前 hart 的编号。必须禁用中断。
#[inline]
pub fn cpu_id() -> usize {
    platform().cpu_id()
}

/// 当前时钟滴答
#[inline]
pub fn ticks() -> u32 {
    platform().ticks()
}

/// 每个 hart 的中断嵌套状态。
///
/// - `noff`：`push_off` 的嵌套深度；
/// - `intena`：最外层 `push_off` 之前中断是否开启。
pub struct Cpu {
    noff: Cell<u8>,
    intena: Cell<bool>,
}

// 只有所属 hart 在关中断时才会访问
unsafe impl Sync for Cpu {}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            noff: Cell::new(0),
            intena: Cell::new(false),
        }
    }

    /// 当前 `push_off` 嵌套深度
    pub fn noff(&self) -> u8 {
        self.noff.get()
    }
}

/// 关闭中断并增加嵌套计数。
///
/// 与 `pop_off` 成对使用：两次 `push_off` 需要两次 `pop_off` 才能恢复中断，
/// 如果最外层 `push_off` 之前中断是关闭的，`pop_off` 之后依旧保持关闭。
pub fn push_off() {
    let p = platform();
    let old = p.intr_get();
    p.intr_off();
    let c = p.cpu();
    if c.noff.get() == 0 {
        c.intena.set(old);
    }
    c.noff.set(c.noff.get() + 1);
}

/// 减少嵌套计数，在最外层恢复 `push_off` 之前的中断状态。
pub fn pop_off() {
    let p = platform();
    if p.intr_get() {
        panic!("pop_off(): interruptable");
    }
    let c = p.cpu();
    let noff = match c.noff.get().checked_sub(1) {
        Some(noff) => noff,
        None => panic!("pop_off(): count not match"),
    };
    c.noff.set(noff);
    if noff == 0 && c.intena.get() {
        p.intr_on();
    }
}
