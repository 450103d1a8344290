//! 定义系统内核的输出方法

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu;
use crate::spinlock::SpinLock;

/// 内核是否已经 panic。由内核的 panic 处理函数设置，
/// 置位后输出不再加锁，避免持锁的 hart 崩溃后其他 hart 无法打印。
pub static PANICKED: AtomicBool = AtomicBool::new(false);

/// 零大小类型（ZST）的打印结构体，用于在多个 CPU 之间对打印操作进行排序。
struct Print;

impl Print {
    fn print(&self, c: u8) {
        cpu::platform().putc(c);
    }
}

impl fmt::Write for Print {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.print(byte);
        }
        Ok(())
    }
}

/// 核心打印函数（被宏调用）
///
/// # 功能说明
/// 根据系统状态决定是否加锁输出：
/// - 当系统处于panic状态时，直接输出（不加锁）
/// - 正常状态下使用自旋锁保证多核输出同步
#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    if PANICKED.load(Ordering::Relaxed) {
        // no need to lock
        let _ = Print.write_fmt(args);
    } else {
        let guard = PRINT.lock();
        let _ = Print.write_fmt(args);
        drop(guard);
    }
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}
