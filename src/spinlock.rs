//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::cpu::{self, pop_off, push_off};

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的CPU将在循环中等待，直到锁被释放。
/// 持有期间当前 hart 的中断被关闭，因此临界区必须短小且不可睡眠。
/// 该锁还跟踪持有锁的CPU ID，用于调试和死锁检测。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `cpuid`: 当前持有锁的CPU ID（-1表示无CPU持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断（防止死锁）；
    /// 2. 检查是否已持有锁（防止重入）；
    /// 3. 通过原子操作忙等待直到获取锁；
    /// 4. 设置内存屏障确保操作顺序；
    /// 5. 记录当前CPU ID；
    /// 6. 返回守卫对象。
    ///
    /// # 示例
    /// ```ignore
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 尝试获取自旋锁，只尝试一次，不会忙等待。
    ///
    /// # 功能说明
    /// 用于不能无条件等待的场景：调用者已经持有其他锁，
    /// 而目标锁的持有者可能反过来等待调用者持有的锁。
    /// 获取失败时恢复中断状态并返回 `None`，由调用者决定重试或退避。
    ///
    /// # 返回值
    /// - `Some(guard)`：成功获取锁；
    /// - `None`：锁正被其他 hart 持有。
    ///
    /// # 可能的错误
    /// 当前 hart 已持有该锁时 panic，与 `lock` 相同。
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        if self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Relaxed).is_err() {
            pop_off();
            return None;
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(cpu::cpu_id() as isize, Ordering::Relaxed);
        Some(SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        })
    }

    /// 检查当前CPU是否持有此锁（内部方法）。
    ///
    /// # 前提条件
    /// - 中断必须已禁用（由`push_off`保证）；
    fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == cpu::cpu_id() as isize
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断；
    /// 2. 检查是否已持有锁（防止死锁）；
    /// 3. 使用原子比较交换（CAS）忙等待获取锁；
    /// 4. 获取成功后设置内存屏障；
    /// 5. 记录当前CPU ID。
    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Relaxed).is_err() {
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(cpu::cpu_id() as isize, Ordering::Relaxed);
    }

    /// 释放锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 验证当前CPU确实持有锁；
    /// 2. 清除CPU ID记录；
    /// 3. 设置内存屏障确保操作顺序；
    /// 4. 原子存储`false`释放锁；
    /// 5. 调用`pop_off()`恢复中断状态。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁，
    /// 并恢复中断状态（通过`pop_off`）
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 检查当前CPU是否持有此锁，用于调试验证。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

/// 从spin crate借鉴 (https://crates.io/crates/spin)
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn smoke() {
        let _serial = testing::setup();
        let m = SpinLock::new((), "smoke");
        m.lock();
        m.lock();
    }

    #[test]
    fn guard_gives_exclusive_access() {
        let _serial = testing::setup();
        let m = SpinLock::new(0usize, "counter");
        {
            let mut guard = m.lock();
            *guard += 42;
            assert!(guard.holding());
            assert_eq!(cpu::platform().cpu().noff(), 1);
        }
        assert_eq!(*m.lock(), 42);
        assert_eq!(cpu::platform().cpu().noff(), 0);
    }

    #[test]
    fn try_lock_fails_while_another_hart_holds() {
        let _serial = testing::setup();
        let m = SpinLock::new(7u32, "try");
        let guard = m.lock();
        std::thread::scope(|s| {
            s.spawn(|| {
                testing::on_cpu(1, || {
                    assert!(m.try_lock().is_none());
                    assert_eq!(cpu::platform().cpu().noff(), 0);
                });
            });
        });
        drop(guard);
        assert_eq!(*m.try_lock().unwrap(), 7);
    }

    #[test]
    #[should_panic(expected = "spinlock relock acquire")]
    fn relock_on_same_hart_is_fatal() {
        let _serial = testing::setup();
        let m = SpinLock::new((), "relock");
        let _guard = m.lock();
        let _again = m.lock();
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let _serial = testing::setup();
        let m = SpinLock::new(0usize, "inc");
        std::thread::scope(|s| {
            for id in 1..5 {
                let m = &m;
                s.spawn(move || {
                    testing::on_cpu(id, || {
                        for _ in 0..1000 {
                            *m.lock() += 1;
                        }
                    });
                });
            }
        });
        assert_eq!(*m.lock(), 4000);
    }
}
