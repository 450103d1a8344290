//! 睡眠锁模块
//! 提供可长时间持有的互斥锁，持有者可以在持锁期间让出处理器（例如等待磁盘 I/O）。
//!
//! 当锁被占用时，尝试获取锁的进程会让出当前 hart，避免在关中断的状态下忙等待。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu;
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，持有睡眠锁时中断保持开启，持有者可以被调度出去；
/// 等待者在锁被占用时释放内部自旋锁并调用 [`cpu::Platform::yield_now`]，
/// 直到锁被释放。适用于可能长时间持有的锁。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`状态的访问
/// - `locked`: 表示锁是否已被占用
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：释放内部自旋锁，让出 hart，被重新调度后再次检查
    ///   - 如果未锁定：设置`locked=true`
    /// 3. 释放内部自旋锁（因已设置locked状态）并返回守卫
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.load(Ordering::Relaxed) {
            drop(guard);
            cpu::platform().yield_now();
            guard = self.lock.lock();
        }

        self.locked.store(true, Ordering::Relaxed);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() }
        }
    }

    /// 锁当前是否被占用
    pub fn is_locked(&self) -> bool {
        let _guard = self.lock.lock();
        self.locked.load(Ordering::Relaxed)
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    fn unlock(&self) {
        let guard = self.lock.lock();
        if !self.locked.load(Ordering::Relaxed) {
            panic!("sleeplock {} release", self.name);
        }
        self.locked.store(false, Ordering::Relaxed);
        drop(guard);
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 守卫对应的睡眠锁是否仍处于锁定状态
    pub fn holding(&self) -> bool {
        self.lock.is_locked()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
