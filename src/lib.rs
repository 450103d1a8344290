//! xv6 内核的物理页分配器与块缓存
//!
//! 内核在启动早期通过 [`cpu::install`] 注册平台实现，之后即可使用
//! [`mm::Kmem`] 分配物理页、使用 [`fs::Bcache`] 读写磁盘块。

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

extern crate alloc;

#[macro_use]
pub mod printf;

pub mod consts;
pub mod cpu;
pub mod driver;
pub mod fs;
pub mod mm;
pub mod sleeplock;
pub mod spinlock;

#[cfg(test)]
mod testing;
