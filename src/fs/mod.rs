//! 文件系统模块，目前只包含位于块设备之上的缓存层

pub mod bio;

pub use bio::{Bcache, Buf, BufData};
