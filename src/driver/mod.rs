//! 设备驱动接口
//!
//! 块缓存只通过 [`BlockDevice`] 访问磁盘，具体的驱动（例如 virtio 磁盘）由内核提供。

use crate::fs::BufData;

/// 块设备，每次同步传输一个 `BSIZE` 字节的块。
pub trait BlockDevice: Sync {
    /// 读写设备 `dev` 上的第 `blockno` 块。
    ///
    /// - `writing == false`：把块内容读入 `data`；
    /// - `writing == true`：把 `data` 写到块上。
    ///
    /// 返回时传输已经完成。调用者持有该缓冲块的睡眠锁，驱动可以在等待中断时让出 hart。
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool);
}
