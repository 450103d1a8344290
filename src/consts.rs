//! 内核常量：页大小、硬件线程数量以及块缓存容量

/// 页大小（字节）
pub const PGSIZE: usize = 4096;

/// 最大硬件线程（hart）数量，每个 hart 拥有一个独立的空闲页池
pub const NCPU: usize = 8;

/// `kfree` 回收页时填充的垃圾字节，用于捕获悬垂引用
pub const JUNK_FREE: u8 = 1;
/// `kalloc` 分配页时填充的垃圾字节，用于捕获未初始化读取
pub const JUNK_ALLOC: u8 = 5;

pub mod fs {
    /// 磁盘块大小（字节）
    pub const BSIZE: usize = 1024;

    /// 单个文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;

    /// 缓冲区缓存中的缓冲块数量
    pub const NBUF: usize = MAXOPBLOCKS * 3;

    /// 缓冲区缓存的哈希桶数量，取素数以分散块号
    pub const NBUCKET: usize = 13;
}
