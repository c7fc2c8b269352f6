use std::{collections::VecDeque, fmt, io::IoSliceMut};

use tracing::trace;

use crate::{
    error::NioError,
    page::{Page, PagePool},
};

/// 页式、只追加的入站字节缓冲。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 非阻塞读取每次只返回“当前可得”的字节，协议层往往需要跨多次读取才能凑齐一帧；
///   缓冲需在不搬移已读字节的前提下按需扩容。
/// - 以固定大小的页为单位增长：扩容只在尾部追加新页，既有页的内存地址不变，
///   交给传输层的读目标与交给业务的只读视图都不会因扩容而失效或被复制。
///
/// ## 逻辑 (How)
/// - `pages`：按顺序排列的页，首页可能有 `offset` 字节已被释放；
/// - `capacity = pages.len() * page_size - offset`，即从逻辑起点可容纳的字节数；
/// - `index`：已写入且尚未释放的字节数，`[0, index)` 为可读数据，`[index, capacity)` 为可写空间；
/// - `release(n)` 丢弃已消费前缀：整页归还页池，首页内偏移前移，`capacity` 与 `index` 同步减少。
///
/// ## 契约 (What)
/// - 不变量：`0 <= index <= capacity`，`remaining = capacity - index`；
/// - `ensure_capacity` 只追加整页、从不收缩；页池拒绝时返回 `ResourceExhausted`，已追加的页保留；
/// - `increment_index(n)` 的前置条件是 `n <= remaining()`；
/// - `release(n)` 的前置条件是 `n <= index()`；
/// - **后置条件**：`close` 之后所有页归还页池，后续扩容返回 `ChannelClosed`。
///
/// ## 注意事项 (Trade-offs)
/// - 页不保证连续，读写均以多段切片形式暴露，调用方需支持分散/聚集 IO；
/// - 消费者若长期不消费，缓冲会持续向页池租页，页池预算是唯一的上限。
pub struct InboundChannelBuffer {
    pages: VecDeque<Page>,
    pool: PagePool,
    page_size: usize,
    offset: usize,
    capacity: usize,
    index: usize,
    closed: bool,
}

impl InboundChannelBuffer {
    /// 创建空缓冲，首次扩容时才向页池租页。
    pub fn new(pool: PagePool) -> Self {
        let page_size = pool.page_size();
        Self {
            pages: VecDeque::new(),
            pool,
            page_size,
            offset: 0,
            capacity: 0,
            index: 0,
            closed: false,
        }
    }

    /// 创建并预先保证 `initial_capacity` 字节的容量。
    pub fn with_capacity(pool: PagePool, initial_capacity: usize) -> Result<Self, NioError> {
        let mut buffer = Self::new(pool);
        buffer.ensure_capacity(initial_capacity)?;
        Ok(buffer)
    }

    /// 保证 `capacity() >= required`，不足时按整页追加。
    pub fn ensure_capacity(&mut self, required: usize) -> Result<(), NioError> {
        if self.closed {
            return Err(NioError::ChannelClosed);
        }
        let before = self.pages.len();
        while self.capacity < required {
            let page = self.pool.acquire()?;
            self.pages.push_back(page);
            self.capacity += self.page_size;
        }
        if self.pages.len() != before {
            trace!(
                added_pages = self.pages.len() - before,
                capacity = self.capacity,
                "inbound buffer grew"
            );
        }
        Ok(())
    }

    /// 返回从 `from` 起的全部可写空间，供一次分散读使用。
    ///
    /// `from == capacity()` 时返回空列表。
    pub fn slice_buffers_from(&mut self, from: usize) -> Vec<IoSliceMut<'_>> {
        assert!(
            from <= self.capacity,
            "slice start {from} exceeds capacity {}",
            self.capacity
        );
        if from == self.capacity {
            return Vec::new();
        }
        let absolute = self.offset + from;
        let first = absolute / self.page_size;
        let within = absolute % self.page_size;
        self.pages
            .iter_mut()
            .skip(first)
            .enumerate()
            .map(|(position, page)| {
                let start = if position == 0 { within } else { 0 };
                IoSliceMut::new(&mut page[start..])
            })
            .collect()
    }

    /// 返回 `[0, to)` 的只读视图，可能跨越多页。
    pub fn slice_buffers_to(&self, to: usize) -> Vec<&[u8]> {
        assert!(
            to <= self.capacity,
            "slice end {to} exceeds capacity {}",
            self.capacity
        );
        let mut left = to;
        let mut slices = Vec::new();
        for (position, page) in self.pages.iter().enumerate() {
            if left == 0 {
                break;
            }
            let start = if position == 0 { self.offset } else { 0 };
            let take = left.min(page.len() - start);
            slices.push(&page[start..start + take]);
            left -= take;
        }
        slices
    }

    /// 当前可读（已写入、未释放）的字节视图。
    pub fn readable(&self) -> Vec<&[u8]> {
        self.slice_buffers_to(self.index)
    }

    /// 将可读字节复制到新的 `Vec`，便于测试或小帧解析。
    pub fn readable_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.index);
        for slice in self.readable() {
            out.extend_from_slice(slice);
        }
        out
    }

    /// 传输层写入 `count` 字节后推进索引。
    pub fn increment_index(&mut self, count: usize) {
        debug_assert!(
            count <= self.remaining(),
            "increment_index({count}) exceeds remaining {}",
            self.remaining()
        );
        self.index += count.min(self.remaining());
    }

    /// 丢弃前 `count` 个已消费字节，完整的页归还页池。
    pub fn release(&mut self, count: usize) {
        assert!(
            count <= self.index,
            "cannot release {count} bytes, only {} are readable",
            self.index
        );
        if count == 0 {
            return;
        }
        let absolute = self.offset + count;
        let released_pages = absolute / self.page_size;
        self.pages.drain(..released_pages);
        self.offset = absolute % self.page_size;
        self.capacity -= count;
        self.index -= count;
    }

    /// 归还全部页，之后的扩容请求返回 `ChannelClosed`。
    pub fn close(&mut self) {
        self.closed = true;
        self.pages.clear();
        self.offset = 0;
        self.capacity = 0;
        self.index = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.index
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl fmt::Debug for InboundChannelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundChannelBuffer")
            .field("pages", &self.pages.len())
            .field("page_size", &self.page_size)
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .field("index", &self.index)
            .field("closed", &self.closed)
            .finish()
    }
}
