use std::time::Duration;

use crate::page::PagePool;

/// 默认页大小：16 KiB，与常见套接字接收窗口的单次读取量级一致。
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// 通道上下文的构造配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将读缓冲的页大小、初始容量、页预算与套接字 `SO_LINGER` 行为集中描述，
///   避免调用方在构造上下文时分别处理页池与 `socket2`；
/// - 一个选择器通常为其名下所有通道共享同一页池，因此页池由配置构建、由调用方克隆分发。
///
/// ## 核心逻辑（How）
/// - `page_size` 决定页池中每页的固定字节数，读缓冲只以整页增长；
/// - `initial_capacity` 在上下文构造时预先保证的容量，默认 0 表示首次读取时才分配；
/// - `max_pages` 为页池的租借上限，`None` 表示不设上限；
/// - `linger` 由 [`TcpRawChannel`](crate::TcpRawChannel) 通过 `socket2::SockRef::set_linger` 落地。
///
/// ## 契约说明（What）
/// - 所有 `with_*` 方法按值返回新配置，可链式调用；
/// - **前置条件**：`page_size` 为 0 时按 1 处理，保证增长总能取得进展；
/// - **后置条件**：`build_page_pool` 返回的页池页大小等于 `page_size()`。
#[derive(Clone, Debug)]
pub struct ChannelContextConfig {
    page_size: usize,
    initial_capacity: usize,
    max_pages: Option<usize>,
    linger: Option<Duration>,
}

impl ChannelContextConfig {
    pub const fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            initial_capacity: 0,
            max_pages: None,
            linger: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// 设置页池的租借上限。
    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn max_pages(&self) -> Option<usize> {
        self.max_pages
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    /// 按当前配置构建页池。
    pub fn build_page_pool(&self) -> PagePool {
        match self.max_pages {
            Some(limit) => PagePool::with_limit(self.page_size, limit),
            None => PagePool::new(self.page_size),
        }
    }
}

impl Default for ChannelContextConfig {
    fn default() -> Self {
        Self::new()
    }
}
