use std::{
    fmt, mem,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use bytes::BytesMut;
use spin::Mutex;

use crate::error::NioError;

/// `PagePool` 以自由链表复用固定大小的读缓冲页，减少每次扩容时的堆分配。
///
/// # 模块角色（Why）
/// - 读缓冲只以整页增长，页的生命周期与通道解耦：通道释放已消费前缀或关闭时，
///   页通过 [`Page`] 的 `Drop` 自动回到池中，由同一选择器下的其它通道复用；
/// - 通过可选的页预算把“内存耗尽”变成可观测、可传播的 [`NioError::ResourceExhausted`]，
///   而不是在分配器内部直接中止进程。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<BytesMut>>` 作为自由链表，租借时优先弹出已有页；
/// - `leased_pages` 以 `fetch_update` 实现“检查预算并占位”的原子步骤，并发租借不会越过上限；
/// - `PoolMetrics` 以原子计数跟踪已分配页、租出页、空闲页与失败次数，供 `statistics` 快照使用。
///
/// # 契约说明（What）
/// - **线程安全**：池可被克隆并在多个线程间共享，满足 `Send + Sync + 'static`；
/// - **后置条件**：`acquire` 成功返回的页长度恒等于 `page_size()`；
/// - **失败语义**：预算耗尽时返回 `ResourceExhausted`，并累加 `failed_acquisitions`。
///
/// # 设计权衡（Trade-offs）
/// - 复用页不清零：页只作为读目标，读入的字节会覆盖旧内容，业务只会看到索引之前的字节；
/// - `shrink_to_fit` 采取“清空自由链表”的简单策略，便于在流量峰值后归还内存。
#[derive(Clone)]
pub struct PagePool {
    inner: Arc<PoolInner>,
}

impl PagePool {
    /// 创建不设预算的页池。
    pub fn new(page_size: usize) -> Self {
        Self::build(page_size, None)
    }

    /// 创建最多同时租出 `max_pages` 页的页池。
    pub fn with_limit(page_size: usize, max_pages: usize) -> Self {
        Self::build(page_size, Some(max_pages))
    }

    fn build(page_size: usize, max_pages: Option<usize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                page_size: page_size.max(1),
                max_pages,
                free_list: Mutex::new(Vec::new()),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn max_pages(&self) -> Option<usize> {
        self.inner.max_pages
    }

    /// 租借一页。
    pub fn acquire(&self) -> Result<Page, NioError> {
        let bytes = self.inner.acquire_page()?;
        Ok(Page {
            bytes,
            pool: Arc::clone(&self.inner),
        })
    }

    /// 清空自由链表，返回归还给分配器的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }

    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("page_size", &self.inner.page_size)
            .field("max_pages", &self.inner.max_pages)
            .field("stats", &self.inner.snapshot())
            .finish()
    }
}

/// 页池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub page_size: usize,
    pub allocated_pages: usize,
    pub leased_pages: usize,
    pub free_pages: usize,
    pub failed_acquisitions: u64,
}

/// 从页池租出的一页固定大小内存。
///
/// 页在移动时只移动句柄，底层内存地址保持不变；`Drop` 时归还所属页池。
pub struct Page {
    bytes: BytesMut,
    pool: Arc<PoolInner>,
}

impl Deref for Page {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("len", &self.bytes.len()).finish()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let bytes = mem::take(&mut self.bytes);
        self.pool.reclaim(bytes);
    }
}

struct PoolInner {
    page_size: usize,
    max_pages: Option<usize>,
    free_list: Mutex<Vec<BytesMut>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    /// 在预算内占位后，从自由链表或堆上取得一页。
    fn acquire_page(&self) -> Result<BytesMut, NioError> {
        let limit = self.max_pages;
        let reserved = self.metrics.leased_pages.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |leased| match limit {
                Some(limit) if leased >= limit => None,
                _ => Some(leased + 1),
            },
        );
        if let Err(leased) = reserved {
            self.metrics
                .failed_acquisitions
                .fetch_add(1, Ordering::Relaxed);
            return Err(NioError::ResourceExhausted {
                leased,
                limit: limit.unwrap_or(leased),
            });
        }

        let reused = self.free_list.lock().pop();
        match reused {
            Some(page) => {
                saturating_sub(&self.metrics.free_pages, 1);
                Ok(page)
            }
            None => {
                self.metrics.allocated_pages.fetch_add(1, Ordering::Relaxed);
                Ok(BytesMut::zeroed(self.page_size))
            }
        }
    }

    fn reclaim(&self, page: BytesMut) {
        saturating_sub(&self.metrics.leased_pages, 1);
        if page.len() == self.page_size {
            self.free_list.lock().push(page);
            self.metrics.free_pages.fetch_add(1, Ordering::Relaxed);
        } else {
            saturating_sub(&self.metrics.allocated_pages, 1);
        }
    }

    fn shrink_free_list(&self) -> usize {
        let released = {
            let mut list = self.free_list.lock();
            mem::take(&mut *list)
        };
        let count = released.len();
        saturating_sub(&self.metrics.free_pages, count);
        saturating_sub(&self.metrics.allocated_pages, count);
        count * self.page_size
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            page_size: self.page_size,
            allocated_pages: self.metrics.allocated_pages.load(Ordering::Relaxed),
            leased_pages: self.metrics.leased_pages.load(Ordering::Acquire),
            free_pages: self.metrics.free_pages.load(Ordering::Relaxed),
            failed_acquisitions: self.metrics.failed_acquisitions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_pages: AtomicUsize,
    leased_pages: AtomicUsize,
    free_pages: AtomicUsize,
    failed_acquisitions: AtomicU64,
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(value))
    });
}
