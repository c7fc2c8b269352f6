use std::{
    fmt,
    sync::OnceLock,
    thread::{self, ThreadId},
};

/// 通道在所属选择器内的标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nio-{}", self.0)
    }
}

/// 通道上下文对所属事件循环的最小依赖。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 读、刷写与最终拆除只能在拥有该通道的选择器线程上执行，这条规则替代了锁；
///   上下文需要一个能回答“我是否在所属线程上”的句柄，以及把拆除排入该线程的入口。
///
/// ## 契约 (What)
/// - `is_on_selector_thread`：当前线程是否为所属选择器线程；
/// - `assert_on_selector_thread`：契约检查，仅在 debug 构建中断言，release 构建不产生分支；
/// - `queue_channel_close`：把通道拆除排入所属循环，可从任意线程调用且不得阻塞；
/// - `wakeup`：有新的刷写操作入队时调用，默认不做任何事。
/// - **前置条件**：实现必须 `Send + Sync`，生产者线程会通过通道句柄并发调用。
pub trait SelectorHandle: Send + Sync + 'static {
    fn is_on_selector_thread(&self) -> bool;

    fn assert_on_selector_thread(&self) {
        debug_assert!(
            self.is_on_selector_thread(),
            "channel operation must run on its selector thread"
        );
    }

    fn queue_channel_close(&self, channel: ChannelId);

    fn wakeup(&self) {}
}

/// 记录选择器线程身份的令牌。
///
/// 事件循环在线程启动时调用一次 [`OwnerThread::bind_current`]，
/// 之后任何线程都可以通过 [`OwnerThread::is_current`] 判断自身是否为所属线程。
#[derive(Debug, Default)]
pub struct OwnerThread {
    owner: OnceLock<ThreadId>,
}

impl OwnerThread {
    pub const fn new() -> Self {
        Self {
            owner: OnceLock::new(),
        }
    }

    /// 将调用线程登记为所属线程；已登记时返回 `false`。
    pub fn bind_current(&self) -> bool {
        self.owner.set(thread::current().id()).is_ok()
    }

    pub fn is_current(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner.get().copied()
    }
}
