use std::{collections::VecDeque, fmt, mem, sync::Arc};

use spin::Mutex;

use crate::{error::NioError, flush::FlushOperation};

/// 生产者与选择器线程共享的收件箱。
///
/// `sealed` 与队列在同一把锁内修改：拆除流程一旦封箱，之后到达的操作不会再入队。
#[derive(Default)]
struct FlushInbox {
    state: Mutex<InboxState>,
}

#[derive(Default)]
struct InboxState {
    sealed: bool,
    operations: VecDeque<FlushOperation>,
}

/// 刷写队列的生产者端，可克隆并跨线程使用。
#[derive(Clone)]
pub struct FlushQueueProducer {
    inbox: Arc<FlushInbox>,
}

impl FlushQueueProducer {
    /// 将操作追加到队尾，立即返回。
    ///
    /// 队列已被拆除流程封箱时，操作在当前线程立即以 `ChannelClosed` 失败，
    /// 并向调用方返回同一错误。
    pub fn offer(&self, operation: FlushOperation) -> Result<(), NioError> {
        let rejected = {
            let mut state = self.inbox.state.lock();
            if state.sealed {
                Some(operation)
            } else {
                state.operations.push_back(operation);
                None
            }
        };
        match rejected {
            Some(operation) => {
                operation.fail(NioError::ChannelClosed);
                Err(NioError::ChannelClosed)
            }
            None => Ok(()),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.inbox.state.lock().sealed
    }
}

impl fmt::Debug for FlushQueueProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushQueueProducer")
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

/// 多生产者、单消费者的有序刷写队列。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 任意线程都可以提交待写数据，而真正的写出只发生在通道所属的选择器线程；
/// - 同一通道上的操作必须严格按提交顺序完成，前一个操作未写完时不得尝试后一个。
///
/// ## 逻辑 (How)
/// - 生产者经 [`FlushQueueProducer::offer`] 在短临界区内入队（`spin::Mutex`，竞争很低）；
/// - 消费者持有 `current` 槽位：`peek` 在槽位为空时从收件箱弹出队首，
///   部分写出的操作留在槽位中，下一轮刷写从断点继续；
/// - 所有监听器都在锁外触发，监听器中再次入队不会死锁。
///
/// ## 契约 (What)
/// - 任意时刻至多一个“当前”操作；
/// - `poll` 移除当前操作并以成功触发其监听器；`fail_current` 以给定错误移除并通知；
///   二者只作用于 `peek` 取出的当前操作；
/// - `seal_and_fail` 封箱后按 FIFO 顺序（当前操作在前）以同一错误失败全部排队操作，
///   之后的 `offer` 一律立即失败；消费端被丢弃时自动执行同样的封箱。
///
/// ## 注意事项 (Trade-offs)
/// - 消费端方法需要 `&mut self`，由通道上下文独占持有，天然只在选择器线程调用。
pub struct PendingFlushQueue {
    inbox: Arc<FlushInbox>,
    current: Option<FlushOperation>,
}

impl PendingFlushQueue {
    pub fn new() -> Self {
        Self {
            inbox: Arc::new(FlushInbox::default()),
            current: None,
        }
    }

    pub fn producer(&self) -> FlushQueueProducer {
        FlushQueueProducer {
            inbox: Arc::clone(&self.inbox),
        }
    }

    /// 选择器线程上的入队捷径，语义与生产者端一致。
    pub fn offer(&self, operation: FlushOperation) -> Result<(), NioError> {
        self.producer().offer(operation)
    }

    /// 返回当前操作，必要时从收件箱取出下一个。
    pub fn peek(&mut self) -> Option<&mut FlushOperation> {
        if self.current.is_none() {
            self.current = self.inbox.state.lock().operations.pop_front();
        }
        self.current.as_mut()
    }

    /// 移除当前操作并触发其成功回调。
    ///
    /// 只作用于 `peek` 已取出的当前操作；槽位为空时返回 `false`，收件箱中尚未写出的操作不受影响。
    pub fn poll(&mut self) -> bool {
        match self.current.take() {
            Some(operation) => {
                operation.complete();
                true
            }
            None => false,
        }
    }

    /// 以 `error` 移除当前操作并触发其失败回调；槽位为空时返回 `false`。
    pub fn fail_current(&mut self, error: NioError) -> bool {
        match self.current.take() {
            Some(operation) => {
                operation.fail(error);
                true
            }
            None => false,
        }
    }

    /// 封箱并以 `error` 失败全部排队操作，返回失败的操作数。
    pub fn seal_and_fail(&mut self, error: NioError) -> usize {
        let drained = {
            let mut state = self.inbox.state.lock();
            state.sealed = true;
            mem::take(&mut state.operations)
        };
        let mut failed = 0;
        for operation in self.current.take().into_iter().chain(drained) {
            operation.fail(error.clone());
            failed += 1;
        }
        failed
    }

    pub fn has_pending(&self) -> bool {
        self.current.is_some() || !self.inbox.state.lock().operations.is_empty()
    }

    pub fn len(&self) -> usize {
        usize::from(self.current.is_some()) + self.inbox.state.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    pub fn is_sealed(&self) -> bool {
        self.inbox.state.lock().sealed
    }
}

/// 消费端被丢弃而未经拆除时同样封箱，生产者句柄之后的提交立即失败。
impl Drop for PendingFlushQueue {
    fn drop(&mut self) {
        if !self.is_sealed() {
            self.seal_and_fail(NioError::ChannelClosed);
        }
    }
}

impl Default for PendingFlushQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PendingFlushQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingFlushQueue")
            .field("current", &self.current)
            .field("len", &self.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
