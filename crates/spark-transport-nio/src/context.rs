use std::{fmt, io, sync::Arc};

//
// 教案级说明：关闭标记是唯一跨线程竞争的状态。启用 `--cfg loom` 时切换到 Loom 的原子类型，
// 让模型检查覆盖并发 `close_channel` 的全部交错；常规构建保持标准库实现。
#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicBool, Ordering};
#[cfg(not(any(loom, spark_loom)))]
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace, warn};

use crate::{
    buffer::InboundChannelBuffer,
    config::ChannelContextConfig,
    error::{self, NioError, is_would_block, map_io_error},
    flush::FlushOperation,
    handler::ReadWriteHandler,
    page::PagePool,
    queue::{FlushQueueProducer, PendingFlushQueue},
    selector::{ChannelId, SelectorHandle},
    transport::RawChannel,
};

/// 通道的生命周期阶段。
///
/// `Open → Closing` 由任意线程通过关闭标记的 CAS 触发一次；
/// `Closing → Closed` 只在所属选择器线程执行拆除时发生。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

/// 生产者线程与选择器线程共享的通道状态。
struct ChannelShared {
    id: ChannelId,
    is_closing: AtomicBool,
    selector: Arc<dyn SelectorHandle>,
    flushes: FlushQueueProducer,
}

impl ChannelShared {
    fn is_closing(&self) -> bool {
        self.is_closing.load(Ordering::Acquire)
    }

    /// 首个把关闭标记从 `false` 置为 `true` 的调用者负责把拆除排入所属循环。
    fn request_close(&self) -> bool {
        let first = self
            .is_closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            debug!(channel = %self.id, "channel close requested");
            self.selector.queue_channel_close(self.id);
        }
        first
    }

    fn queue_write(&self, operation: FlushOperation) -> Result<(), NioError> {
        self.flushes.offer(operation)?;
        self.selector.wakeup();
        Ok(())
    }
}

/// 通道的跨线程句柄：提交刷写与请求关闭。
///
/// 句柄可以自由克隆并发送到任意线程；它不会触碰读缓冲或执行任何 IO。
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<ChannelShared>,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// 提交刷写操作并唤醒所属选择器。
    ///
    /// 拆除已开始时操作会立即以 `ChannelClosed` 失败。
    pub fn queue_write(&self, operation: FlushOperation) -> Result<(), NioError> {
        self.shared.queue_write(operation)
    }

    /// 幂等地请求关闭，只有第一次调用会安排拆除。
    pub fn close_channel(&self) {
        self.shared.request_close();
    }

    pub fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.shared.id)
            .field("is_closing", &self.shared.is_closing())
            .finish()
    }
}

/// 单个通道的字节上下文：读取、刷写与关闭协调。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把选择器给出的“可读/可写”就绪事件转换为有序、正确缓冲的应用数据；
/// - 同一通道的状态只在所属选择器线程上变更：读写与拆除互不并发，因此读缓冲与
///   刷写逻辑无需任何锁；其它线程只能提交刷写或请求关闭。
///
/// ## 逻辑 (How)
/// - `read`：缓冲无剩余空间时多要一个字节以强制追加新页 → 一次分散读 →
///   0 字节直接返回 → 推进索引 → 交给处理器消费并释放已消费前缀；
/// - `flush_channel`：在“上一个操作已写完且仍有操作”时循环，每个操作一次聚集写；
///   写完则出队并回调成功，部分写出则记录进度并让出，IO 失败则回调失败、出队并上抛；
/// - `close_channel`：关闭标记 CAS 成功者调用 `queue_channel_close`；
/// - `close_from_selector`：在所属线程上执行真正的拆除。
///
/// ## 契约 (What)
/// - 所有 `&mut self` 方法只能在所属选择器线程调用，入口处以 debug 断言检查；
/// - “可能阻塞”被吸收为 0 字节；其它 IO 失败置位 `close_now` 后上抛；
/// - 拆除时所有仍在排队的刷写以 `ChannelClosed` 失败，之后提交的刷写立即失败。
///
/// ## 注意事项 (Trade-offs)
/// - 单次 `flush_channel` 在不遇到背压时会持续写出后续操作，以摊薄每次就绪事件的成本；
///   遇到部分写出立即让出，不在上下文内部自旋等待。
pub struct ChannelContext<C, H> {
    shared: Arc<ChannelShared>,
    raw: C,
    handler: H,
    buffer: InboundChannelBuffer,
    flushes: PendingFlushQueue,
    close_now: bool,
    closed: bool,
}

impl<C, H> ChannelContext<C, H>
where
    C: RawChannel,
    H: ReadWriteHandler,
{
    /// 创建处于 `Open` 状态的上下文。
    ///
    /// 读缓冲的页大小与页预算以 `pages` 为准，多个通道可以共享同一页池；
    /// `config` 只贡献初始容量。需要按配置建池时使用 [`ChannelContextConfig::build_page_pool`]。
    pub fn new(
        id: ChannelId,
        raw: C,
        handler: H,
        selector: Arc<dyn SelectorHandle>,
        pages: PagePool,
        config: &ChannelContextConfig,
    ) -> Result<Self, NioError> {
        let buffer = InboundChannelBuffer::with_capacity(pages, config.initial_capacity())?;
        let flushes = PendingFlushQueue::new();
        let shared = Arc::new(ChannelShared {
            id,
            is_closing: AtomicBool::new(false),
            selector,
            flushes: flushes.producer(),
        });
        Ok(Self {
            shared,
            raw,
            handler,
            buffer,
            flushes,
            close_now: false,
            closed: false,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// 返回可跨线程使用的句柄。
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 读取当前可得的字节并交给处理器，返回本次读取的字节数。
    ///
    /// 传输层遵循 `std::io` 约定：`Ok(0)` 表示对端已关闭并置位 `close_now`，
    /// 暂无数据必须以 `ErrorKind::WouldBlock` 报告，此时本方法返回 `Ok(0)` 且不改变状态。
    pub fn read(&mut self) -> Result<usize, NioError> {
        self.shared.selector.assert_on_selector_thread();
        if self.closed {
            return Err(NioError::ChannelClosed);
        }
        if self.buffer.remaining() == 0 {
            // 多要一个字节，保证分配新页而不是复用已写满的页。
            self.buffer.ensure_capacity(self.buffer.capacity() + 1)?;
        }

        let bytes_read = self.read_from_channel()?;
        if bytes_read == 0 {
            return Ok(0);
        }

        self.buffer.increment_index(bytes_read);
        self.handle_read_bytes()?;
        Ok(bytes_read)
    }

    fn read_from_channel(&mut self) -> Result<usize, NioError> {
        let id = self.shared.id;
        let index = self.buffer.index();
        let mut buffers = self.buffer.slice_buffers_from(index);
        let requested = !buffers.is_empty();
        match self.raw.read_from_channel(&mut buffers) {
            Ok(0) => {
                if requested {
                    debug!(channel = %id, "peer closed the channel");
                    self.close_now = true;
                }
                Ok(0)
            }
            Ok(bytes) => {
                trace!(channel = %id, bytes, "read from channel");
                Ok(bytes)
            }
            Err(err) if is_would_block(&err) => Ok(0),
            Err(err) => {
                warn!(channel = %id, error = %err, "channel read failed");
                self.close_now = true;
                Err(map_io_error(error::READ, err))
            }
        }
    }

    /// 让处理器反复消费，直到它不再取走字节或缓冲已空，随后收集它产生的刷写。
    fn handle_read_bytes(&mut self) -> Result<(), NioError> {
        while self.buffer.index() > 0 {
            let available = self.buffer.index();
            let consumed = self.handler.consume_reads(&self.buffer)?;
            if consumed > available {
                return Err(NioError::InvalidConsume {
                    consumed,
                    available,
                });
            }
            if consumed == 0 {
                break;
            }
            self.buffer.release(consumed);
        }

        for operation in self.handler.poll_flush_operations() {
            self.flushes.offer(operation)?;
        }
        Ok(())
    }

    /// 按提交顺序写出排队的刷写操作，遇到背压即让出。
    pub fn flush_channel(&mut self) -> Result<(), NioError> {
        self.shared.selector.assert_on_selector_thread();
        let id = self.shared.id;
        let mut last_op_completed = true;
        while last_op_completed {
            let Some(operation) = self.flushes.peek() else {
                break;
            };
            match single_flush(id, &mut self.raw, operation) {
                Ok(true) => {
                    self.flushes.poll();
                }
                Ok(false) => last_op_completed = false,
                Err(err) => {
                    self.close_now = true;
                    self.flushes.fail_current(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// 幂等地请求关闭；真正的拆除由所属循环调用 [`Self::close_from_selector`] 完成。
    pub fn close_channel(&self) {
        self.shared.request_close();
    }

    /// 所属循环每轮调用，判断是否应注销并拆除该通道。
    pub fn selector_should_close(&self) -> bool {
        self.close_now || self.shared.is_closing()
    }

    /// 在所属选择器线程上拆除通道，重复调用不做任何事。
    ///
    /// 拆除顺序：封箱并失败全部排队刷写 → 失败处理器尚未交出的刷写 → 关闭处理器 →
    /// 归还读缓冲页 → 关闭原始通道。中途的错误被记录，全部步骤执行完后返回第一个错误。
    pub fn close_from_selector(&mut self) -> Result<(), NioError> {
        self.shared.selector.assert_on_selector_thread();
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shared.is_closing.store(true, Ordering::Release);
        let id = self.shared.id;

        let mut failed = self.flushes.seal_and_fail(NioError::ChannelClosed);
        for operation in self.handler.poll_flush_operations() {
            operation.fail(NioError::ChannelClosed);
            failed += 1;
        }

        let mut first_error = None;
        if let Err(err) = self.handler.close() {
            warn!(channel = %id, error = %err, "handler close failed");
            first_error = Some(err);
        }
        self.buffer.close();
        if let Err(err) = self.raw.shutdown() {
            warn!(channel = %id, error = %err, "channel shutdown failed");
            first_error = first_error.or(Some(map_io_error(error::SHUTDOWN, err)));
        }

        debug!(channel = %id, failed_flushes = failed, "channel closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// 在所属线程上直接入队一个刷写操作。
    pub fn queue_write_operation(&self, operation: FlushOperation) -> Result<(), NioError> {
        self.flushes.offer(operation)
    }

    /// 是否仍有待写出的操作，所属循环据此维持写兴趣。
    pub fn ready_for_flush(&self) -> bool {
        !self.closed && self.flushes.has_pending()
    }

    pub fn has_queued_write_ops(&self) -> bool {
        self.flushes.has_pending()
    }

    pub fn state(&self) -> ChannelState {
        if self.closed {
            ChannelState::Closed
        } else if self.shared.is_closing() {
            ChannelState::Closing
        } else {
            ChannelState::Open
        }
    }

    /// 传输层是否已发出“立即关闭”信号（对端关闭或 IO 失败）。
    pub fn close_now(&self) -> bool {
        self.close_now
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn buffer(&self) -> &InboundChannelBuffer {
        &self.buffer
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn raw_channel(&self) -> &C {
        &self.raw
    }

    pub fn raw_channel_mut(&mut self) -> &mut C {
        &mut self.raw
    }
}

impl<C, H> fmt::Debug for ChannelContext<C, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("id", &self.shared.id)
            .field("is_closing", &self.shared.is_closing())
            .field("close_now", &self.close_now)
            .field("closed", &self.closed)
            .field("buffer", &self.buffer)
            .field("flushes", &self.flushes)
            .finish()
    }
}

/// 对单个操作执行一次聚集写，返回它是否已全部写出。
fn single_flush<C: RawChannel>(
    id: ChannelId,
    raw: &mut C,
    operation: &mut FlushOperation,
) -> Result<bool, NioError> {
    if operation.is_fully_flushed() {
        return Ok(true);
    }
    let written = {
        let buffers = operation.buffers_to_write();
        match raw.flush_to_channel(&buffers) {
            Ok(written) => written,
            Err(err) if is_would_block(&err) => 0,
            Err(err) => {
                warn!(channel = %id, error = %err, "channel write failed");
                return Err(map_io_error(error::WRITE, err));
            }
        }
    };
    let written = written.min(operation.remaining());
    trace!(
        channel = %id,
        written,
        remaining = operation.remaining() - written,
        "flushed to channel"
    );
    operation.increment_index(written);
    Ok(operation.is_fully_flushed())
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use std::{
        collections::VecDeque,
        io::{IoSlice, IoSliceMut},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering as StdOrdering},
        },
    };

    use bytes::Bytes;
    use tracing_test::traced_test;

    use super::*;

    #[derive(Default)]
    struct CountingSelector {
        closes: AtomicUsize,
    }

    impl SelectorHandle for CountingSelector {
        fn is_on_selector_thread(&self) -> bool {
            true
        }

        fn queue_channel_close(&self, _channel: ChannelId) {
            self.closes.fetch_add(1, StdOrdering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedChannel {
        inbound: VecDeque<io::Result<Vec<u8>>>,
        accept: VecDeque<io::Result<usize>>,
        sent: Vec<u8>,
    }

    impl RawChannel for ScriptedChannel {
        fn read_from_channel(&mut self, buffers: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
            let chunk = match self.inbound.pop_front() {
                Some(chunk) => chunk?,
                None => return Err(io::ErrorKind::WouldBlock.into()),
            };
            let mut copied = 0;
            for buffer in buffers.iter_mut() {
                let take = (chunk.len() - copied).min(buffer.len());
                buffer[..take].copy_from_slice(&chunk[copied..copied + take]);
                copied += take;
            }
            Ok(copied)
        }

        fn flush_to_channel(&mut self, buffers: &[IoSlice<'_>]) -> io::Result<usize> {
            let offered: usize = buffers.iter().map(|b| b.len()).sum();
            let accept = match self.accept.pop_front() {
                Some(accept) => accept?.min(offered),
                None => offered,
            };
            let mut left = accept;
            for buffer in buffers {
                let take = left.min(buffer.len());
                self.sent.extend_from_slice(&buffer[..take]);
                left -= take;
            }
            Ok(accept)
        }
    }

    fn context<H: ReadWriteHandler>(
        channel: ScriptedChannel,
        handler: H,
    ) -> (ChannelContext<ScriptedChannel, H>, Arc<CountingSelector>) {
        let selector = Arc::new(CountingSelector::default());
        let ctx = ChannelContext::new(
            ChannelId::new(1),
            channel,
            handler,
            selector.clone(),
            PagePool::new(8),
            &ChannelContextConfig::new(),
        )
        .expect("构造上下文失败");
        (ctx, selector)
    }

    fn consume_all(buffer: &InboundChannelBuffer) -> Result<usize, NioError> {
        Ok(buffer.index())
    }

    #[test]
    fn would_block_read_changes_nothing() {
        let (mut ctx, _) = context(ScriptedChannel::default(), consume_all);
        assert_eq!(ctx.read().expect("读取失败"), 0);
        assert_eq!(ctx.buffer().index(), 0);
        assert!(!ctx.close_now());
    }

    #[test]
    fn end_of_stream_marks_close_now() {
        let channel = ScriptedChannel {
            inbound: VecDeque::from([Ok(Vec::new())]),
            ..ScriptedChannel::default()
        };
        let (mut ctx, selector) = context(channel, consume_all);
        assert_eq!(ctx.read().expect("读取失败"), 0);
        assert!(ctx.close_now());
        assert!(ctx.selector_should_close());
        assert_eq!(selector.closes.load(StdOrdering::SeqCst), 0, "EOF 不经过关闭请求");
    }

    #[test]
    fn handler_consuming_too_much_is_rejected() {
        let channel = ScriptedChannel {
            inbound: VecDeque::from([Ok(b"abc".to_vec())]),
            ..ScriptedChannel::default()
        };
        let greedy =
            |buffer: &InboundChannelBuffer| -> Result<usize, NioError> { Ok(buffer.index() + 1) };
        let (mut ctx, _) = context(channel, greedy);
        let err = ctx.read().expect_err("超额消费必须失败");
        assert!(matches!(
            err,
            NioError::InvalidConsume {
                consumed: 4,
                available: 3
            }
        ));
    }

    #[test]
    fn empty_operation_completes_without_a_write() {
        let (mut ctx, _) = context(ScriptedChannel::default(), consume_all);
        let done = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&done);
        ctx.queue_write_operation(FlushOperation::new(Vec::new(), move |result| {
            *sink.lock().expect("锁中毒") = Some(result.is_ok());
        }))
        .expect("入队失败");
        ctx.flush_channel().expect("刷写失败");
        assert_eq!(*done.lock().expect("锁中毒"), Some(true));
        assert!(ctx.raw_channel().sent.is_empty());
    }

    #[test]
    fn write_failure_sets_close_now() {
        let channel = ScriptedChannel {
            accept: VecDeque::from([Err(io::Error::from(io::ErrorKind::BrokenPipe))]),
            ..ScriptedChannel::default()
        };
        let (mut ctx, _) = context(channel, consume_all);
        ctx.queue_write_operation(FlushOperation::without_listener(vec![Bytes::from_static(b"x")]))
            .expect("入队失败");
        let err = ctx.flush_channel().expect_err("写失败必须上抛");
        assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
        assert!(ctx.close_now());
        assert!(!ctx.has_queued_write_ops());
    }

    #[test]
    fn state_follows_close_request_and_teardown() {
        let (mut ctx, selector) = context(ScriptedChannel::default(), consume_all);
        assert_eq!(ctx.state(), ChannelState::Open);
        ctx.close_channel();
        assert_eq!(ctx.state(), ChannelState::Closing);
        ctx.close_from_selector().expect("拆除失败");
        assert_eq!(ctx.state(), ChannelState::Closed);
        ctx.close_channel();
        assert_eq!(selector.closes.load(StdOrdering::SeqCst), 1);
        assert!(ctx.read().expect_err("关闭后不得读取").is_closed());
    }

    #[test]
    fn teardown_without_request_suppresses_later_close_requests() {
        let (mut ctx, selector) = context(ScriptedChannel::default(), consume_all);
        ctx.close_from_selector().expect("拆除失败");
        ctx.handle().close_channel();
        assert_eq!(selector.closes.load(StdOrdering::SeqCst), 0);
    }

    #[test]
    #[traced_test]
    fn close_request_and_teardown_are_logged() {
        let (mut ctx, _) = context(ScriptedChannel::default(), consume_all);
        ctx.queue_write_operation(FlushOperation::without_listener(vec![Bytes::from_static(b"x")]))
            .expect("入队失败");
        ctx.handle().close_channel();
        ctx.close_from_selector().expect("拆除失败");
        assert!(logs_contain("channel close requested"));
        assert!(logs_contain("failed_flushes=1"));
    }

    #[test]
    fn page_pool_governs_buffer_pages_over_config() {
        let selector: Arc<dyn SelectorHandle> = Arc::new(CountingSelector::default());
        let config = ChannelContextConfig::new()
            .with_page_size(4096)
            .with_initial_capacity(1);
        let ctx = ChannelContext::new(
            ChannelId::new(9),
            ScriptedChannel::default(),
            consume_all,
            selector,
            PagePool::new(8),
            &config,
        )
        .expect("构造上下文失败");
        assert_eq!(ctx.buffer().page_size(), 8);
        assert_eq!(ctx.buffer().capacity(), 8, "初始容量按页池的页大小取整");
    }
}
