use std::{borrow::Cow, io, sync::Arc};

use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const READ: OperationKind = OperationKind {
    code: "spark.transport.nio.read_failed",
    message: "nio read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "spark.transport.nio.write_failed",
    message: "nio write",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.transport.nio.shutdown_failed",
    message: "nio shutdown",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.nio.configure_failed",
    message: "nio configure",
};

const CHANNEL_CLOSED_CODE: &str = "spark.transport.nio.channel_closed";
const RESOURCE_EXHAUSTED_CODE: &str = "spark.transport.nio.resource_exhausted";
const INVALID_CONSUME_CODE: &str = "spark.transport.nio.invalid_consume";
const HANDLER_CODE: &str = "spark.transport.nio.handler_failed";

/// 通道上下文的统一错误类型。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 同一次写失败既要交给在途刷写操作的监听器，又要原样抛回给选择器线程，
///   因此错误必须可克隆；IO 源错误以 `Arc<io::Error>` 保存，克隆后仍指向同一实例。
/// - 每个变体都映射到 `spark.transport.nio.*` 命名空间下的稳定错误码，便于日志与告警聚合。
///
/// ## 契约 (What)
/// - `Io`：传输层 IO 失败，对通道是致命的，调用方应驱动拆除；
/// - `ChannelClosed`：通道已关闭或正在拆除，排队中的刷写统一以此失败；
/// - `ResourceExhausted`：页池预算耗尽，读缓冲无法扩容；
/// - `InvalidConsume`：业务处理器报告的消费字节数超过可读字节数；
/// - `Handler`：业务处理器自身返回的失败。
///
/// ## 注意事项 (Trade-offs)
/// - “可能阻塞”不是错误，在上下文内部被吸收为 0 字节，不会出现在本类型中。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum NioError {
    #[error("{}: {}", .kind.message, .source)]
    Io {
        kind: OperationKind,
        source: Arc<io::Error>,
    },
    #[error("channel closed")]
    ChannelClosed,
    #[error("page allocation refused: {leased} of {limit} pages already leased")]
    ResourceExhausted { leased: usize, limit: usize },
    #[error("handler consumed {consumed} bytes but only {available} were readable")]
    InvalidConsume { consumed: usize, available: usize },
    #[error("handler failed: {0}")]
    Handler(Cow<'static, str>),
}

impl NioError {
    /// 构造业务处理器错误。
    pub fn handler(message: impl Into<Cow<'static, str>>) -> Self {
        NioError::Handler(message.into())
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            NioError::Io { kind, .. } => kind.code,
            NioError::ChannelClosed => CHANNEL_CLOSED_CODE,
            NioError::ResourceExhausted { .. } => RESOURCE_EXHAUSTED_CODE,
            NioError::InvalidConsume { .. } => INVALID_CONSUME_CODE,
            NioError::Handler(_) => HANDLER_CODE,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, NioError::ChannelClosed)
    }

    /// 若为 IO 错误，返回共享的源错误，便于调用方判断是否为同一次失败。
    pub fn io_source(&self) -> Option<&Arc<io::Error>> {
        match self {
            NioError::Io { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        self.io_source().map(|source| source.kind())
    }
}

/// 将 IO 错误映射为通道错误，并附带操作类别。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> NioError {
    NioError::Io {
        kind,
        source: Arc::new(error),
    }
}

/// `WouldBlock` 与 `Interrupted` 都表示“本轮没有进展”，等待下一次就绪事件即可。
pub(crate) fn is_would_block(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
