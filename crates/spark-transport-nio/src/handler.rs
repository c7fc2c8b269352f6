use crate::{buffer::InboundChannelBuffer, error::NioError, flush::FlushOperation};

/// 通道上下文与应用协议之间的读写契约。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 上下文只负责字节搬运，何时凑齐一帧、如何回应由协议层决定；
/// - 协议层通过返回“消费了多少字节”告知上下文哪些前缀可以释放。
///
/// ## 契约 (What)
/// - `consume_reads`：读取 `buffer.readable()` 中的数据，返回本次消费的字节数；
///   返回值不得超过 `buffer.index()`，返回 0 表示需要更多数据；
/// - `poll_flush_operations`：读取期间协议层产生的待写操作，上下文按返回顺序入队；
/// - `close`：通道拆除时调用一次，用于释放协议层资源。
/// - **前置条件**：全部方法只在选择器线程上被调用。
pub trait ReadWriteHandler: Send {
    fn consume_reads(&mut self, buffer: &InboundChannelBuffer) -> Result<usize, NioError>;

    fn poll_flush_operations(&mut self) -> Vec<FlushOperation> {
        Vec::new()
    }

    fn close(&mut self) -> Result<(), NioError> {
        Ok(())
    }
}

/// 闭包形式的处理器，只关心入站字节。
impl<F> ReadWriteHandler for F
where
    F: FnMut(&InboundChannelBuffer) -> Result<usize, NioError> + Send,
{
    fn consume_reads(&mut self, buffer: &InboundChannelBuffer) -> Result<usize, NioError> {
        self(buffer)
    }
}
