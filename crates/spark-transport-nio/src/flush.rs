use std::{fmt, io::IoSlice};

use bytes::Bytes;

use crate::error::NioError;

/// 刷写完成回调：成功时收到 `Ok(())`，失败或通道关闭时收到对应错误。
pub type FlushListener = Box<dyn FnOnce(Result<(), NioError>) + Send + 'static>;

/// 一次待写出的字节序列及其写出进度。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 非阻塞套接字可能只接受部分字节，刷写操作需记住“已被接受多少”，下一次可写事件从断点继续；
/// - 字节区域以 `bytes::Bytes` 持有，构造后不可变，生产者线程交出后无需再复制。
///
/// ## 逻辑 (How)
/// - `written` 只增不减，`buffers_to_write` 跳过已写出的前缀，包括单个区域内部的部分写出；
/// - 监听器只会被触发一次：`complete`/`fail` 消耗操作；若操作在完成前被丢弃，
///   `Drop` 以 `ChannelClosed` 触发监听器，保证等待方不会永久挂起。
///
/// ## 契约 (What)
/// - 不变量：`0 <= written <= total_len`；
/// - `is_fully_flushed()` 当且仅当 `written == total_len`；
/// - `increment_index(n)` 的前置条件是 `n <= remaining()`。
pub struct FlushOperation {
    regions: Vec<Bytes>,
    total_len: usize,
    written: usize,
    listener: Option<FlushListener>,
}

impl FlushOperation {
    pub fn new<F>(regions: Vec<Bytes>, listener: F) -> Self
    where
        F: FnOnce(Result<(), NioError>) + Send + 'static,
    {
        Self::build(regions, Some(Box::new(listener)))
    }

    /// 不关心完成结果的刷写操作。
    pub fn without_listener(regions: Vec<Bytes>) -> Self {
        Self::build(regions, None)
    }

    fn build(regions: Vec<Bytes>, listener: Option<FlushListener>) -> Self {
        let total_len = regions.iter().map(Bytes::len).sum();
        Self {
            regions,
            total_len,
            written: 0,
            listener,
        }
    }

    /// 返回尚未写出的区域后缀，可直接用于一次聚集写。
    pub fn buffers_to_write(&self) -> Vec<IoSlice<'_>> {
        let mut skip = self.written;
        let mut buffers = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            if skip >= region.len() {
                skip -= region.len();
                continue;
            }
            buffers.push(IoSlice::new(&region[skip..]));
            skip = 0;
        }
        buffers
    }

    pub fn increment_index(&mut self, count: usize) {
        debug_assert!(
            count <= self.remaining(),
            "increment_index({count}) exceeds remaining {}",
            self.remaining()
        );
        self.written = (self.written + count).min(self.total_len);
    }

    pub fn is_fully_flushed(&self) -> bool {
        self.written == self.total_len
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn remaining(&self) -> usize {
        self.total_len - self.written
    }

    /// 以成功结果触发监听器。
    pub fn complete(mut self) {
        self.notify(Ok(()));
    }

    /// 以错误触发监听器。
    pub fn fail(mut self, error: NioError) {
        self.notify(Err(error));
    }

    fn notify(&mut self, result: Result<(), NioError>) {
        if let Some(listener) = self.listener.take() {
            listener(result);
        }
    }
}

impl Drop for FlushOperation {
    fn drop(&mut self) {
        self.notify(Err(NioError::ChannelClosed));
    }
}

impl fmt::Debug for FlushOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushOperation")
            .field("regions", &self.regions.len())
            .field("total_len", &self.total_len)
            .field("written", &self.written)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn lens(op: &FlushOperation) -> Vec<usize> {
        op.buffers_to_write().iter().map(|slice| slice.len()).collect()
    }

    #[test]
    fn partial_writes_resume_inside_a_region() {
        let mut op = FlushOperation::without_listener(vec![
            Bytes::from_static(b"abcd"),
            Bytes::from_static(b""),
            Bytes::from_static(b"efghij"),
        ]);
        assert_eq!(op.total_len(), 10);
        assert_eq!(lens(&op), vec![4, 6]);

        op.increment_index(6);
        assert_eq!(lens(&op), vec![4]);
        assert_eq!(&*op.buffers_to_write()[0], b"ghij");
        assert!(!op.is_fully_flushed());

        op.increment_index(4);
        assert!(op.is_fully_flushed());
        assert!(op.buffers_to_write().is_empty());
    }

    #[test]
    fn listener_fires_exactly_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let op = FlushOperation::new(vec![Bytes::from_static(b"x")], move |result| {
            sink.lock().expect("监听器锁中毒").push(result.is_ok());
        });
        op.complete();
        assert_eq!(*seen.lock().expect("监听器锁中毒"), vec![true]);
    }

    #[test]
    fn dropping_an_unfinished_operation_reports_channel_closed() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let op = FlushOperation::new(vec![Bytes::from_static(b"pending")], move |result| {
            *sink.lock().expect("监听器锁中毒") = Some(result);
        });
        drop(op);
        let result = seen.lock().expect("监听器锁中毒").take().expect("监听器必须被触发");
        assert!(result.expect_err("丢弃必须以失败通知").is_closed());
    }

    #[test]
    fn empty_operation_is_already_flushed() {
        let op = FlushOperation::without_listener(Vec::new());
        assert!(op.is_fully_flushed());
        assert!(op.buffers_to_write().is_empty());
    }
}
