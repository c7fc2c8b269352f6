use std::{
    io::{self, IoSlice, IoSliceMut, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
};

use socket2::SockRef;

use crate::{
    config::ChannelContextConfig,
    error::{CONFIGURE, NioError, map_io_error},
};

/// 通道上下文使用的原始非阻塞传输。
///
/// 读写语义与 `std::io` 一致：`read_from_channel` 返回 `Ok(0)` 表示对端已关闭；
/// 没有数据或发送缓冲已满时返回 `ErrorKind::WouldBlock`，上下文将其视为 0 字节进展。
pub trait RawChannel: Send {
    /// 一次分散读。
    fn read_from_channel(&mut self, buffers: &mut [IoSliceMut<'_>]) -> io::Result<usize>;

    /// 一次聚集写。
    fn flush_to_channel(&mut self, buffers: &[IoSlice<'_>]) -> io::Result<usize>;

    /// 拆除时关闭读写两个方向。
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 基于 `std::net::TcpStream` 的非阻塞原始通道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让选择器可以直接把已建立的标准库 TCP 流交给通道上下文，无需了解 `socket2` 的细节；
/// - 构造时一次性落地非阻塞模式与 `SO_LINGER`，保证关闭阶段的资源回收时序可预期。
///
/// ## 契约（What）
/// - `new`：设置非阻塞并应用 [`ChannelContextConfig::linger`]，失败时返回 `configure_failed` 错误；
/// - `shutdown`：半关闭读写两端，对端已断开（`NotConnected`）视为成功；
/// - **后置条件**：构造成功后所有读写都不会阻塞调用线程。
#[derive(Debug)]
pub struct TcpRawChannel {
    stream: TcpStream,
}

impl TcpRawChannel {
    pub fn new(stream: TcpStream, config: &ChannelContextConfig) -> Result<Self, NioError> {
        stream
            .set_nonblocking(true)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        SockRef::from(&stream)
            .set_linger(config.linger())
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        Ok(Self { stream })
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl RawChannel for TcpRawChannel {
    fn read_from_channel(&mut self, buffers: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.stream.read_vectored(buffers)
    }

    fn flush_to_channel(&mut self, buffers: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.write_vectored(buffers)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}
