#![cfg(not(any(loom, spark_loom)))]

//! 基于本地回环 TCP 的端到端验证：非阻塞读取、按序刷写与对端关闭检测。

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use spark_transport_nio::{
    ChannelContext, ChannelContextConfig, ChannelId, FlushOperation, InboundChannelBuffer,
    NioError, OwnerThread, SelectorHandle, TcpRawChannel,
};

struct LoopSelector {
    owner: OwnerThread,
}

impl SelectorHandle for LoopSelector {
    fn is_on_selector_thread(&self) -> bool {
        self.owner.is_current()
    }

    fn queue_channel_close(&self, _channel: ChannelId) {}
}

fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("绑定回环地址失败");
    let address = listener.local_addr().expect("读取监听地址失败");
    let client = TcpStream::connect(address).expect("建立连接失败");
    let (server, _) = listener.accept().expect("接受连接失败");
    (client, server)
}

fn ignore_reads(_buffer: &InboundChannelBuffer) -> Result<usize, NioError> {
    Ok(0)
}

/// 模拟选择器轮询：反复调用直到条件满足或超时。
fn poll_until(mut step: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !step() {
        assert!(Instant::now() < deadline, "等待就绪超时");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn loopback_round_trip_and_peer_close() {
    let (mut client, server) = connected_pair();
    let config = ChannelContextConfig::new()
        .with_page_size(8)
        .with_linger(Some(Duration::ZERO));
    let raw = TcpRawChannel::new(server, &config).expect("配置服务端套接字失败");
    assert_eq!(
        raw.peer_addr().expect("读取对端地址失败"),
        client.local_addr().expect("读取本端地址失败")
    );

    let selector = Arc::new(LoopSelector {
        owner: OwnerThread::new(),
    });
    selector.owner.bind_current();
    let mut ctx = ChannelContext::new(
        ChannelId::new(1),
        raw,
        ignore_reads,
        selector,
        config.build_page_pool(),
        &config,
    )
    .expect("构造上下文失败");

    assert_eq!(ctx.read().expect("空读不应失败"), 0, "无数据时必须返回 0");

    client.write_all(b"hello, selector").expect("客户端写入失败");
    poll_until(|| {
        ctx.read().expect("读取失败");
        ctx.buffer().index() == 15
    });
    assert_eq!(ctx.buffer().readable_to_vec(), b"hello, selector");

    ctx.queue_write_operation(FlushOperation::without_listener(vec![
        Bytes::from_static(b"pong "),
        Bytes::from_static(b"pong"),
    ]))
    .expect("入队失败");
    poll_until(|| {
        ctx.flush_channel().expect("刷写失败");
        !ctx.has_queued_write_ops()
    });
    let mut reply = [0u8; 9];
    client.read_exact(&mut reply).expect("客户端读取失败");
    assert_eq!(&reply, b"pong pong");

    drop(client);
    poll_until(|| {
        let _ = ctx.read();
        ctx.close_now()
    });
    assert!(ctx.selector_should_close());
    ctx.close_from_selector().expect("拆除失败");
}
