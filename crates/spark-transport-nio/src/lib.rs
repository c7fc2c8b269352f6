#![doc = r#"
# spark-transport-nio

## 设计动机（Why）
- **定位**：该 crate 提供选择器驱动的非阻塞通道字节上下文，负责把“可读/可写”
  就绪事件转换为有序、正确缓冲的应用数据与按序写出的刷写操作。
- **架构角色**：位于事件循环与协议处理器之间；事件循环持有
  [`ChannelContext`] 并在就绪时调用 `read`/`flush_channel`，协议层通过
  [`ReadWriteHandler`] 消费入站字节，其它线程经 [`ChannelHandle`] 提交写入或请求关闭。
- **设计理念**：单一所属线程纪律。读缓冲与刷写进度只在所属选择器线程上变更，
  因此无需锁；跨线程竞争只剩关闭标记与刷写收件箱两处。

## 核心契约（What）
- **输入条件**：`read`、`flush_channel`、`close_from_selector` 只能在所属选择器线程调用，
  由 [`SelectorHandle::assert_on_selector_thread`] 在 debug 构建中检查；
- **输出保障**：入站字节不重复、不丢失地交给处理器；刷写按 FIFO 完成，
  每个操作的监听器恰好触发一次；并发的 `close_channel` 只安排一次拆除；
- **失败语义**：“可能阻塞”被吸收为 0 字节进展；其它 IO 失败映射为带稳定错误码的
  [`NioError`]，并置位 `close_now` 让所属循环拆除通道。

## 实现策略（How）
- **读缓冲**：[`InboundChannelBuffer`] 以固定大小页追加式增长，页来自可复用的
  [`PagePool`]，已写入页的地址在扩容时保持稳定；
- **刷写队列**：[`PendingFlushQueue`] 由 `spin::Mutex` 保护的收件箱与消费端独占的
  “当前操作”槽位组成，部分写出的操作留在槽位中等待下一次可写事件；
- **关闭协调**：关闭标记以 CAS 置位，胜者调用 [`SelectorHandle::queue_channel_close`]；
  拆除时封箱刷写队列并以 `ChannelClosed` 失败全部排队操作。

## 风险与考量（Trade-offs）
- **内存**：页只在释放已消费前缀时整页归还，长时间不消费的处理器会让缓冲持续增长，
  可通过 [`ChannelContextConfig::with_max_pages`] 设置页预算；
- **公平性**：单次 `flush_channel` 在无背压时会连续写出多个操作，
  事件循环若需要跨通道公平应自行限制每轮调用次数。
"#]

mod buffer;
mod config;
mod context;
mod error;
mod flush;
mod handler;
mod page;
mod queue;
mod selector;
mod transport;

pub use buffer::InboundChannelBuffer;
pub use config::{ChannelContextConfig, DEFAULT_PAGE_SIZE};
pub use context::{ChannelContext, ChannelHandle, ChannelState};
pub use error::{CONFIGURE, NioError, OperationKind, READ, SHUTDOWN, WRITE};
pub use flush::{FlushListener, FlushOperation};
pub use handler::ReadWriteHandler;
pub use page::{Page, PagePool, PoolStats};
pub use queue::{FlushQueueProducer, PendingFlushQueue};
pub use selector::{ChannelId, OwnerThread, SelectorHandle};
pub use transport::{RawChannel, TcpRawChannel};
