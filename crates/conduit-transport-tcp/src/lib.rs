#![doc = r#"
# conduit-transport-tcp

## 设计动机（Why）
- **定位**：在 Tokio 上实现节点间命令通道的套接字层：分帧、新连接的建立序列、
  以及带票据约束的连接池。
- **架构角色**：位于 `conduit-core` 契约之上、`conduit-executor` 编排之下；
  操作状态机只通过 [`ConnectionPool`] 与 [`Connection`] 触达网络。

## 核心契约（What）
- 所有等待都感知 [`CallContext`](conduit_core::CallContext) 的取消与截止，
  失败映射为带分类的 [`CommandError`](conduit_core::CommandError)；
- 帧头固定 16 字节小端序，报文体长度超过配置上限时在分配缓冲前失败；
- 一条连接同一时刻只有一个持有者，且一次只承载一个在途请求。

## 实现策略（How）
- `tokio::select!` 组合取消轮询、截止计时与 IO Future；
- TLS 由 `tokio-rustls` 承担，认证由注入的 [`Authenticator`] 在主连接上完成；
- 套接字选项（`TCP_NODELAY`、保活）通过 `socket2` 落地。

## 风险与考量（Trade-offs）
- 取消通过 5ms 轮询感知，不会打断已进入内核的系统调用；
- 连接池的空闲集合由互斥锁保护，临界区内只做弹出/压入与非阻塞探测。
"#]

mod connect;
mod connection;
mod error;
pub mod frame;
mod pool;
mod util;

pub use connect::{AuthSession, Authenticator, ConnectOptions, Connector};
pub use connection::{ByteStream, Connection, SentFrame};
pub use frame::{FrameError, FrameHeader, FrameLimits, HEADER_LEN, OpCode};
pub use pool::{ConnectionPool, PoolOptions, PoolStats};
