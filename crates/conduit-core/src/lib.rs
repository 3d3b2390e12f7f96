#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "conduit-core: 节点间命令通道的核心契约。"]
#![doc = ""]
#![doc = "== 分层定位 =="]
#![doc = "- **Why**：复制、集群协调与管理命令都需要“把一条请求送到远端节点并拿回一个结果”，本 crate 把这条链路上各层共享的类型集中在一处。"]
#![doc = "- **What**：请求/响应与完成回调、错误分类、协议能力集与协商、取消令牌与截止时间、配置、`NetworkInterface` 门面契约。"]
#![doc = "- **How**：不依赖任何异步运行时；传输层 `conduit-transport-tcp` 与编排层 `conduit-executor` 均只通过这里的类型交互。"]

pub mod codec;
pub mod command;
pub mod config;
pub mod contract;
pub mod endpoint;
pub mod error;
pub mod interface;
pub mod observe;
pub mod protocol;

pub use codec::{MessageCodec, PassthroughCodec, codec_error};
pub use command::{
    Completion, CompletionFn, OpHandle, RemoteCommandRequest, RemoteCommandResponse,
    ResponseStatus,
};
pub use config::{ConfigError, NetworkInterfaceConfig};
pub use contract::{CallContext, CancelReason, Cancellation, Deadline};
pub use endpoint::{EndpointParseError, HostAndPort};
pub use error::{CommandError, ErrorKind, LifecycleError};
pub use interface::NetworkInterface;
pub use observe::{ConnectionOrigin, EventSink, NetworkEvent, NoopEventSink};
pub use protocol::{Protocol, ProtocolSet, negotiate};
