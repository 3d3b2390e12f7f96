//! # observe 模块说明
//!
//! ## 角色定位（Why）
//! - `tracing` 事件面向运维人员；[`EventSink`] 则把操作生命周期以强类型事件交给程序化观察者，
//!   测试借此断言“解析 → 连接 → 协商 → 发送 → 收头 → 收体 → 回调”的先后顺序。
//!
//! ## 设计要求（What）
//! - 事件在工作线程上同步投递，观察者实现必须快速返回；
//! - 同一操作的事件按发生顺序投递，不同操作之间不保证顺序。

use std::net::SocketAddr;

use crate::{
    command::OpHandle,
    endpoint::HostAndPort,
    error::ErrorKind,
    protocol::{Protocol, ProtocolSet},
};

/// 连接来源。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionOrigin {
    /// 复用池中的空闲连接。
    Pooled,
    /// 新建连接。
    Fresh,
}

/// 生命周期事件。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetworkEvent {
    Admitted {
        handle: OpHandle,
        target: HostAndPort,
    },
    Resolved {
        target: HostAndPort,
        addrs: Vec<SocketAddr>,
    },
    SocketConnected {
        target: HostAndPort,
        peer: SocketAddr,
    },
    TlsEstablished {
        target: HostAndPort,
    },
    Authenticated {
        target: HostAndPort,
    },
    ProtocolsProbed {
        target: HostAndPort,
        remote: ProtocolSet,
    },
    ConnectionAcquired {
        handle: OpHandle,
        origin: ConnectionOrigin,
    },
    ProtocolNegotiated {
        handle: OpHandle,
        protocol: Protocol,
    },
    RequestSent {
        handle: OpHandle,
        request_id: i32,
        bytes: usize,
    },
    HeaderReceived {
        handle: OpHandle,
        body_len: usize,
    },
    BodyReceived {
        handle: OpHandle,
        bytes: usize,
    },
    ConnectionReleased {
        target: HostAndPort,
        reused: bool,
    },
    Completed {
        handle: OpHandle,
        outcome: Result<(), ErrorKind>,
    },
}

/// 生命周期事件观察者。
pub trait EventSink: Send + Sync + 'static {
    fn on_event(&self, event: NetworkEvent);
}

/// 丢弃所有事件的默认观察者。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn on_event(&self, _event: NetworkEvent) {}
}
