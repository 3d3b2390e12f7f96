//! # connect 模块说明
//!
//! ## 角色定位（Why）
//! - 把一条新连接的建立收敛为固定顺序：解析 → 连接 → 可选 TLS → 可选认证 → 协议探测；
//! - 认证是主连接上的一个子步骤，通过 [`AuthSession`] 在同一条流上交换 `Auth`/`AuthReply` 帧，
//!   不再需要额外的引导连接。
//!
//! ## 契约（What）
//! - 整个序列受 `connect_timeout` 约束，并随时响应调用方的取消；
//! - 失败按阶段分类：解析与连接为 `ConnectFailed`，TLS 与探测为 `HandshakeFailed`，
//!   认证为 `AuthFailed`；撤回与超时保持原分类，唯一例外是单个地址用完连接份额，记为 `ConnectFailed`；
//! - 协议不匹配不在此处判定，探测结果原样记录在 [`Connection`] 上。

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use conduit_core::{
    CallContext, CommandError, Deadline, EventSink, HostAndPort, NetworkEvent, ProtocolSet,
};
use rustls_pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::{
    connection::{BoxedStream, Connection, FramedStream},
    error::{
        AUTH, CONFIGURE, CONNECT, HELLO, OperationKind, RESOLVE, TLS_HANDSHAKE, is_interruption,
        map_io_error, op_error,
    },
    frame::{FrameLimits, OpCode},
    util::run_with_context,
};

/// 认证协作方。
///
/// # 教案式说明
/// - **意图 (Why)**：网络层不实现任何认证机制，只在连接建立时调用协作方；
/// - **契约 (What)**：实现通过 `session.round_trip` 与远端交换任意轮次；返回 `Err` 即认证失败，
///   非撤回类错误会被归入 `AuthFailed`；
/// - **风险 (Trade-offs)**：实现运行在工作线程上，不应执行阻塞调用。
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(
        &self,
        target: &HostAndPort,
        session: &mut AuthSession<'_>,
    ) -> Result<(), CommandError>;
}

/// 认证期间对主连接的受限访问。
pub struct AuthSession<'a> {
    framed: &'a mut FramedStream,
    ctx: &'a CallContext,
}

impl AuthSession<'_> {
    /// 发送一帧 `Auth` 并返回匹配的 `AuthReply` 报文体。
    pub async fn round_trip(&mut self, payload: &[u8]) -> Result<Bytes, CommandError> {
        self.framed
            .round_trip(self.ctx, AUTH, OpCode::Auth, OpCode::AuthReply, payload)
            .await
    }
}

/// 套接字与建立阶段参数。
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: Option<Duration>,
    pub local_protocols: ProtocolSet,
    pub limits: FrameLimits,
}

/// 新连接构建器。
///
/// # 教案式说明
/// - **契约 (What)**：`connect` 成功返回的连接已完成协议探测，可直接交给操作；
/// - **执行 (How)**：每一步都经 `run_with_context` 绑定到收紧后的上下文，
///   每一步完成都向 [`EventSink`] 投递一个事件；
/// - **风险 (Trade-offs)**：多地址解析结果按顺序逐个尝试，不做并行竞速。
#[derive(Clone)]
pub struct Connector {
    options: ConnectOptions,
    tls: Option<TlsConnector>,
    authenticator: Option<Arc<dyn Authenticator>>,
    events: Arc<dyn EventSink>,
}

impl Connector {
    pub fn new(options: ConnectOptions, events: Arc<dyn EventSink>) -> Self {
        Self {
            options,
            tls: None,
            authenticator: None,
            events,
        }
    }

    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(TlsConnector::from(config));
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub async fn connect(
        &self,
        caller: &CallContext,
        target: &HostAndPort,
    ) -> Result<Connection, CommandError> {
        let ctx = caller.with_tighter_deadline(Deadline::after(self.options.connect_timeout));

        let addrs = self.resolve(&ctx, target).await?;
        let (tcp, peer) = self.open_socket(caller, &ctx, target, &addrs).await?;
        self.configure(&tcp).map_err(|err| map_io_error(CONFIGURE, err))?;

        let stream: BoxedStream = match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(target.host().to_owned())
                    .map_err(|err| op_error(TLS_HANDSHAKE, err))?;
                let tls =
                    run_with_context(&ctx, TLS_HANDSHAKE, connector.connect(name, tcp)).await?;
                self.events.on_event(NetworkEvent::TlsEstablished {
                    target: target.clone(),
                });
                Box::new(tls)
            }
            None => Box::new(tcp),
        };
        let mut framed = FramedStream::new(stream, self.options.limits);

        if let Some(authenticator) = &self.authenticator {
            let mut session = AuthSession {
                framed: &mut framed,
                ctx: &ctx,
            };
            authenticator
                .authenticate(target, &mut session)
                .await
                .map_err(|err| reclassify(AUTH, err))?;
            self.events.on_event(NetworkEvent::Authenticated {
                target: target.clone(),
            });
        }

        let remote = self.probe(&ctx, &mut framed).await?;
        self.events.on_event(NetworkEvent::ProtocolsProbed {
            target: target.clone(),
            remote,
        });
        debug!(%target, %peer, %remote, "connection established");
        Ok(Connection::new(
            target.clone(),
            peer,
            framed,
            self.options.local_protocols,
            remote,
        ))
    }

    async fn resolve(
        &self,
        ctx: &CallContext,
        target: &HostAndPort,
    ) -> Result<Vec<SocketAddr>, CommandError> {
        let addrs: Vec<SocketAddr> = run_with_context(
            ctx,
            RESOLVE,
            tokio::net::lookup_host((target.host(), target.port())),
        )
        .await?
        .collect();
        if addrs.is_empty() {
            return Err(op_error(RESOLVE, format_args!("no addresses for {target}")));
        }
        self.events.on_event(NetworkEvent::Resolved {
            target: target.clone(),
            addrs: addrs.clone(),
        });
        Ok(addrs)
    }

    /// 按顺序尝试每个地址，剩余的建立预算在未尝试的地址间均分。
    ///
    /// 单个地址用完份额记为 `ConnectFailed` 并继续下一个；只有调用方自己的取消或截止时间
    /// 才会中断整个尝试序列。
    async fn open_socket(
        &self,
        caller: &CallContext,
        setup: &CallContext,
        target: &HostAndPort,
        addrs: &[SocketAddr],
    ) -> Result<(TcpStream, SocketAddr), CommandError> {
        let mut last_error = None;
        for (index, addr) in addrs.iter().enumerate() {
            let share = attempt_deadline(setup.deadline(), addrs.len() - index);
            let attempt = setup.with_tighter_deadline(share);
            match run_with_context(&attempt, CONNECT, TcpStream::connect(*addr)).await {
                Ok(stream) => {
                    self.events.on_event(NetworkEvent::SocketConnected {
                        target: target.clone(),
                        peer: *addr,
                    });
                    return Ok((stream, *addr));
                }
                Err(err) if is_interruption(&err) && caller.checkpoint("connect").is_err() => {
                    return Err(err);
                }
                Err(err) if is_interruption(&err) => {
                    warn!(%target, %addr, "connect attempt timed out");
                    last_error = Some(op_error(CONNECT, format_args!("{addr} timed out")));
                }
                Err(err) => {
                    warn!(%target, %addr, error = %err, "connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| op_error(CONNECT, "no address attempted")))
    }

    fn configure(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.options.tcp_nodelay)?;
        if let Some(time) = self.options.tcp_keepalive {
            SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
        }
        Ok(())
    }

    /// 发送本地能力位图，读回远端通告的能力位图。
    async fn probe(
        &self,
        ctx: &CallContext,
        framed: &mut FramedStream,
    ) -> Result<ProtocolSet, CommandError> {
        let local = [self.options.local_protocols.bits()];
        let reply = framed
            .round_trip(ctx, HELLO, OpCode::Hello, OpCode::HelloReply, &local)
            .await?;
        match reply.first() {
            Some(bits) => Ok(ProtocolSet::from_bits(*bits)),
            None => Err(op_error(HELLO, "empty hello reply")),
        }
    }
}

fn attempt_deadline(setup: Deadline, untried: usize) -> Deadline {
    match setup.remaining() {
        Some(left) => Deadline::after(left / u32::try_from(untried.max(1)).unwrap_or(u32::MAX)),
        None => Deadline::none(),
    }
}

/// 协作方返回的错误统一归入该阶段的分类，撤回与超时除外。
fn reclassify(op: OperationKind, err: CommandError) -> CommandError {
    if is_interruption(&err) || err.kind() == op.kind {
        err
    } else {
        CommandError::new(op.kind, format!("{}: {}", op.message, err.message()))
    }
}
