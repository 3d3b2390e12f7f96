use std::{
    fmt,
    net::SocketAddr,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use conduit_core::{CallContext, CommandError, HostAndPort, Protocol, ProtocolSet, negotiate};
use futures::task::noop_waker_ref;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{
    error::{OperationKind, READ, WRITE},
    frame::{
        FrameError, FrameHeader, FrameLimits, HEADER_LEN, OpCode, encode_message, next_request_id,
    },
    util::run_with_context,
};

/// 连接底层字节流：明文 TCP 或 TLS 包装后的 TCP。
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type BoxedStream = Box<dyn ByteStream>;

/// 已写出的一帧。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SentFrame {
    pub request_id: i32,
    pub bytes: usize,
}

/// 按帧读写的字节流，建立阶段与命令阶段共用。
pub(crate) struct FramedStream {
    stream: BoxedStream,
    limits: FrameLimits,
}

impl FramedStream {
    pub(crate) fn new(stream: BoxedStream, limits: FrameLimits) -> Self {
        Self { stream, limits }
    }

    /// 写出整帧；部分写入由 `write_all` 在字节层面续写。
    pub(crate) async fn send(
        &mut self,
        ctx: &CallContext,
        io: OperationKind,
        op: OpCode,
        response_to: i32,
        body: &[u8],
    ) -> Result<SentFrame, CommandError> {
        let request_id = next_request_id();
        let message = encode_message(&self.limits, request_id, response_to, op, body)
            .map_err(|err| err.into_command_error(io.kind))?;
        let stream = &mut self.stream;
        run_with_context(ctx, io, async {
            stream.write_all(&message).await?;
            stream.flush().await
        })
        .await?;
        Ok(SentFrame {
            request_id,
            bytes: message.len(),
        })
    }

    /// 读满帧头并校验长度、操作码与应答关系，返回报文体长度。
    pub(crate) async fn read_header(
        &mut self,
        ctx: &CallContext,
        io: OperationKind,
        expected: OpCode,
        request_id: i32,
    ) -> Result<usize, CommandError> {
        let mut raw = [0u8; HEADER_LEN];
        let stream = &mut self.stream;
        run_with_context(ctx, io, stream.read_exact(&mut raw)).await?;
        let header = FrameHeader::decode(&raw);
        self.validate(&header, expected, request_id)
            .map_err(|err| err.into_command_error(io.kind))
    }

    fn validate(
        &self,
        header: &FrameHeader,
        expected: OpCode,
        request_id: i32,
    ) -> Result<usize, FrameError> {
        let len = self.limits.check_inbound(header)?;
        if header.op() != Some(expected) {
            return Err(FrameError::UnexpectedOpCode {
                found: header.op_code,
                expected,
            });
        }
        if header.response_to != request_id {
            return Err(FrameError::ResponseMismatch {
                found: header.response_to,
                expected: request_id,
            });
        }
        Ok(len)
    }

    /// 按帧头声明的长度读满报文体。
    pub(crate) async fn read_body(
        &mut self,
        ctx: &CallContext,
        io: OperationKind,
        len: usize,
    ) -> Result<Bytes, CommandError> {
        let mut body = BytesMut::zeroed(len);
        let stream = &mut self.stream;
        run_with_context(ctx, io, stream.read_exact(&mut body)).await?;
        Ok(body.freeze())
    }

    /// 一次完整往返：写出请求帧并读回匹配的应答帧。
    pub(crate) async fn round_trip(
        &mut self,
        ctx: &CallContext,
        io: OperationKind,
        request: OpCode,
        reply: OpCode,
        body: &[u8],
    ) -> Result<Bytes, CommandError> {
        let sent = self.send(ctx, io, request, 0, body).await?;
        let len = self.read_header(ctx, io, reply, sent.request_id).await?;
        self.read_body(ctx, io, len).await
    }

    /// 非阻塞探测对端是否已关闭。
    ///
    /// 空闲连接上不应有任何可读数据：读到 EOF、读到字节或读出错都视为不可复用。
    fn is_peer_closed(&mut self) -> bool {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        match Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
            Poll::Pending => false,
            Poll::Ready(_) => true,
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 到远端节点的一条已验证连接。
///
/// # 教案式说明
/// - **意图 (Why)**：把传输流与远端通告的协议能力绑在一起，操作取得连接后无需再次探测；
/// - **契约 (What)**：
///   - 能力集与协商结果在构造时确定，此后不再变化；
///   - 同一时刻只被一个操作持有（`&mut self` 读写），归还或丢弃由连接池决定；
///   - 一次只允许一个在途请求，不做管线化；
/// - **风险 (Trade-offs)**：请求写出后若中途放弃读取，流上会残留未读应答，此时连接只能丢弃。
pub struct Connection {
    id: u64,
    target: HostAndPort,
    peer: SocketAddr,
    framed: FramedStream,
    local: ProtocolSet,
    remote: ProtocolSet,
    negotiated: Option<Protocol>,
    created_at: Instant,
}

impl Connection {
    pub(crate) fn new(
        target: HostAndPort,
        peer: SocketAddr,
        framed: FramedStream,
        local: ProtocolSet,
        remote: ProtocolSet,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            target,
            peer,
            framed,
            local,
            remote,
            negotiated: negotiate(local, remote),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &HostAndPort {
        &self.target
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_protocols(&self) -> ProtocolSet {
        self.local
    }

    pub fn remote_protocols(&self) -> ProtocolSet {
        self.remote
    }

    /// 本地与远端共同支持的最高优先级协议；没有交集时为 `None`。
    pub fn negotiated_protocol(&self) -> Option<Protocol> {
        self.negotiated
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// 按出站上限校验请求报文体；失败时流上没有写出任何字节。
    pub fn check_request_size(&self, body_len: usize) -> Result<(), CommandError> {
        self.framed
            .limits
            .check_outbound(body_len)
            .map(|_| ())
            .map_err(|err| err.into_command_error(WRITE.kind))
    }

    /// 写出命令请求帧。
    pub async fn send_request(
        &mut self,
        ctx: &CallContext,
        op: OpCode,
        body: &[u8],
    ) -> Result<SentFrame, CommandError> {
        self.framed.send(ctx, WRITE, op, 0, body).await
    }

    /// 读取并校验应答帧头，返回报文体长度；超限时不分配报文体缓冲。
    pub async fn read_reply_header(
        &mut self,
        ctx: &CallContext,
        expected: OpCode,
        request_id: i32,
    ) -> Result<usize, CommandError> {
        self.framed.read_header(ctx, READ, expected, request_id).await
    }

    pub async fn read_reply_body(
        &mut self,
        ctx: &CallContext,
        len: usize,
    ) -> Result<Bytes, CommandError> {
        self.framed.read_body(ctx, READ, len).await
    }

    pub(crate) fn is_peer_closed(&mut self) -> bool {
        self.framed.is_peer_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("peer", &self.peer)
            .field("remote", &self.remote)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::ErrorKind;
    use tokio::io::duplex;

    fn pair(limits: FrameLimits) -> (FramedStream, tokio::io::DuplexStream) {
        let (client, server) = duplex(1024);
        (FramedStream::new(Box::new(client), limits), server)
    }

    async fn write_frame(
        server: &mut tokio::io::DuplexStream,
        message_length: u32,
        response_to: i32,
        op: OpCode,
        body: &[u8],
    ) {
        let mut buf = BytesMut::new();
        FrameHeader {
            message_length,
            request_id: 99,
            response_to,
            op_code: op.code(),
        }
        .encode(&mut buf);
        buf.extend_from_slice(body);
        server.write_all(&buf).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reply_must_answer_the_request() {
        let (mut framed, mut server) = pair(FrameLimits::new(64));
        let ctx = CallContext::default();
        write_frame(&mut server, 18, 41, OpCode::CommandReplyV1, b"ok").await;
        let err = framed
            .read_header(&ctx, READ, OpCode::CommandReplyV1, 42)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadFailed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_reply_fails_before_body_read() {
        let (mut framed, mut server) = pair(FrameLimits::new(8));
        let ctx = CallContext::default();
        write_frame(&mut server, u32::MAX, 7, OpCode::Reply, b"").await;
        let err = framed
            .read_header(&ctx, READ, OpCode::Reply, 7)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageTooLarge);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn header_then_body() {
        let (mut framed, mut server) = pair(FrameLimits::new(64));
        let ctx = CallContext::default();
        let sent = framed
            .send(&ctx, WRITE, OpCode::Query, 0, b"ping")
            .await
            .unwrap();
        assert_eq!(sent.bytes, HEADER_LEN + 4);

        let mut echoed = vec![0u8; sent.bytes];
        server.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed[HEADER_LEN..], b"ping");

        write_frame(&mut server, 20, sent.request_id, OpCode::Reply, b"pong").await;
        let len = framed
            .read_header(&ctx, READ, OpCode::Reply, sent.request_id)
            .await
            .unwrap();
        assert_eq!(len, 4);
        let body = framed.read_body(&ctx, READ, len).await.unwrap();
        assert_eq!(&body[..], b"pong");
        assert!(!framed.is_peer_closed());

        drop(server);
        assert!(framed.is_peer_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn truncated_body_is_a_read_failure() {
        let (mut framed, mut server) = pair(FrameLimits::new(64));
        let ctx = CallContext::default();
        write_frame(&mut server, 26, 3, OpCode::Reply, b"abc").await;
        drop(server);
        let len = framed
            .read_header(&ctx, READ, OpCode::Reply, 3)
            .await
            .unwrap();
        let err = framed.read_body(&ctx, READ, len).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadFailed);
    }
}
