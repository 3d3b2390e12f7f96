//! 门面集成测试的公共设施：运行在独立运行时上的假远端节点、事件记录器与结果收集器。

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use conduit_core::{
    CompletionFn, ErrorKind, EventSink, HostAndPort, NetworkEvent, OpHandle, Protocol,
    ResponseStatus,
};
use conduit_transport_tcp::{FrameHeader, HEADER_LEN, OpCode};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    runtime::Runtime,
};

pub const WAIT: Duration = Duration::from_secs(10);

/// 假远端收到命令帧后的行为。
#[derive(Clone, Copy, Debug)]
pub enum ReplyMode {
    /// 原样回显报文体。
    Echo,
    /// 收下请求但永不应答。
    Hold,
    /// 应答帧头声明一个超长报文体，随后不再发送任何字节。
    Oversized(u32),
}

/// 假远端的 `Hello` 行为。
#[derive(Clone, Copy, Debug)]
pub enum HelloMode {
    Answer(u8),
    Hang,
}

pub struct FakeRemote {
    runtime: Runtime,
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    command_frames: Arc<AtomicUsize>,
}

impl FakeRemote {
    pub fn start(hello: HelloMode, reply: ReplyMode) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0"))?;
        let addr = listener.local_addr()?;
        let accepted = Arc::new(AtomicUsize::new(0));
        let command_frames = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        let commands = Arc::clone(&command_frames);
        runtime.spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, hello, reply, Arc::clone(&commands)));
            }
        });
        Ok(Self {
            runtime,
            addr,
            accepted,
            command_frames,
        })
    }

    pub fn echo() -> Result<Self> {
        Self::start(HelloMode::Answer(all_bits()), ReplyMode::Echo)
    }

    pub fn target(&self) -> HostAndPort {
        HostAndPort::from(self.addr)
    }

    /// 已接受的 TCP 连接数。
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// 已收到的命令帧数（不含建立阶段的 `Hello`/`Auth`）。
    pub fn command_frames(&self) -> usize {
        self.command_frames.load(Ordering::SeqCst)
    }
}

pub fn all_bits() -> u8 {
    Protocol::OpCommandV1.bit() | Protocol::OpQuery.bit()
}

async fn serve(
    mut stream: TcpStream,
    hello: HelloMode,
    reply: ReplyMode,
    commands: Arc<AtomicUsize>,
) {
    loop {
        let mut raw = [0u8; HEADER_LEN];
        if stream.read_exact(&mut raw).await.is_err() {
            return;
        }
        let header = FrameHeader::decode(&raw);
        let mut body = vec![0u8; (header.message_length as usize).saturating_sub(HEADER_LEN)];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let (op, declared, payload) = match header.op() {
            Some(OpCode::Hello) => match hello {
                HelloMode::Answer(bits) => (OpCode::HelloReply, None, vec![bits]),
                HelloMode::Hang => {
                    std::future::pending::<()>().await;
                    return;
                }
            },
            Some(request @ (OpCode::Query | OpCode::CommandV1)) => {
                commands.fetch_add(1, Ordering::SeqCst);
                let op = if request == OpCode::Query {
                    OpCode::Reply
                } else {
                    OpCode::CommandReplyV1
                };
                match reply {
                    ReplyMode::Echo => (op, None, body),
                    ReplyMode::Hold => {
                        // 保持连接打开直到对端关闭。
                        let mut sink = [0u8; 64];
                        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                        return;
                    }
                    ReplyMode::Oversized(len) => (op, Some(len), Vec::new()),
                }
            }
            _ => return,
        };

        let mut out = BytesMut::new();
        FrameHeader {
            message_length: declared.unwrap_or((HEADER_LEN + payload.len()) as u32),
            request_id: 4242,
            response_to: header.request_id,
            op_code: op.code(),
        }
        .encode(&mut out);
        out.extend_from_slice(&payload);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// 记录全部生命周期事件。
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<NetworkEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<NetworkEvent> {
        self.events.lock().clone()
    }

    /// 轮询直到出现满足条件的事件。
    pub fn wait_for(&self, predicate: impl Fn(&NetworkEvent) -> bool) -> Result<()> {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.events.lock().iter().any(&predicate) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        bail!("event did not arrive within {WAIT:?}")
    }
}

impl EventSink for Recorder {
    fn on_event(&self, event: NetworkEvent) {
        self.events.lock().push(event);
    }
}

pub type Outcome = (OpHandle, Result<(Bytes, Protocol), ErrorKind>);

/// 把完成回调转成通道消息，便于断言“恰好一次”。
pub struct Outcomes {
    sender: mpsc::Sender<Outcome>,
    receiver: mpsc::Receiver<Outcome>,
}

impl Outcomes {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    pub fn callback(&self, handle: OpHandle) -> CompletionFn {
        let sender = self.sender.clone();
        Box::new(move |status: ResponseStatus| {
            let outcome = status
                .map(|response| (response.data, response.protocol))
                .map_err(|err| err.kind());
            let _ = sender.send((handle, outcome));
        })
    }

    pub fn next(&self) -> Result<Outcome> {
        self.receiver
            .recv_timeout(WAIT)
            .context("completion callback did not fire")
    }

    /// 已经送达但尚未取走的结果。
    pub fn drain(&self) -> Vec<Outcome> {
        self.receiver.try_iter().collect()
    }
}

/// 只比较事件种类，忽略携带的数据。
pub fn event_name(event: &NetworkEvent) -> &'static str {
    match event {
        NetworkEvent::Admitted { .. } => "admitted",
        NetworkEvent::Resolved { .. } => "resolved",
        NetworkEvent::SocketConnected { .. } => "socket_connected",
        NetworkEvent::TlsEstablished { .. } => "tls_established",
        NetworkEvent::Authenticated { .. } => "authenticated",
        NetworkEvent::ProtocolsProbed { .. } => "protocols_probed",
        NetworkEvent::ConnectionAcquired { .. } => "connection_acquired",
        NetworkEvent::ProtocolNegotiated { .. } => "protocol_negotiated",
        NetworkEvent::RequestSent { .. } => "request_sent",
        NetworkEvent::HeaderReceived { .. } => "header_received",
        NetworkEvent::BodyReceived { .. } => "body_received",
        NetworkEvent::ConnectionReleased { .. } => "connection_released",
        NetworkEvent::Completed { .. } => "completed",
    }
}

/// 轮询直到条件成立。
pub fn eventually(what: &str, condition: impl Fn() -> bool) -> Result<()> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    bail!("{what} did not happen within {WAIT:?}")
}
