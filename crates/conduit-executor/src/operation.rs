//! # operation 模块说明
//!
//! ## 角色定位（Why）
//! - 一个 [`Operation`] 跟踪一条命令从受理到完成的全过程：取连接、校验协议、写出请求、
//!   先读帧头再读报文体、触发完成回调；
//! - 它只在工作线程上推进，外部线程唯一能影响它的途径是取消令牌。
//!
//! ## 状态机（What）
//! ```text
//! Ready ─► ConnectionAcquired ─► ConnectionVerified ─► Connected ─► Completed
//!   └───────────────┴──────────────────┴──────────────────┴──────────► Completed
//! ```
//! - 状态只前进不后退，任何状态都可直接进入终态 `Completed`；
//! - 三个检查点观察取消与超时：取连接之前、发送之前、请求写出之后；
//!   响应读完后、回调之前再核对一次，撤回在回调送达前始终优先于成功结果。
//!
//! ## 连接去留（How）
//! - 尚未写出请求，或应答已完整读回：连接是干净的，归还连接池；
//! - 请求已开始写出但应答未读完：流上残留未知字节，连接直接丢弃。

use std::{mem, sync::Arc, time::Instant};

use bytes::Bytes;
use conduit_core::{
    CallContext, Cancellation, CommandError, Completion, Deadline, ErrorKind, EventSink,
    MessageCodec, NetworkEvent, OpHandle, Protocol, RemoteCommandRequest, RemoteCommandResponse,
    ResponseStatus,
};
use conduit_transport_tcp::{Connection, ConnectionPool, OpCode, SentFrame};
use tracing::{debug, error};

use crate::{error::ExecutorError, in_progress::Registration, work_signal::WorkSignal};

/// 操作状态。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum OperationState {
    /// 已受理，尚未取得连接。
    Ready,
    /// 已绑定连接，协议尚未校验。
    ConnectionAcquired,
    /// 已确定本次使用的线协议。
    ConnectionVerified,
    /// 请求开始写出，之后读取应答。
    Connected,
    /// 终态：回调已经或正在触发。
    Completed,
}

impl OperationState {
    /// 判断能否从当前状态跃迁到 `target`。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：前进只能逐级进行；除终态外任何状态都可以直接进入 `Completed`；
    ///   同状态跃迁由 [`Operation::transition`] 视为幂等，不在此表中；
    /// - **风险 (Trade-offs)**：表外的组合一律拒绝，状态机实现若越级推进会以 `InternalError` 结束该操作。
    pub fn can_transition_to(self, target: OperationState) -> bool {
        matches!(
            (self, target),
            (OperationState::Ready, OperationState::ConnectionAcquired)
                | (
                    OperationState::ConnectionAcquired,
                    OperationState::ConnectionVerified
                )
                | (OperationState::ConnectionVerified, OperationState::Connected)
                | (OperationState::Ready, OperationState::Completed)
                | (OperationState::ConnectionAcquired, OperationState::Completed)
                | (OperationState::ConnectionVerified, OperationState::Completed)
                | (OperationState::Connected, OperationState::Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Completed)
    }
}

/// 操作持有的连接：取得之前为空。
enum ConnectionSlot {
    Unacquired,
    Acquired(Connection),
}

/// 操作使用的线协议：校验之前未定。
#[derive(Clone, Copy, Debug)]
enum ProtocolSlot {
    Unresolved,
    Resolved(Protocol),
}

impl ProtocolSlot {
    fn resolved(self, stage: &str) -> Result<Protocol, CommandError> {
        match self {
            ProtocolSlot::Resolved(protocol) => Ok(protocol),
            ProtocolSlot::Unresolved => Err(CommandError::new(
                ErrorKind::InternalError,
                format!("no protocol resolved at {stage}"),
            )),
        }
    }
}

/// 工作线程上所有操作共享的协作方。
pub(crate) struct Dispatch {
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) codec: Arc<dyn MessageCodec>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) work: Arc<WorkSignal>,
}

impl Dispatch {
    fn emit(&self, event: NetworkEvent) {
        self.events.on_event(event);
    }
}

/// 单条命令的状态机。
///
/// # 教案式说明
/// - **意图 (Why)**：把一条命令的全部可变状态收拢在一个值里，随任务在工作线程上移动，
///   不与其他操作共享任何可变数据；
/// - **契约 (What)**：
///   - `state` 只前进；`connection` 与 `protocol` 是显式的和类型，绑定后不再改变；
///   - `completion` 恰好触发一次：正常路径经 `complete`，任务被提前丢弃时由 `Completion::drop` 兜底；
///   - `registration` 在回调之后释放，回调执行期间该操作仍可在在途表中查到；
/// - **风险 (Trade-offs)**：字段声明顺序决定兜底路径的丢弃顺序，`completion` 必须先于 `registration`。
pub(crate) struct Operation {
    id: u64,
    handle: OpHandle,
    request: RemoteCommandRequest,
    ctx: CallContext,
    state: OperationState,
    connection: ConnectionSlot,
    protocol: ProtocolSlot,
    outbound: Option<Bytes>,
    reusable: bool,
    admitted_at: Instant,
    completion: Completion,
    registration: Registration,
}

impl Operation {
    pub(crate) fn new(
        id: u64,
        handle: OpHandle,
        request: RemoteCommandRequest,
        cancellation: Cancellation,
        completion: Completion,
        registration: Registration,
    ) -> Self {
        let deadline = request.timeout.map_or(Deadline::none(), Deadline::after);
        Self {
            id,
            handle,
            ctx: CallContext::new(cancellation, deadline),
            request,
            state: OperationState::Ready,
            connection: ConnectionSlot::Unacquired,
            protocol: ProtocolSlot::Unresolved,
            outbound: None,
            reusable: false,
            admitted_at: Instant::now(),
            completion,
            registration,
        }
    }

    /// 从未交给工作线程的操作：放弃回调并注销。
    pub(crate) fn reject(self) {
        let Operation {
            completion,
            registration,
            ..
        } = self;
        completion.disarm();
        drop(registration);
    }

    pub(crate) fn handle(&self) -> OpHandle {
        self.handle
    }

    fn transition(&mut self, next: OperationState) -> Result<(), ExecutorError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(ExecutorError::InvalidStateTransition {
                handle: self.handle,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// 推进到终态并触发回调。
    pub(crate) async fn run(mut self, dispatch: &Dispatch) {
        dispatch.emit(NetworkEvent::Admitted {
            handle: self.handle,
            target: self.request.target.clone(),
        });
        let status = self.drive(dispatch).await;
        self.complete(status, dispatch);
    }

    async fn drive(&mut self, dispatch: &Dispatch) -> ResponseStatus {
        let ctx = self.ctx.clone();
        ctx.checkpoint("before connection acquisition")?;

        let (connection, origin) = dispatch.pool.acquire(&ctx, &self.request.target).await?;
        self.connection = ConnectionSlot::Acquired(connection);
        self.reusable = true;
        self.transition(OperationState::ConnectionAcquired)?;
        dispatch.emit(NetworkEvent::ConnectionAcquired {
            handle: self.handle,
            origin,
        });

        let protocol = self.verify()?;
        dispatch.emit(NetworkEvent::ProtocolNegotiated {
            handle: self.handle,
            protocol,
        });

        ctx.checkpoint("before transmission")?;
        self.outbound = Some(dispatch.codec.encode(&self.request, protocol)?);
        self.transition(OperationState::Connected)?;
        let sent = self.transmit(&ctx).await?;
        dispatch.emit(NetworkEvent::RequestSent {
            handle: self.handle,
            request_id: sent.request_id,
            bytes: sent.bytes,
        });

        ctx.checkpoint("after the request was sent")?;
        let body = self.receive(&ctx, sent.request_id, dispatch).await?;
        let data = dispatch.codec.decode(body, protocol)?;
        ctx.checkpoint("before completion")?;

        Ok(RemoteCommandResponse {
            data,
            protocol,
            elapsed: self.admitted_at.elapsed(),
        })
    }

    /// 按本地与远端能力集确定线协议；没有交集即 `ProtocolMismatch`，不做降级。
    fn verify(&mut self) -> Result<Protocol, CommandError> {
        let ConnectionSlot::Acquired(connection) = &self.connection else {
            return Err(unbound("protocol verification"));
        };
        let Some(protocol) = connection.negotiated_protocol() else {
            return Err(CommandError::new(
                ErrorKind::ProtocolMismatch,
                format!(
                    "no common wire protocol with {}: local {} remote {}",
                    self.request.target,
                    connection.local_protocols(),
                    connection.remote_protocols()
                ),
            ));
        };
        self.protocol = ProtocolSlot::Resolved(protocol);
        self.transition(OperationState::ConnectionVerified)?;
        Ok(protocol)
    }

    /// 超限请求在写出任何字节之前失败，连接保持干净；一旦开始写出，连接即不可复用。
    async fn transmit(&mut self, ctx: &CallContext) -> Result<SentFrame, CommandError> {
        let protocol = self.protocol.resolved("transmission")?;
        let (ConnectionSlot::Acquired(connection), Some(payload)) =
            (&mut self.connection, &self.outbound)
        else {
            return Err(unbound("transmission"));
        };
        connection.check_request_size(payload.len())?;
        self.reusable = false;
        connection
            .send_request(ctx, OpCode::request_for(protocol), payload)
            .await
    }

    async fn receive(
        &mut self,
        ctx: &CallContext,
        request_id: i32,
        dispatch: &Dispatch,
    ) -> Result<Bytes, CommandError> {
        let protocol = self.protocol.resolved("reception")?;
        let ConnectionSlot::Acquired(connection) = &mut self.connection else {
            return Err(unbound("reception"));
        };
        let body_len = connection
            .read_reply_header(ctx, OpCode::reply_for(protocol), request_id)
            .await?;
        dispatch.emit(NetworkEvent::HeaderReceived {
            handle: self.handle,
            body_len,
        });
        let body = connection.read_reply_body(ctx, body_len).await?;
        dispatch.emit(NetworkEvent::BodyReceived {
            handle: self.handle,
            bytes: body.len(),
        });
        self.reusable = true;
        Ok(body)
    }

    fn complete(mut self, status: ResponseStatus, dispatch: &Dispatch) {
        match mem::replace(&mut self.connection, ConnectionSlot::Unacquired) {
            ConnectionSlot::Acquired(connection) if self.reusable => {
                dispatch.pool.release(connection)
            }
            ConnectionSlot::Acquired(connection) => dispatch.pool.discard(connection),
            ConnectionSlot::Unacquired => {}
        }
        let from = self.state;
        if let Err(err) = self.transition(OperationState::Completed) {
            error!(error = %err, "operation completed from an unexpected state");
        }

        match &status {
            Ok(response) => debug!(
                handle = %self.handle,
                id = self.id,
                protocol = response.protocol.name(),
                elapsed_ms = response.elapsed.as_millis() as u64,
                "command succeeded"
            ),
            Err(err) => debug!(
                handle = %self.handle,
                id = self.id,
                state = ?from,
                protocol = ?self.protocol,
                error = %err,
                "command failed"
            ),
        }
        dispatch.emit(NetworkEvent::Completed {
            handle: self.handle,
            outcome: status.as_ref().map(|_| ()).map_err(CommandError::kind),
        });

        let Operation {
            completion,
            registration,
            ..
        } = self;
        completion.finish(status);
        drop(registration);
        dispatch.work.signal();
    }
}

fn unbound(stage: &str) -> CommandError {
    CommandError::new(
        ErrorKind::InternalError,
        format!("no connection bound at {stage}"),
    )
}
