//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 命令通道上的每一种失败都必须落到一个封闭的分类里，调用方才能区分“从未受理”、
//!   “受理后失败”与“受理后被撤回”三类结局；
//! - 稳定错误码（`conduit.network.*`）供日志与告警聚合，不随文案变化。
//!
//! ## 设计要求（What）
//! - [`ErrorKind`] 是封闭枚举；[`CommandError`] 是 `ResponseStatus` 的失败半边；
//! - [`LifecycleError`] 只描述门面生命周期的误用，不会进入完成回调。

use std::borrow::Cow;

use thiserror::Error;

/// 命令失败的分类。
///
/// # 教案式说明
/// - **意图 (Why)**：把建连、握手、认证、协议与收发失败，连同撤回与受理失败，收敛为有限集合，
///   每一类都只影响所属的那一个操作；
/// - **契约 (What)**：`NotRunning` 与 `DuplicateHandle` 只会由 `start_command` 同步返回，
///   其余类别只会出现在完成回调中；
/// - **风险 (Trade-offs)**：本层不做重试，调用方若据此分类决定重试，需要以全新命令重新提交。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 解析目标地址或建立 TCP 连接失败。
    ConnectFailed,
    /// 安全传输握手或协议探测失败。
    HandshakeFailed,
    /// 认证协作方拒绝或认证往返失败。
    AuthFailed,
    /// 本地与远端协议能力集没有交集。
    ProtocolMismatch,
    /// 消息体长度超过配置上限。
    MessageTooLarge,
    /// 写出请求失败。
    WriteFailed,
    /// 读取或解析响应失败。
    ReadFailed,
    /// 调用方主动取消。
    Canceled,
    /// 门面关闭导致撤回。
    ShutdownInProgress,
    /// 门面不在 `Running` 状态，命令未被受理。
    NotRunning,
    /// 请求级截止时间已过。
    ExceededTimeLimit,
    /// 同一句柄已有在途操作，命令未被受理。
    DuplicateHandle,
    /// 状态机内部不变式被破坏。
    InternalError,
}

impl ErrorKind {
    /// 返回稳定错误码。
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::ConnectFailed => "conduit.network.connect_failed",
            ErrorKind::HandshakeFailed => "conduit.network.handshake_failed",
            ErrorKind::AuthFailed => "conduit.network.auth_failed",
            ErrorKind::ProtocolMismatch => "conduit.network.protocol_mismatch",
            ErrorKind::MessageTooLarge => "conduit.network.message_too_large",
            ErrorKind::WriteFailed => "conduit.network.write_failed",
            ErrorKind::ReadFailed => "conduit.network.read_failed",
            ErrorKind::Canceled => "conduit.network.canceled",
            ErrorKind::ShutdownInProgress => "conduit.network.shutdown_in_progress",
            ErrorKind::NotRunning => "conduit.network.not_running",
            ErrorKind::ExceededTimeLimit => "conduit.network.exceeded_time_limit",
            ErrorKind::DuplicateHandle => "conduit.network.duplicate_handle",
            ErrorKind::InternalError => "conduit.network.internal_error",
        }
    }

    /// 是否属于“受理后被撤回”。
    pub fn is_withdrawn(self) -> bool {
        matches!(self, ErrorKind::Canceled | ErrorKind::ShutdownInProgress)
    }

    /// 是否属于“从未受理”，这类错误不会触发完成回调。
    pub fn is_admission(self) -> bool {
        matches!(self, ErrorKind::NotRunning | ErrorKind::DuplicateHandle)
    }
}

/// 单个命令的失败描述。
///
/// # 教案式说明
/// - **意图 (Why)**：作为 `ResponseStatus` 的 `Err` 分支交给完成回调，携带分类与排障文案；
/// - **契约 (What)**：`kind` 决定语义，`message` 仅供人读，不承诺稳定；
/// - **风险 (Trade-offs)**：使用 `Cow<'static, str>` 保存文案，静态文案零分配，动态文案一次分配。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("[{}] {message}", .kind.code())]
pub struct CommandError {
    kind: ErrorKind,
    message: Cow<'static, str>,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// 门面未运行时的受理失败。
    pub fn not_running() -> Self {
        Self::new(ErrorKind::NotRunning, "network interface is not running")
    }

    pub fn canceled(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn shutdown_in_progress(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::ShutdownInProgress, message)
    }
}

/// 门面生命周期的误用。
///
/// - **契约 (What)**：`startup` 只能在 `Ready` 调用一次；`shutdown` 只能在 `Running` 调用一次；
///   进入 `Shutdown` 后不可逆。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LifecycleError {
    #[error("network interface already started")]
    AlreadyStarted,
    #[error("network interface was never started")]
    NotStarted,
    #[error("network interface already shut down")]
    AlreadyShutdown,
    #[error("failed to spawn network worker: {detail}")]
    WorkerSpawn { detail: String },
}
