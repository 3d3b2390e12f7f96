use std::io;

use conduit_core::{CallContext, CommandError, ErrorKind};

/// 一次底层操作对应的失败分类与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub kind: ErrorKind,
    pub message: &'static str,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    kind: ErrorKind::ConnectFailed,
    message: "tcp resolve",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    kind: ErrorKind::ConnectFailed,
    message: "tcp connect",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    kind: ErrorKind::ConnectFailed,
    message: "tcp configure",
};
pub(crate) const TLS_HANDSHAKE: OperationKind = OperationKind {
    kind: ErrorKind::HandshakeFailed,
    message: "tls handshake",
};
pub(crate) const AUTH: OperationKind = OperationKind {
    kind: ErrorKind::AuthFailed,
    message: "auth exchange",
};
pub(crate) const HELLO: OperationKind = OperationKind {
    kind: ErrorKind::HandshakeFailed,
    message: "protocol probe",
};
pub(crate) const TICKET: OperationKind = OperationKind {
    kind: ErrorKind::ConnectFailed,
    message: "connection ticket",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    kind: ErrorKind::WriteFailed,
    message: "tcp write",
};
pub(crate) const READ: OperationKind = OperationKind {
    kind: ErrorKind::ReadFailed,
    message: "tcp read",
};

/// 将 IO 错误映射为该操作所属分类的命令错误。
pub(crate) fn map_io_error(op: OperationKind, error: io::Error) -> CommandError {
    let detail = match error.kind() {
        io::ErrorKind::UnexpectedEof => "connection closed by peer".to_owned(),
        _ => error.to_string(),
    };
    CommandError::new(op.kind, format!("{}: {detail}", op.message))
}

/// 以该操作的分类包装非 IO 失败。
pub(crate) fn op_error(op: OperationKind, detail: impl std::fmt::Display) -> CommandError {
    CommandError::new(op.kind, format!("{}: {detail}", op.message))
}

/// 构造撤回错误，原因取自上下文中首次生效的取消。
pub(crate) fn cancelled_error(ctx: &CallContext, op: OperationKind) -> CommandError {
    match ctx.cancellation().reason() {
        Some(reason) => reason.into_error(format_args!("during {}", op.message)),
        None => CommandError::canceled(format!("{} cancelled", op.message)),
    }
}

/// 构造超时错误。
pub(crate) fn timeout_error(op: OperationKind) -> CommandError {
    CommandError::new(
        ErrorKind::ExceededTimeLimit,
        format!("{} timed out", op.message),
    )
}

/// 是否属于撤回或超时，这两类不应被建立阶段的分类覆盖。
pub(crate) fn is_interruption(error: &CommandError) -> bool {
    error.kind().is_withdrawn() || error.kind() == ErrorKind::ExceededTimeLimit
}
