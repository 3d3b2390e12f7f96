//! # frame 模块说明
//!
//! ## 角色定位（Why）
//! - 线上报文固定为“16 字节帧头 + 报文体”，读端必须先读满帧头才知道报文体长度；
//! - 长度字段来自远端，是不可信输入：超过上限时在分配缓冲之前失败。
//!
//! ## 帧头布局（What，小端序）
//! | 偏移 | 字段 | 类型 |
//! |------|------|------|
//! | 0 | `message_length`（含帧头） | `u32` |
//! | 4 | `request_id` | `i32` |
//! | 8 | `response_to` | `i32` |
//! | 12 | `op_code` | `i32` |

use std::sync::atomic::{AtomicI32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use conduit_core::{CommandError, ErrorKind, Protocol};
use thiserror::Error;

pub const HEADER_LEN: usize = 16;

/// 报文操作码。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OpCode {
    Reply,
    Query,
    CommandV1,
    CommandReplyV1,
    Hello,
    HelloReply,
    Auth,
    AuthReply,
}

impl OpCode {
    pub const fn code(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Query => 2004,
            OpCode::CommandV1 => 2010,
            OpCode::CommandReplyV1 => 2011,
            OpCode::Hello => 2100,
            OpCode::HelloReply => 2101,
            OpCode::Auth => 2102,
            OpCode::AuthReply => 2103,
        }
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => OpCode::Reply,
            2004 => OpCode::Query,
            2010 => OpCode::CommandV1,
            2011 => OpCode::CommandReplyV1,
            2100 => OpCode::Hello,
            2101 => OpCode::HelloReply,
            2102 => OpCode::Auth,
            2103 => OpCode::AuthReply,
            _ => return None,
        })
    }

    /// 某个线协议下命令请求使用的操作码。
    pub const fn request_for(protocol: Protocol) -> Self {
        match protocol {
            Protocol::OpQuery => OpCode::Query,
            Protocol::OpCommandV1 => OpCode::CommandV1,
        }
    }

    /// 某个线协议下命令响应应携带的操作码。
    pub const fn reply_for(protocol: Protocol) -> Self {
        match protocol {
            Protocol::OpQuery => OpCode::Reply,
            Protocol::OpCommandV1 => OpCode::CommandReplyV1,
        }
    }
}

/// 解码后的帧头。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub message_length: u32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl FrameHeader {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u32_le(self.message_length);
        dst.put_i32_le(self.request_id);
        dst.put_i32_le(self.response_to);
        dst.put_i32_le(self.op_code);
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        let mut src = &raw[..];
        Self {
            message_length: src.get_u32_le(),
            request_id: src.get_i32_le(),
            response_to: src.get_i32_le(),
            op_code: src.get_i32_le(),
        }
    }

    pub fn op(&self) -> Option<OpCode> {
        OpCode::from_code(self.op_code)
    }
}

/// 帧校验失败。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum FrameError {
    #[error("declared message length {0} is shorter than the frame header")]
    TooShort(u32),
    #[error("message body of {len} bytes exceeds the limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("unexpected op code {found}, expected {expected:?}")]
    UnexpectedOpCode { found: i32, expected: OpCode },
    #[error("reply answers request {found}, expected {expected}")]
    ResponseMismatch { found: i32, expected: i32 },
}

impl FrameError {
    /// 超限一律为 `MessageTooLarge`，其余落入调用方所在阶段的分类。
    pub fn into_command_error(self, fallback: ErrorKind) -> CommandError {
        let kind = match self {
            FrameError::TooLarge { .. } => ErrorKind::MessageTooLarge,
            _ => fallback,
        };
        CommandError::new(kind, self.to_string())
    }
}

/// 报文体长度上限。
///
/// # 教案式说明
/// - **契约 (What)**：入站与出站共用同一上限；`check_inbound` 返回可安全分配的报文体长度；
/// - **风险 (Trade-offs)**：上限来自配置，必须能装进 32 位长度字段，校验由配置层完成。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameLimits {
    max_body: usize,
}

impl FrameLimits {
    pub const fn new(max_body: usize) -> Self {
        Self { max_body }
    }

    pub const fn max_body(&self) -> usize {
        self.max_body
    }

    pub fn check_inbound(&self, header: &FrameHeader) -> Result<usize, FrameError> {
        let total = header.message_length as usize;
        if total < HEADER_LEN {
            return Err(FrameError::TooShort(header.message_length));
        }
        let len = total - HEADER_LEN;
        if len > self.max_body {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_body,
            });
        }
        Ok(len)
    }

    /// 校验出站报文体并返回帧头中的总长度。
    pub fn check_outbound(&self, body_len: usize) -> Result<u32, FrameError> {
        if body_len > self.max_body {
            return Err(FrameError::TooLarge {
                len: body_len,
                max: self.max_body,
            });
        }
        u32::try_from(body_len + HEADER_LEN).map_err(|_| FrameError::TooLarge {
            len: body_len,
            max: self.max_body,
        })
    }
}

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// 进程内单调递增的请求号，回绕后跳过 0。
pub fn next_request_id() -> i32 {
    loop {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// 组装完整报文（帧头 + 报文体）。
pub fn encode_message(
    limits: &FrameLimits,
    request_id: i32,
    response_to: i32,
    op: OpCode,
    body: &[u8],
) -> Result<Bytes, FrameError> {
    let message_length = limits.check_outbound(body.len())?;
    let mut buf = BytesMut::with_capacity(message_length as usize);
    FrameHeader {
        message_length,
        request_id,
        response_to,
        op_code: op.code(),
    }
    .encode(&mut buf);
    buf.put_slice(body);
    Ok(buf.freeze())
}
