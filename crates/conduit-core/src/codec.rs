use bytes::Bytes;

use crate::{
    command::RemoteCommandRequest,
    error::{CommandError, ErrorKind},
    protocol::Protocol,
};

/// 命令负载的编解码协作方。
///
/// # 教案式说明
/// - **意图 (Why)**：网络层只负责分帧与传输，命令文档如何落到报文体由上层决定；
/// - **契约 (What)**：`encode` 产出报文体（不含帧头）；`decode` 接收完整报文体并返回交给回调的数据；
///   两者都可能依赖已协商的 `protocol`；
/// - **风险 (Trade-offs)**：实现运行在工作线程上，应保持纯计算、不阻塞。
pub trait MessageCodec: Send + Sync + 'static {
    fn encode(
        &self,
        request: &RemoteCommandRequest,
        protocol: Protocol,
    ) -> Result<Bytes, CommandError>;

    fn decode(&self, body: Bytes, protocol: Protocol) -> Result<Bytes, CommandError>;
}

/// 原样透传负载的编解码器，门面的默认选择。
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughCodec;

impl MessageCodec for PassthroughCodec {
    fn encode(
        &self,
        request: &RemoteCommandRequest,
        _protocol: Protocol,
    ) -> Result<Bytes, CommandError> {
        Ok(request.payload.clone())
    }

    fn decode(&self, body: Bytes, _protocol: Protocol) -> Result<Bytes, CommandError> {
        Ok(body)
    }
}

/// 把编解码失败归入读写分类的辅助函数。
pub fn codec_error(kind: ErrorKind, detail: impl std::fmt::Display) -> CommandError {
    CommandError::new(kind, format!("codec: {detail}"))
}
