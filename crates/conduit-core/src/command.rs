//! # command 模块说明
//!
//! ## 角色定位（Why）
//! - 定义调用方与网络层之间的请求、响应与完成回调；
//! - 以类型保证“每个被受理的命令恰好收到一次回调”。
//!
//! ## 设计要求（What）
//! - [`Completion`] 只能通过 `finish(self, ..)` 消费一次；若在未完成时被丢弃，`Drop`
//!   以 `ShutdownInProgress` 补发回调，因此任何提前退出的路径都不会漏掉回调；
//! - 受理失败的命令通过 [`Completion::disarm`] 明确放弃回调。

use std::{
    fmt,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    endpoint::HostAndPort,
    error::{CommandError, ErrorKind},
    protocol::Protocol,
};

/// 调用方签发的不透明句柄，用于取消时定位在途操作。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OpHandle(u64);

impl OpHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// 发往远端的一条命令。
///
/// # 教案式说明
/// - **契约 (What)**：`payload` 对网络层不透明，只经由 `MessageCodec` 转成线上报文体；
///   `timeout` 从受理时刻起计，覆盖连接获取、发送与接收全过程；
/// - **风险 (Trade-offs)**：`issued_at` 在构造时记录，若调用方构造后延迟提交，`elapsed` 会包含这段等待。
#[derive(Clone, Debug)]
pub struct RemoteCommandRequest {
    pub target: HostAndPort,
    pub db_name: String,
    pub payload: Bytes,
    pub timeout: Option<Duration>,
    pub issued_at: Instant,
}

impl RemoteCommandRequest {
    pub fn new(target: HostAndPort, db_name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            target,
            db_name: db_name.into(),
            payload,
            timeout: None,
            issued_at: Instant::now(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 成功响应。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommandResponse {
    /// 经 `MessageCodec` 解码后的响应体。
    pub data: Bytes,
    /// 本次往返使用的线协议。
    pub protocol: Protocol,
    /// 自受理起的耗时。
    pub elapsed: Duration,
}

/// 完成回调收到的终态。
pub type ResponseStatus = Result<RemoteCommandResponse, CommandError>;

/// 调用方提供的完成回调。
pub type CompletionFn = Box<dyn FnOnce(ResponseStatus) + Send + 'static>;

/// 单次触发的完成回调包装。
///
/// # 教案式说明
/// - **意图 (Why)**：回调所有权随操作在表与工作线程之间移动，任何分支都可能是最后一站；
/// - **契约 (What)**：`finish` 消费自身并触发回调；`disarm` 消费自身但不触发；
///   两者都未调用即被丢弃时，`Drop` 以 `ShutdownInProgress` 触发；
/// - **风险 (Trade-offs)**：回调在完成它的线程上同步执行，耗时回调会阻塞工作线程上的其他操作。
pub struct Completion {
    callback: Option<CompletionFn>,
}

impl Completion {
    pub fn new(callback: CompletionFn) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    pub fn from_fn<F>(callback: F) -> Self
    where
        F: FnOnce(ResponseStatus) + Send + 'static,
    {
        Self::new(Box::new(callback))
    }

    /// 以终态触发回调。
    pub fn finish(mut self, status: ResponseStatus) {
        if let Some(callback) = self.callback.take() {
            callback(status);
        }
    }

    /// 放弃回调，仅用于从未受理的命令。
    pub fn disarm(mut self) {
        self.callback = None;
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(CommandError::new(
                ErrorKind::ShutdownInProgress,
                "operation dropped before completion",
            )));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("armed", &self.callback.is_some())
            .finish()
    }
}
