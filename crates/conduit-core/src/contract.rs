use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

// 启用 `--cfg loom` 时切换到 loom 的原子类型，让模型检查覆盖“先到者胜”的全部交错；
// `Arc` 保持标准实现。
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU8, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU8, Ordering};

use crate::error::{CommandError, ErrorKind};

/// 撤回一个操作的原因。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CancelReason {
    /// 调用方通过 `cancel_command` 主动取消。
    Canceled,
    /// 门面关闭时统一撤回。
    Shutdown,
}

impl CancelReason {
    const fn encode(self) -> u8 {
        match self {
            CancelReason::Canceled => 1,
            CancelReason::Shutdown => 2,
        }
    }

    const fn decode(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(CancelReason::Canceled),
            2 => Some(CancelReason::Shutdown),
            _ => None,
        }
    }

    /// 转换为完成回调使用的失败状态。
    pub fn into_error(self, stage: impl fmt::Display) -> CommandError {
        match self {
            CancelReason::Canceled => {
                CommandError::new(ErrorKind::Canceled, format!("command canceled {stage}"))
            }
            CancelReason::Shutdown => CommandError::new(
                ErrorKind::ShutdownInProgress,
                format!("network interface shutting down {stage}"),
            ),
        }
    }
}

const NOT_CANCELLED: u8 = 0;

/// 协作式取消令牌。
///
/// # 设计背景（Why）
/// - `cancel_command` 可以在任意线程、任意时刻调用，而操作的推进只发生在工作线程；
///   两者之间只共享这一个原子字节。
///
/// # 逻辑解析（How）
/// - 内部 [`AtomicU8`] 为 0 表示未取消，非 0 编码 [`CancelReason`]；
/// - `cancel` 通过 `compare_exchange` 保证第一次设置的原因生效，之后的调用返回 `false`
///   且不会覆盖原因，因此“先被取消、再遇到关闭”的操作仍以 `Canceled` 结束。
///
/// # 契约说明（What）
/// - 令牌只负责标记，不会打断进行中的系统调用；状态机在检查点读取它。
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<AtomicU8>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(NOT_CANCELLED)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Acquire) != NOT_CANCELLED
    }

    /// 以给定原因标记取消。
    ///
    /// 返回 `true` 表示本次调用首次触发取消。
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.inner
            .compare_exchange(
                NOT_CANCELLED,
                reason.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 返回首次生效的取消原因。
    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::decode(self.inner.load(Ordering::Acquire))
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("reason", &self.reason())
            .finish()
    }
}

/// 操作的绝对截止时间。
///
/// # 契约说明（What）
/// - 为空表示调用方未施加超时；
/// - 截止时间不会自动驱动取消，检查点与 I/O 等待各自比较当前时间。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    pub const fn none() -> Self {
        Self { instant: None }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以当前时间加持续时间构造。溢出时视为不设限。
    pub fn after(timeout: Duration) -> Self {
        Self {
            instant: Instant::now().checked_add(timeout),
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.instant.is_some_and(|deadline| now >= deadline)
    }

    /// 距离截止还剩多久；未设置时返回 `None`，已过期时返回零。
    pub fn remaining(&self) -> Option<Duration> {
        self.instant
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// 取两个截止时间中较早的一个。
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.instant, other.instant) {
            (Some(a), Some(b)) => Deadline::at(a.min(b)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }
}

/// 单个操作的执行上下文：取消令牌与截止时间。
///
/// 克隆共享同一取消令牌；连接建立、读写等待都通过它观察撤回信号。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    pub fn new(cancellation: Cancellation, deadline: Deadline) -> Self {
        Self {
            cancellation,
            deadline,
        }
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// 派生一个截止时间更紧的上下文，取消令牌保持共享。
    pub fn with_tighter_deadline(&self, deadline: Deadline) -> Self {
        Self {
            cancellation: self.cancellation.clone(),
            deadline: self.deadline.min(deadline),
        }
    }

    /// 检查点：已撤回或已超时则返回对应的失败状态。
    ///
    /// 取消优先于超时判定，`stage` 只进入错误文案。
    pub fn checkpoint(&self, stage: &'static str) -> Result<(), CommandError> {
        if let Some(reason) = self.cancellation.reason() {
            return Err(reason.into_error(stage));
        }
        if self.deadline.is_expired() {
            return Err(CommandError::new(
                ErrorKind::ExceededTimeLimit,
                format!("deadline exceeded {stage}"),
            ));
        }
        Ok(())
    }
}
