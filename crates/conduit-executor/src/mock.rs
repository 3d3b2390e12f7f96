//! # mock 模块说明
//!
//! ## 角色定位（Why）
//! - 上层调度器的单元测试不应依赖真实套接字；[`MockNetworkInterface`] 实现同一个
//!   [`NetworkInterface`] 契约，把受理的命令留在内存里，由测试决定每条命令的结局。
//!
//! ## 契约（What）
//! - 生命周期误用与生产实现报告同样的 [`LifecycleError`]；
//! - 每条受理的命令恰好完成一次：`respond` 给出测试指定的终态，`cancel_command` 给出
//!   `Canceled`，`shutdown` 给出 `ShutdownInProgress`；
//! - 回调总是在释放内部锁之后执行，回调内部可以再次调用本实例。

use std::{collections::BTreeMap, time::Instant};

use conduit_core::{
    CommandError, Completion, CompletionFn, ErrorKind, LifecycleError, NetworkInterface,
    OpHandle, RemoteCommandRequest, ResponseStatus,
};
use parking_lot::Mutex;
use tracing::warn;

use crate::work_signal::WorkSignal;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Ready,
    Running,
    Shutdown,
}

struct Pending {
    request: RemoteCommandRequest,
    completion: Completion,
}

struct MockState {
    phase: Phase,
    pending: BTreeMap<OpHandle, Pending>,
    admitted: u64,
}

/// 内存中的网络接口替身。
pub struct MockNetworkInterface {
    state: Mutex<MockState>,
    work: WorkSignal,
    host_name: String,
}

impl MockNetworkInterface {
    pub fn new() -> Self {
        Self::with_host_name("mock.conduit.local")
    }

    pub fn with_host_name(host_name: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(MockState {
                phase: Phase::Ready,
                pending: BTreeMap::new(),
                admitted: 0,
            }),
            work: WorkSignal::default(),
            host_name: host_name.into(),
        }
    }

    /// 尚未给出结局的命令句柄，按句柄升序。
    pub fn pending_handles(&self) -> Vec<OpHandle> {
        self.state.lock().pending.keys().copied().collect()
    }

    /// 查看某条待决命令的请求副本。
    pub fn request(&self, handle: OpHandle) -> Option<RemoteCommandRequest> {
        self.state
            .lock()
            .pending
            .get(&handle)
            .map(|pending| pending.request.clone())
    }

    /// 以 `status` 完成一条待决命令；句柄未知或已完成时返回 `false`。
    pub fn respond(&self, handle: OpHandle, status: ResponseStatus) -> bool {
        let Some(pending) = self.state.lock().pending.remove(&handle) else {
            return false;
        };
        pending.completion.finish(status);
        self.work.signal();
        true
    }
}

impl Default for MockNetworkInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInterface for MockNetworkInterface {
    fn startup(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Ready => {
                state.phase = Phase::Running;
                Ok(())
            }
            Phase::Running => {
                warn!("startup requested on a running mock network interface");
                Err(LifecycleError::AlreadyStarted)
            }
            Phase::Shutdown => {
                warn!("startup requested after mock shutdown");
                Err(LifecycleError::AlreadyShutdown)
            }
        }
    }

    fn shutdown(&self) -> Result<(), LifecycleError> {
        let drained = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Running => {}
                Phase::Ready => {
                    warn!("shutdown requested before mock startup");
                    return Err(LifecycleError::NotStarted);
                }
                Phase::Shutdown => return Err(LifecycleError::AlreadyShutdown),
            }
            state.phase = Phase::Shutdown;
            std::mem::take(&mut state.pending)
        };
        for (handle, pending) in drained {
            pending.completion.finish(Err(CommandError::shutdown_in_progress(format!(
                "{handle} drained by mock shutdown"
            ))));
        }
        self.work.signal();
        Ok(())
    }

    fn in_shutdown(&self) -> bool {
        self.state.lock().phase == Phase::Shutdown
    }

    fn wait_for_work(&self) {
        self.work.wait();
    }

    fn wait_for_work_until(&self, deadline: Instant) {
        self.work.wait_until(deadline);
    }

    fn signal_work_available(&self) {
        self.work.signal();
    }

    fn start_command(
        &self,
        handle: OpHandle,
        request: RemoteCommandRequest,
        on_finish: CompletionFn,
    ) -> Result<(), CommandError> {
        let completion = Completion::new(on_finish);
        let mut state = self.state.lock();
        if state.phase != Phase::Running {
            drop(state);
            completion.disarm();
            return Err(CommandError::not_running());
        }
        if state.pending.contains_key(&handle) {
            drop(state);
            completion.disarm();
            return Err(CommandError::new(
                ErrorKind::DuplicateHandle,
                format!("{handle} is already pending"),
            ));
        }
        state.pending.insert(
            handle,
            Pending {
                request,
                completion,
            },
        );
        state.admitted += 1;
        Ok(())
    }

    fn cancel_command(&self, handle: OpHandle) {
        let Some(pending) = self.state.lock().pending.remove(&handle) else {
            return;
        };
        pending
            .completion
            .finish(Err(CommandError::canceled(format!("{handle} canceled"))));
        self.work.signal();
    }

    fn diagnostic_string(&self) -> String {
        let state = self.state.lock();
        format!(
            "MockNetworkInterface state={:?} pending={} admitted={}",
            state.phase,
            state.pending.len(),
            state.admitted
        )
    }

    fn host_name(&self) -> String {
        self.host_name.clone()
    }
}
