use std::time::Instant;

use crate::{
    command::{CompletionFn, OpHandle, RemoteCommandRequest},
    error::{CommandError, LifecycleError},
};

/// 节点间命令通道门面。
///
/// # 教案式说明
/// - **意图 (Why)**：上层调度器只依赖这一组能力；生产实现驱动真实套接字，
///   测试替身在内存中记录请求并由测试决定结局；
/// - **契约 (What)**：
///   - 生命周期只能 `Ready → Running → Shutdown` 单向推进，误用以 [`LifecycleError`] 报告；
///   - `start_command` 成功返回即表示命令已受理，`on_finish` 此后恰好被调用一次；
///     返回 `Err` 时命令未受理，`on_finish` 被丢弃且永不调用；
///   - `cancel_command` 对未知或已完成的句柄是空操作；
///   - `shutdown` 返回时所有在途操作都已收到回调；
/// - **风险 (Trade-offs)**：所有方法都是同步的，`shutdown` 与 `wait_for_work*` 会阻塞调用线程，
///   不应在异步运行时的工作线程上调用。
pub trait NetworkInterface: Send + Sync {
    fn startup(&self) -> Result<(), LifecycleError>;

    fn shutdown(&self) -> Result<(), LifecycleError>;

    fn in_shutdown(&self) -> bool;

    /// 阻塞直到有完成事件可收割。
    fn wait_for_work(&self);

    /// 阻塞直到有完成事件可收割或到达 `deadline`。
    fn wait_for_work_until(&self, deadline: Instant);

    fn signal_work_available(&self);

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn start_command(
        &self,
        handle: OpHandle,
        request: RemoteCommandRequest,
        on_finish: CompletionFn,
    ) -> Result<(), CommandError>;

    fn cancel_command(&self, handle: OpHandle);

    fn diagnostic_string(&self) -> String;

    fn host_name(&self) -> String;
}
