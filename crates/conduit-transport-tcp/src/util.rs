use std::{future::Future, io, time::Duration};

use conduit_core::{CallContext, Cancellation, CommandError};
use tokio::time::Instant as TokioInstant;

use crate::error::{OperationKind, cancelled_error, map_io_error, timeout_error};

const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(5);

async fn wait_for_cancellation(cancellation: &Cancellation) {
    while !cancellation.is_cancelled() {
        tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
    }
}

/// 在保留取消/超时语义的前提下等待任意 Future。
///
/// # 教案式注释
/// - **契约 (What)**：进入前已撤回或已超时则直接失败，不轮询 `future`；
///   等待期间取消优先于超时，超时优先于 `future` 的结果；
/// - **执行 (How)**：`biased` 的 `select!` 依次检查取消轮询、截止计时与业务 Future；
/// - **风险 (Trade-offs)**：取消通过 5ms 轮询感知，最坏延迟一个轮询周期；
///   被放弃的 `future` 随之析构，半完成的套接字操作由调用方决定是否丢弃连接。
pub(crate) async fn guard_with_context<F, T>(
    ctx: &CallContext,
    op: OperationKind,
    future: F,
) -> Result<T, CommandError>
where
    F: Future<Output = T>,
{
    if ctx.cancellation().is_cancelled() {
        return Err(cancelled_error(ctx, op));
    }
    if ctx.deadline().is_expired() {
        return Err(timeout_error(op));
    }

    let cancel = wait_for_cancellation(ctx.cancellation());
    tokio::pin!(cancel);
    tokio::pin!(future);

    match ctx.deadline().instant() {
        Some(deadline) => {
            let sleep = tokio::time::sleep_until(TokioInstant::from_std(deadline));
            tokio::pin!(sleep);
            tokio::select! {
                biased;
                _ = &mut cancel => Err(cancelled_error(ctx, op)),
                _ = &mut sleep => Err(timeout_error(op)),
                output = &mut future => Ok(output),
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = &mut cancel => Err(cancelled_error(ctx, op)),
                output = &mut future => Ok(output),
            }
        }
    }
}

/// 在保留取消/超时语义的前提下执行 IO Future，并按 `op` 映射 IO 错误。
pub(crate) async fn run_with_context<F, T>(
    ctx: &CallContext,
    op: OperationKind,
    future: F,
) -> Result<T, CommandError>
where
    F: Future<Output = io::Result<T>>,
{
    guard_with_context(ctx, op, future)
        .await?
        .map_err(|err| map_io_error(op, err))
}
