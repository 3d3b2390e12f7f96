//! # dispatcher 模块说明
//!
//! ## 角色定位（Why）
//! - 所有操作的推进都发生在一个专用工作线程上：该线程运行单线程 Tokio 运行时，
//!   套接字就绪与计时器回调都在这里被驱动；
//! - 外部线程通过无界通道把新操作交给工作线程，不直接接触操作或连接状态。
//!
//! ## 契约（What）
//! - 每个收到的操作成为一个独立任务，彼此之间没有完成顺序保证；
//! - 通道的全部发送端被丢弃后，事件循环不再接收新操作，等待已有任务全部结束后退出；
//! - 任务异常退出（回调 panic 等）只影响该操作，由 `Completion` 的兜底保证回调语义。
//!
//! ## 风险（Trade-offs）
//! - `Worker::join` 会阻塞调用线程，不能在工作线程自身（例如完成回调内部）调用。

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use conduit_core::LifecycleError;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::{JoinError, JoinSet},
};
use tracing::{debug, error};

use crate::operation::{Dispatch, Operation};

const WORKER_THREAD_NAME: &str = "conduit-network";

/// 工作线程句柄。
pub(crate) struct Worker {
    sender: UnboundedSender<Operation>,
    thread: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn(dispatch: Arc<Dispatch>) -> Result<Self, LifecycleError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| LifecycleError::WorkerSpawn {
                detail: err.to_string(),
            })?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_owned())
            .spawn(move || runtime.block_on(event_loop(dispatch, receiver)))
            .map_err(|err| LifecycleError::WorkerSpawn {
                detail: err.to_string(),
            })?;
        Ok(Self { sender, thread })
    }

    /// 把操作交给工作线程；事件循环已退出时原样退回。
    pub(crate) fn submit(&self, operation: Operation) -> Result<(), Operation> {
        self.sender.send(operation).map_err(|rejected| rejected.0)
    }

    /// 关闭交接通道并等待事件循环排空退出。
    pub(crate) fn join(self) {
        let Worker { sender, thread } = self;
        drop(sender);
        if thread.join().is_err() {
            error!("network worker thread panicked");
        }
    }
}

async fn event_loop(dispatch: Arc<Dispatch>, mut receiver: UnboundedReceiver<Operation>) {
    debug!("network worker started");
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            next = receiver.recv() => match next {
                Some(operation) => {
                    let dispatch = Arc::clone(&dispatch);
                    tasks.spawn(async move { operation.run(&dispatch).await });
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => reap(joined),
        }
    }

    let draining = tasks.len();
    while let Some(joined) = tasks.join_next().await {
        reap(joined);
    }
    debug!(draining, "network worker drained");
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(err) = joined
        && err.is_panic()
    {
        error!(error = %err, "operation task panicked");
    }
}
