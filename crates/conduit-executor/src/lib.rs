#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = r#"
# conduit-executor

## 设计动机（Why）
- **定位**：把 `conduit-transport-tcp` 的连接池与分帧组织成一个可从任意线程调用的同步门面，
  每条命令由一个 [`OperationState`] 状态机在专用工作线程上推进到终态。
- **架构角色**：实现 [`NetworkInterface`](conduit_core::NetworkInterface) 契约，
  生产实现为 [`NetworkInterfaceTokio`]，测试替身为 [`MockNetworkInterface`]。

## 核心契约（What）
- 受理的命令恰好收到一次回调，无论成功、失败、取消还是关闭；
- 取消在取连接之前、发送之前、请求写出之后三个检查点生效；请求写出后被撤回的连接不回池；
- `shutdown` 返回时在途表为空。

## 实现策略（How）
- 调用方线程只登记在途表（`DashMap`）并经无界通道交接操作；
- 工作线程运行单线程 Tokio 运行时，每个操作一个任务，互不阻塞；
- 完成事件经互斥锁加条件变量唤醒外部调度器。

## 风险与考量（Trade-offs）
- 完成回调在工作线程上同步执行，耗时回调会拖慢同一线程上的其他操作。
"#]

mod dispatcher;
mod error;
mod in_progress;
mod interface;
mod mock;
mod operation;
mod work_signal;

pub use conduit_transport_tcp::{AuthSession, Authenticator, PoolStats};
pub use error::ExecutorError;
pub use interface::{NetworkInterfaceBuilder, NetworkInterfaceTokio};
pub use mock::MockNetworkInterface;
pub use operation::OperationState;
