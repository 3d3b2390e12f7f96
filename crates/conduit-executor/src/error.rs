//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 编排层自身的失败只有两类：门面构建时配置不合法，以及状态机内部不变式被破坏；
//! - 前者同步返回给构建者，后者只在单个操作内部出现，经 `From` 转成该操作的失败状态。
//!
//! ## 设计要求（What）
//! - 所有变体派生 [`thiserror::Error`]；
//! - 状态机错误携带句柄与跃迁两端，便于定位是哪条路径越过了状态表。

use conduit_core::{CommandError, ConfigError, ErrorKind, OpHandle};
use thiserror::Error;

use crate::operation::OperationState;

/// 编排层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：`Operation::transition` 与 `NetworkInterfaceBuilder::build` 需要各自的失败分类，
///   但都不应让调用方直接面对传输细节；
/// - **契约 (What)**：`InvalidStateTransition` 只会在状态机实现有缺陷时出现，转换为
///   [`ErrorKind::InternalError`] 后交给该操作的完成回调；
/// - **风险 (Trade-offs)**：配置错误在构建阶段暴露，运行期不再重新校验。
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid network interface configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{handle}: state transition `{from:?}` -> `{to:?}` is not allowed")]
    InvalidStateTransition {
        handle: OpHandle,
        from: OperationState,
        to: OperationState,
    },
}

impl From<ExecutorError> for CommandError {
    fn from(value: ExecutorError) -> Self {
        CommandError::new(ErrorKind::InternalError, value.to_string())
    }
}
