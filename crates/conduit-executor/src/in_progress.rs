//! # in_progress 模块说明
//!
//! ## 角色定位（Why）
//! - 记录每个已受理、尚未完成的操作，供 `cancel_command` 按句柄定位，也供 `shutdown` 统一撤回；
//! - 外部线程只通过这里接触在途操作，且只能翻转其取消令牌。
//!
//! ## 行为契约（What）
//! - `register`：句柄已被在途操作占用时返回 `DuplicateHandle`，否则返回一个 [`Registration`]；
//! - [`Registration`] 随操作一起移动，操作完成（或被丢弃）时在 `Drop` 中移除表项，
//!   因此“表中可达”与“尚未完成”始终一致；
//! - 表项以受理序号区分代际，旧登记的 `Drop` 不会误删同句柄的新表项。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` 分片锁只在插入、移除与遍历时短暂持有，不跨越任何 I/O。

use std::{sync::Arc, time::Instant};

use conduit_core::{CancelReason, Cancellation, CommandError, ErrorKind, HostAndPort, OpHandle};
use dashmap::{DashMap, mapref::entry::Entry};

#[derive(Debug)]
struct InProgressEntry {
    id: u64,
    target: HostAndPort,
    cancellation: Cancellation,
    admitted_at: Instant,
}

/// 在途操作表。
#[derive(Debug, Default)]
pub(crate) struct InProgressTable {
    entries: DashMap<OpHandle, InProgressEntry>,
}

impl InProgressTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        handle: OpHandle,
        id: u64,
        target: HostAndPort,
        cancellation: Cancellation,
    ) -> Result<Registration, CommandError> {
        match self.entries.entry(handle) {
            Entry::Occupied(occupied) => Err(CommandError::new(
                ErrorKind::DuplicateHandle,
                format!(
                    "{handle} is already in progress against {}",
                    occupied.get().target
                ),
            )),
            Entry::Vacant(vacant) => {
                vacant.insert(InProgressEntry {
                    id,
                    target,
                    cancellation,
                    admitted_at: Instant::now(),
                });
                Ok(Registration {
                    table: Arc::clone(self),
                    handle,
                    id,
                })
            }
        }
    }

    /// 翻转句柄对应操作的取消令牌；未知句柄返回 `false`。
    pub(crate) fn cancel(&self, handle: OpHandle, reason: CancelReason) -> bool {
        self.entries
            .get(&handle)
            .is_some_and(|entry| entry.cancellation.cancel(reason))
    }

    /// 以同一原因撤回全部在途操作，返回当时在表中的操作数。
    pub(crate) fn cancel_all(&self, reason: CancelReason) -> usize {
        let mut live = 0;
        for entry in self.entries.iter() {
            entry.cancellation.cancel(reason);
            live += 1;
        }
        live
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 最早受理且仍在途的操作已等待的时长。
    pub(crate) fn oldest_age(&self) -> Option<std::time::Duration> {
        self.entries
            .iter()
            .map(|entry| entry.admitted_at)
            .min()
            .map(|admitted_at| admitted_at.elapsed())
    }

    fn remove(&self, handle: OpHandle, id: u64) {
        self.entries.remove_if(&handle, |_, entry| entry.id == id);
    }
}

/// 在途表中的一个登记；丢弃即注销。
#[derive(Debug)]
pub(crate) struct Registration {
    table: Arc<InProgressTable>,
    handle: OpHandle,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.remove(self.handle, self.id);
    }
}
