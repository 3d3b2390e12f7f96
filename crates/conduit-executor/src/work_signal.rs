use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// “有完成事件可收割”信号。
///
/// # 教案式说明
/// - **意图 (Why)**：外部调度器在自己的线程上阻塞等待，工作线程每完成一个操作就唤醒它；
/// - **契约 (What)**：`signal` 置位并唤醒全部等待者；`wait*` 返回时消费该位，
///   因此在等待之前发出的信号不会丢失；
/// - **风险 (Trade-offs)**：多次信号在一次等待中合并，等待方需要自行收割全部完成结果。
#[derive(Debug, Default)]
pub(crate) struct WorkSignal {
    pending: Mutex<bool>,
    ready: Condvar,
}

impl WorkSignal {
    pub(crate) fn signal(&self) {
        *self.pending.lock() = true;
        self.ready.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut pending = self.pending.lock();
        while !*pending {
            self.ready.wait(&mut pending);
        }
        *pending = false;
    }

    /// 返回 `true` 表示被信号唤醒，`false` 表示到达截止时间。
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let mut pending = self.pending.lock();
        while !*pending {
            if self.ready.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *pending, false)
    }
}
