//! # pool 模块说明
//!
//! ## 角色定位（Why）
//! - 按目标地址缓存空闲连接，避免每个命令都走一遍解析、连接、握手与探测；
//! - 新建连接受全局票据约束，突发流量下同时在建的连接数不超过 `max_connecting`。
//!
//! ## 契约（What）
//! - `acquire` 先查空闲集合，命中即返回且不消耗票据；未命中时取票，取票后再查一次空闲集合，
//!   仍未命中才新建；
//! - 一条连接同一时刻只属于一个持有者：出池即从集合移除，`release` 或 `discard` 之后才可能再被分配；
//! - `release` 只接收可安全复用的连接；写出请求后未读完应答的连接必须走 `discard`。
//!
//! ## 风险（Trade-offs）
//! - 空闲集合按后进先出取用，最近使用的连接优先，较旧的连接自然老化并在出池检查时被淘汰。

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use conduit_core::{
    CallContext, CommandError, ConnectionOrigin, EventSink, HostAndPort, NetworkEvent,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::{
    connect::Connector,
    connection::Connection,
    error::TICKET,
    util::guard_with_context,
};

/// 池参数。
#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    pub max_connecting: usize,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

/// 连接池统计快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
    pub available_tickets: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "idle={} in_use={} created={} reused={} discarded={} tickets={}",
            self.idle,
            self.in_use,
            self.created,
            self.reused,
            self.discarded,
            self.available_tickets
        )
    }
}

struct IdleEntry {
    connection: Connection,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<HostAndPort, Vec<IdleEntry>>,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    in_use: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// 带票据约束的连接池。
pub struct ConnectionPool {
    connector: Connector,
    options: PoolOptions,
    state: Mutex<PoolState>,
    tickets: Arc<Semaphore>,
    counters: Counters,
    events: Arc<dyn EventSink>,
}

impl ConnectionPool {
    pub fn new(connector: Connector, options: PoolOptions, events: Arc<dyn EventSink>) -> Self {
        Self {
            connector,
            tickets: Arc::new(Semaphore::new(options.max_connecting)),
            options,
            state: Mutex::new(PoolState::default()),
            counters: Counters::default(),
            events,
        }
    }

    /// 为 `target` 取得一条连接。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：返回值携带连接来源；等待票据与新建过程都响应 `ctx` 的取消与截止；
    /// - **执行 (How)**：空闲命中 → 直接返回；否则取票 → 复查空闲 → 新建，票据在新建结束后释放；
    /// - **风险 (Trade-offs)**：池关闭后票据信号量被关闭，等待中的获取以 `ShutdownInProgress` 失败。
    pub async fn acquire(
        &self,
        ctx: &CallContext,
        target: &HostAndPort,
    ) -> Result<(Connection, ConnectionOrigin), CommandError> {
        if let Some(connection) = self.checkout_idle(target)? {
            return Ok((connection, ConnectionOrigin::Pooled));
        }

        let _ticket = guard_with_context(ctx, TICKET, Arc::clone(&self.tickets).acquire_owned())
            .await?
            .map_err(|_| CommandError::shutdown_in_progress("connection pool is shut down"))?;

        if let Some(connection) = self.checkout_idle(target)? {
            return Ok((connection, ConnectionOrigin::Pooled));
        }

        let connection = self.connector.connect(ctx, target).await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.counters.in_use.fetch_add(1, Ordering::Relaxed);
        debug!(%target, connection = connection.id(), "new pooled connection");
        Ok((connection, ConnectionOrigin::Fresh))
    }

    /// 弹出一条仍然可用的空闲连接，过期或已被对端关闭的连接在此处淘汰。
    fn checkout_idle(&self, target: &HostAndPort) -> Result<Option<Connection>, CommandError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CommandError::shutdown_in_progress(
                "connection pool is shut down",
            ));
        }
        let Some(entries) = state.idle.get_mut(target) else {
            return Ok(None);
        };
        while let Some(mut entry) = entries.pop() {
            let stale = entry.idle_since.elapsed() >= self.options.idle_timeout;
            if stale || entry.connection.is_peer_closed() {
                trace!(
                    %target,
                    connection = entry.connection.id(),
                    stale,
                    "evicting idle connection"
                );
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            self.counters.in_use.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry.connection));
        }
        Ok(None)
    }

    /// 归还一条可复用的连接。池已关闭或该地址空闲数已满时直接关闭。
    pub fn release(&self, connection: Connection) {
        self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
        let target = connection.target().clone();
        let kept = {
            let mut state = self.state.lock();
            let max_idle = self.options.max_idle_per_host;
            if state.closed {
                false
            } else {
                let entries = state.idle.entry(target.clone()).or_default();
                if entries.len() < max_idle {
                    entries.push(IdleEntry {
                        connection,
                        idle_since: Instant::now(),
                    });
                    true
                } else {
                    false
                }
            }
        };
        if !kept {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
        self.events.on_event(NetworkEvent::ConnectionReleased {
            target,
            reused: kept,
        });
    }

    /// 关闭一条不可复用的连接。
    pub fn discard(&self, connection: Connection) {
        self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        let target = connection.target().clone();
        debug!(%target, connection = connection.id(), "discarding connection");
        drop(connection);
        self.events.on_event(NetworkEvent::ConnectionReleased {
            target,
            reused: false,
        });
    }

    /// 关闭池：丢弃所有空闲连接，拒绝后续获取。
    pub fn shutdown(&self) {
        let drained: Vec<IdleEntry> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.idle.drain().flat_map(|(_, entries)| entries).collect()
        };
        self.tickets.close();
        self.counters
            .discarded
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        debug!(closed = drained.len(), "connection pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.state.lock().idle.values().map(Vec::len).sum();
        PoolStats {
            idle,
            in_use: self.counters.in_use.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            available_tickets: self.tickets.available_permits(),
        }
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
