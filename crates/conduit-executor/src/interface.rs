//! # interface 模块说明
//!
//! ## 角色定位（Why）
//! - [`NetworkInterfaceTokio`] 是 [`NetworkInterface`] 的生产实现：同步门面、专用工作线程、
//!   带票据的连接池三者在这里组装；
//! - 协作方（TLS 配置、认证、负载编解码、事件观察者）经 [`NetworkInterfaceBuilder`] 显式注入；
//! - 事件观察者只在工作线程上被调用，调用时不持有生命周期锁，观察者内部可以安全地回调门面。
//!
//! ## 契约（What）
//! - 生命周期 `Ready → Running → Shutdown` 由一把读写锁守护：`start_command` 在读锁内完成
//!   登记与交接，`shutdown` 以写锁切换状态，因此切换之后不会再有操作混入在途表；
//! - `shutdown` 先撤回全部在途操作，再关闭连接池，最后等待工作线程排空；返回时在途表为空，
//!   每个在途操作都已收到恰好一次回调。
//!
//! ## 风险（Trade-offs）
//! - `shutdown` 与 `wait_for_work*` 阻塞调用线程，不得在完成回调内调用；
//! - 未经 `shutdown` 直接丢弃门面时，工作线程在已交接的操作自然结束后退出，不会主动撤回它们。

use std::{
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use conduit_core::{
    CancelReason, Cancellation, CommandError, Completion, CompletionFn, EventSink, LifecycleError,
    MessageCodec, NetworkInterface, NetworkInterfaceConfig, NoopEventSink, OpHandle,
    PassthroughCodec, RemoteCommandRequest,
};
use conduit_transport_tcp::{
    Authenticator, ConnectOptions, ConnectionPool, Connector, FrameLimits, PoolOptions, PoolStats,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    dispatcher::Worker,
    error::ExecutorError,
    in_progress::InProgressTable,
    operation::{Dispatch, Operation},
    work_signal::WorkSignal,
};

enum Lifecycle {
    Ready,
    Running(Worker),
    Shutdown,
}

impl Lifecycle {
    fn name(&self) -> &'static str {
        match self {
            Lifecycle::Ready => "ready",
            Lifecycle::Running(_) => "running",
            Lifecycle::Shutdown => "shutdown",
        }
    }
}

/// 门面构建器。
pub struct NetworkInterfaceBuilder {
    config: NetworkInterfaceConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    codec: Arc<dyn MessageCodec>,
    events: Arc<dyn EventSink>,
}

impl NetworkInterfaceBuilder {
    /// 新建连接在 TCP 建立后执行 TLS 握手，服务器名取自目标主机名。
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// 校验配置并组装连接池；此时尚未启动工作线程。
    pub fn build(self) -> Result<NetworkInterfaceTokio, ExecutorError> {
        let NetworkInterfaceBuilder {
            config,
            tls,
            authenticator,
            codec,
            events,
        } = self;
        config.validate()?;

        let options = ConnectOptions {
            connect_timeout: config.connect_timeout(),
            tcp_nodelay: config.tcp_nodelay,
            tcp_keepalive: config.tcp_keepalive(),
            local_protocols: config.local_protocol_set(),
            limits: FrameLimits::new(config.max_message_size_bytes),
        };
        let mut connector = Connector::new(options, Arc::clone(&events));
        if let Some(tls) = tls {
            connector = connector.with_tls(tls);
        }
        if let Some(authenticator) = authenticator {
            connector = connector.with_authenticator(authenticator);
        }
        let pool = ConnectionPool::new(
            connector,
            PoolOptions {
                max_connecting: config.max_connecting,
                max_idle_per_host: config.max_idle_per_host,
                idle_timeout: config.idle_timeout(),
            },
            Arc::clone(&events),
        );

        Ok(NetworkInterfaceTokio {
            config,
            dispatch: Arc::new(Dispatch {
                pool: Arc::new(pool),
                codec,
                events,
                work: Arc::new(WorkSignal::default()),
            }),
            in_progress: InProgressTable::new(),
            lifecycle: RwLock::new(Lifecycle::Ready),
            next_id: AtomicU64::new(1),
            admitted: AtomicU64::new(0),
        })
    }
}

/// 基于 Tokio 的网络接口。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方线程只做登记与交接，所有 I/O 与状态推进都在工作线程上完成；
/// - **契约 (What)**：见 [`NetworkInterface`]；另外提供连接池统计与在途计数，供诊断使用；
/// - **风险 (Trade-offs)**：每个门面实例独占一个工作线程与一个连接池，进程内通常只构建一个。
pub struct NetworkInterfaceTokio {
    config: NetworkInterfaceConfig,
    dispatch: Arc<Dispatch>,
    in_progress: Arc<InProgressTable>,
    lifecycle: RwLock<Lifecycle>,
    next_id: AtomicU64,
    admitted: AtomicU64,
}

impl NetworkInterfaceTokio {
    pub fn builder(config: NetworkInterfaceConfig) -> NetworkInterfaceBuilder {
        NetworkInterfaceBuilder {
            config,
            tls: None,
            authenticator: None,
            codec: Arc::new(PassthroughCodec),
            events: Arc::new(NoopEventSink),
        }
    }

    pub fn new(config: NetworkInterfaceConfig) -> Result<Self, ExecutorError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &NetworkInterfaceConfig {
        &self.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.dispatch.pool.stats()
    }

    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }
}

impl NetworkInterface for NetworkInterfaceTokio {
    fn startup(&self) -> Result<(), LifecycleError> {
        let mut lifecycle = self.lifecycle.write();
        match &*lifecycle {
            Lifecycle::Ready => {}
            Lifecycle::Running(_) => {
                warn!("startup requested on a running network interface");
                return Err(LifecycleError::AlreadyStarted);
            }
            Lifecycle::Shutdown => {
                warn!("startup requested after shutdown");
                return Err(LifecycleError::AlreadyShutdown);
            }
        }
        *lifecycle = Lifecycle::Running(Worker::spawn(Arc::clone(&self.dispatch))?);
        info!(
            max_connecting = self.config.max_connecting,
            protocols = %self.config.local_protocol_set(),
            "network interface started"
        );
        Ok(())
    }

    fn shutdown(&self) -> Result<(), LifecycleError> {
        let worker = {
            let mut lifecycle = self.lifecycle.write();
            match mem::replace(&mut *lifecycle, Lifecycle::Shutdown) {
                Lifecycle::Running(worker) => worker,
                Lifecycle::Ready => {
                    *lifecycle = Lifecycle::Ready;
                    warn!("shutdown requested before startup");
                    return Err(LifecycleError::NotStarted);
                }
                Lifecycle::Shutdown => {
                    warn!("shutdown requested twice");
                    return Err(LifecycleError::AlreadyShutdown);
                }
            }
        };

        let live = self.in_progress.cancel_all(CancelReason::Shutdown);
        info!(live, "network interface shutting down");
        self.dispatch.pool.shutdown();
        worker.join();

        debug_assert!(self.in_progress.is_empty());
        self.dispatch.work.signal();
        info!(pool = %self.dispatch.pool.stats(), "network interface shut down");
        Ok(())
    }

    fn in_shutdown(&self) -> bool {
        matches!(*self.lifecycle.read(), Lifecycle::Shutdown)
    }

    fn wait_for_work(&self) {
        self.dispatch.work.wait();
    }

    fn wait_for_work_until(&self, deadline: Instant) {
        self.dispatch.work.wait_until(deadline);
    }

    fn signal_work_available(&self) {
        self.dispatch.work.signal();
    }

    fn start_command(
        &self,
        handle: OpHandle,
        request: RemoteCommandRequest,
        on_finish: CompletionFn,
    ) -> Result<(), CommandError> {
        let completion = Completion::new(on_finish);
        let lifecycle = self.lifecycle.read();
        let Lifecycle::Running(worker) = &*lifecycle else {
            completion.disarm();
            debug!(%handle, state = lifecycle.name(), "command rejected");
            return Err(CommandError::not_running());
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancellation = Cancellation::new();
        let registration = match self.in_progress.register(
            handle,
            id,
            request.target.clone(),
            cancellation.clone(),
        ) {
            Ok(registration) => registration,
            Err(err) => {
                completion.disarm();
                debug!(%handle, error = %err, "command rejected");
                return Err(err);
            }
        };

        let target = request.target.clone();
        let operation = Operation::new(id, handle, request, cancellation, completion, registration);
        if let Err(rejected) = worker.submit(operation) {
            warn!(handle = %rejected.handle(), "network worker is gone, command rejected");
            rejected.reject();
            return Err(CommandError::not_running());
        }
        self.admitted.fetch_add(1, Ordering::Relaxed);
        debug!(%handle, id, %target, "command admitted");
        Ok(())
    }

    fn cancel_command(&self, handle: OpHandle) {
        if self.in_progress.cancel(handle, CancelReason::Canceled) {
            debug!(%handle, "command cancellation requested");
        }
    }

    fn diagnostic_string(&self) -> String {
        self.to_string()
    }

    fn host_name(&self) -> String {
        match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(err) => {
                warn!(error = %err, "failed to read the host name");
                String::from("localhost")
            }
        }
    }
}

impl fmt::Display for NetworkInterfaceTokio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NetworkInterfaceTokio state={} in_progress={} admitted={}",
            self.lifecycle.read().name(),
            self.in_progress.len(),
            self.admitted.load(Ordering::Relaxed),
        )?;
        if let Some(age) = self.in_progress.oldest_age() {
            write!(f, " oldest_ms={}", age.as_millis())?;
        }
        write!(f, " pool[{}]", self.dispatch.pool.stats())
    }
}

impl fmt::Debug for NetworkInterfaceTokio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkInterfaceTokio")
            .field("state", &self.lifecycle.read().name())
            .field("in_progress", &self.in_progress.len())
            .field("pool", &self.dispatch.pool)
            .finish_non_exhaustive()
    }
}
