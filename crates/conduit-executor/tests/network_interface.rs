//! `NetworkInterfaceTokio` 端到端测试：门面是同步的，测试线程直接调用；
//! 假远端运行在自己的多线程运行时上。

mod support;

use std::{
    collections::BTreeSet,
    net::TcpListener as StdTcpListener,
    sync::{Arc, OnceLock, Weak},
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::Bytes;
use conduit_core::{
    CommandError, ConfigError, ConnectionOrigin, ErrorKind, EventSink, HostAndPort,
    LifecycleError, MessageCodec, NetworkEvent, NetworkInterface, NetworkInterfaceConfig,
    OpHandle, Protocol, RemoteCommandRequest,
};
use conduit_executor::{ExecutorError, NetworkInterfaceTokio};
use parking_lot::Mutex;
use support::{
    FakeRemote, HelloMode, Outcomes, Recorder, ReplyMode, all_bits, event_name, eventually,
};
use tracing_test::traced_test;

const PING: &[u8] = b"{ping: 1}";

fn config() -> NetworkInterfaceConfig {
    NetworkInterfaceConfig {
        max_message_size_bytes: 1024,
        connect_timeout_ms: 5_000,
        ..NetworkInterfaceConfig::default()
    }
}

fn started(
    config: NetworkInterfaceConfig,
    recorder: &Arc<Recorder>,
) -> Result<NetworkInterfaceTokio> {
    let net = NetworkInterfaceTokio::builder(config)
        .with_event_sink(Arc::<Recorder>::clone(recorder))
        .build()?;
    net.startup()?;
    Ok(net)
}

fn ping(target: HostAndPort) -> RemoteCommandRequest {
    RemoteCommandRequest::new(target, "admin", Bytes::from_static(PING))
}

fn completed_kind(events: &[NetworkEvent], handle: OpHandle) -> Option<Result<(), ErrorKind>> {
    events.iter().find_map(|event| match event {
        NetworkEvent::Completed { handle: h, outcome } if *h == handle => Some(*outcome),
        _ => None,
    })
}

#[test]
fn fresh_command_follows_the_lifecycle_in_order() -> Result<()> {
    let remote = FakeRemote::echo()?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    let (done, outcome) = outcomes.next()?;
    assert_eq!(done, handle);
    assert_eq!(outcome, Ok((Bytes::from_static(PING), Protocol::OpCommandV1)));

    net.shutdown()?;
    let names: Vec<_> = recorder.events().iter().map(event_name).collect();
    assert_eq!(
        names,
        [
            "admitted",
            "resolved",
            "socket_connected",
            "protocols_probed",
            "connection_acquired",
            "protocol_negotiated",
            "request_sent",
            "header_received",
            "body_received",
            "connection_released",
            "completed",
        ]
    );
    assert!(outcomes.drain().is_empty());
    Ok(())
}

#[test]
fn sequential_commands_reuse_the_idle_connection() -> Result<()> {
    let remote = FakeRemote::echo()?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();

    for raw in 1..=2 {
        let handle = OpHandle::new(raw);
        net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
        let (_, outcome) = outcomes.next()?;
        assert!(outcome.is_ok());
    }

    assert_eq!(remote.accepted(), 1);
    let stats = net.pool_stats();
    assert_eq!((stats.created, stats.reused, stats.idle), (1, 1, 1));
    let origins: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            NetworkEvent::ConnectionAcquired { origin, .. } => Some(origin),
            _ => None,
        })
        .collect();
    assert_eq!(origins, [ConnectionOrigin::Fresh, ConnectionOrigin::Pooled]);

    net.shutdown()?;
    Ok(())
}

#[test]
fn negotiation_picks_the_best_common_protocol() -> Result<()> {
    let remote = FakeRemote::start(
        HelloMode::Answer(Protocol::OpQuery.bit()),
        ReplyMode::Echo,
    )?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    let (_, outcome) = outcomes.next()?;
    assert_eq!(outcome, Ok((Bytes::from_static(PING), Protocol::OpQuery)));
    net.shutdown()?;
    Ok(())
}

#[test]
fn protocol_mismatch_writes_no_command_bytes() -> Result<()> {
    let remote = FakeRemote::start(
        HelloMode::Answer(Protocol::OpQuery.bit()),
        ReplyMode::Echo,
    )?;
    let recorder = Arc::new(Recorder::default());
    let net = started(
        NetworkInterfaceConfig {
            local_protocols: vec![Protocol::OpCommandV1],
            ..config()
        },
        &recorder,
    )?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    let (_, outcome) = outcomes.next()?;
    assert_eq!(outcome, Err(ErrorKind::ProtocolMismatch));
    assert_eq!(remote.command_frames(), 0);
    assert!(
        !recorder
            .events()
            .iter()
            .any(|event| matches!(event, NetworkEvent::RequestSent { .. }))
    );
    // 连接上没有写出任何命令字节，仍可回池。
    assert_eq!(net.pool_stats().idle, 1);

    net.shutdown()?;
    Ok(())
}

#[test]
fn cancel_while_waiting_for_a_ticket_never_touches_the_target() -> Result<()> {
    let stuck = FakeRemote::start(HelloMode::Hang, ReplyMode::Echo)?;
    let untouched = FakeRemote::echo()?;
    let recorder = Arc::new(Recorder::default());
    let net = started(
        NetworkInterfaceConfig {
            max_connecting: 1,
            ..config()
        },
        &recorder,
    )?;
    let outcomes = Outcomes::new();

    let first = OpHandle::new(1);
    net.start_command(first, ping(stuck.target()), outcomes.callback(first))?;
    recorder.wait_for(|event| matches!(event, NetworkEvent::SocketConnected { .. }))?;

    let second = OpHandle::new(2);
    net.start_command(second, ping(untouched.target()), outcomes.callback(second))?;
    net.cancel_command(second);
    let (done, outcome) = outcomes.next()?;
    assert_eq!((done, outcome), (second, Err(ErrorKind::Canceled)));
    assert_eq!(untouched.accepted(), 0);
    assert!(!recorder.events().iter().any(|event| matches!(
        event,
        NetworkEvent::ConnectionAcquired { handle, .. } if *handle == second
    )));

    net.shutdown()?;
    let (done, outcome) = outcomes.next()?;
    assert_eq!((done, outcome), (first, Err(ErrorKind::ShutdownInProgress)));
    Ok(())
}

#[test]
fn cancel_after_send_discards_the_connection() -> Result<()> {
    let remote = FakeRemote::start(HelloMode::Answer(all_bits()), ReplyMode::Hold)?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(9);

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    recorder.wait_for(|event| matches!(event, NetworkEvent::RequestSent { .. }))?;
    net.cancel_command(handle);
    net.cancel_command(handle);

    let (_, outcome) = outcomes.next()?;
    assert_eq!(outcome, Err(ErrorKind::Canceled));
    let stats = net.pool_stats();
    assert_eq!((stats.idle, stats.in_use, stats.discarded), (0, 0, 1));
    assert!(recorder.events().iter().any(|event| matches!(
        event,
        NetworkEvent::ConnectionReleased { reused: false, .. }
    )));

    net.shutdown()?;
    assert!(outcomes.drain().is_empty());
    Ok(())
}

#[test]
fn shutdown_drains_every_in_flight_command() -> Result<()> {
    let remote = FakeRemote::start(HelloMode::Answer(all_bits()), ReplyMode::Hold)?;
    let recorder = Arc::new(Recorder::default());
    let net = started(
        NetworkInterfaceConfig {
            max_connecting: 4,
            ..config()
        },
        &recorder,
    )?;
    let outcomes = Outcomes::new();

    for raw in 1..=3 {
        let handle = OpHandle::new(raw);
        net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    }
    eventually("three requests on the wire", || remote.command_frames() == 3)?;
    assert_eq!(net.in_progress_count(), 3);

    net.shutdown()?;
    assert!(net.in_shutdown());
    assert_eq!(net.in_progress_count(), 0);

    let drained = outcomes.drain();
    assert_eq!(drained.len(), 3);
    let handles: BTreeSet<_> = drained.iter().map(|(handle, _)| handle.get()).collect();
    assert_eq!(handles, BTreeSet::from([1, 2, 3]));
    assert!(
        drained
            .iter()
            .all(|(_, outcome)| *outcome == Err(ErrorKind::ShutdownInProgress))
    );
    assert_eq!(net.pool_stats().discarded, 3);

    let late = OpHandle::new(4);
    let err = net
        .start_command(late, ping(remote.target()), outcomes.callback(late))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
    net.cancel_command(late);
    assert!(outcomes.drain().is_empty());
    Ok(())
}

#[test]
fn oversized_reply_fails_with_message_too_large() -> Result<()> {
    let remote = FakeRemote::start(
        HelloMode::Answer(all_bits()),
        ReplyMode::Oversized(16 + 64 * 1024 * 1024),
    )?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    let (_, outcome) = outcomes.next()?;
    assert_eq!(outcome, Err(ErrorKind::MessageTooLarge));
    assert!(
        !recorder
            .events()
            .iter()
            .any(|event| matches!(event, NetworkEvent::HeaderReceived { .. }))
    );
    assert_eq!(net.pool_stats().discarded, 1);
    net.shutdown()?;
    Ok(())
}

#[test]
fn oversized_request_keeps_the_pooled_connection() -> Result<()> {
    let remote = FakeRemote::echo()?;
    let recorder = Arc::new(Recorder::default());
    let net = started(
        NetworkInterfaceConfig {
            max_message_size_bytes: 8,
            ..config()
        },
        &recorder,
    )?;
    let outcomes = Outcomes::new();
    let target = remote.target();

    let small = OpHandle::new(1);
    let request = RemoteCommandRequest::new(target.clone(), "admin", Bytes::from_static(b"ok"));
    net.start_command(small, request, outcomes.callback(small))?;
    assert!(outcomes.next()?.1.is_ok());
    assert_eq!(net.pool_stats().idle, 1);

    let large = OpHandle::new(2);
    let request = RemoteCommandRequest::new(target, "admin", Bytes::from(vec![b'x'; 16]));
    net.start_command(large, request, outcomes.callback(large))?;
    let (_, outcome) = outcomes.next()?;
    assert_eq!(outcome, Err(ErrorKind::MessageTooLarge));

    assert_eq!(remote.command_frames(), 1);
    let stats = net.pool_stats();
    assert_eq!((stats.idle, stats.reused, stats.discarded), (1, 1, 0));
    net.shutdown()?;
    Ok(())
}

/// 在协议确定之后、写出之前撤回命令。
struct CancelOnNegotiation {
    net: OnceLock<Weak<NetworkInterfaceTokio>>,
}

impl EventSink for CancelOnNegotiation {
    fn on_event(&self, event: NetworkEvent) {
        if let NetworkEvent::ProtocolNegotiated { handle, .. } = event
            && let Some(net) = self.net.get().and_then(Weak::upgrade)
        {
            net.cancel_command(handle);
        }
    }
}

#[test]
fn cancel_before_transmission_returns_the_connection() -> Result<()> {
    let remote = FakeRemote::echo()?;
    let sink = Arc::new(CancelOnNegotiation {
        net: OnceLock::new(),
    });
    let net = Arc::new(
        NetworkInterfaceTokio::builder(config())
            .with_event_sink(Arc::clone(&sink) as Arc<dyn EventSink>)
            .build()?,
    );
    let _ = sink.net.set(Arc::downgrade(&net));
    net.startup()?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    let (_, outcome) = outcomes.next()?;
    assert_eq!(outcome, Err(ErrorKind::Canceled));
    assert_eq!(remote.command_frames(), 0);
    let stats = net.pool_stats();
    assert_eq!((stats.idle, stats.discarded), (1, 0));

    net.shutdown()?;
    Ok(())
}

/// 受理事件到达时回读门面诊断，并记下所在线程。
#[derive(Default)]
struct DiagnoseOnAdmission {
    net: OnceLock<Weak<NetworkInterfaceTokio>>,
    seen: Mutex<Vec<(Option<String>, String)>>,
}

impl EventSink for DiagnoseOnAdmission {
    fn on_event(&self, event: NetworkEvent) {
        if let NetworkEvent::Admitted { .. } = event
            && let Some(net) = self.net.get().and_then(Weak::upgrade)
        {
            let thread = thread::current().name().map(str::to_owned);
            self.seen.lock().push((thread, net.diagnostic_string()));
        }
    }
}

#[test]
fn sink_may_call_back_into_the_interface() -> Result<()> {
    let remote = FakeRemote::echo()?;
    let sink = Arc::new(DiagnoseOnAdmission::default());
    let net = Arc::new(
        NetworkInterfaceTokio::builder(config())
            .with_event_sink(Arc::clone(&sink) as Arc<dyn EventSink>)
            .build()?,
    );
    let _ = sink.net.set(Arc::downgrade(&net));
    net.startup()?;
    let outcomes = Outcomes::new();

    for raw in 1..=3 {
        let handle = OpHandle::new(raw);
        net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    }
    for _ in 0..3 {
        assert!(outcomes.next()?.1.is_ok());
    }
    net.shutdown()?;

    let seen = sink.seen.lock().clone();
    assert_eq!(seen.len(), 3);
    for (thread, report) in &seen {
        assert_eq!(thread.as_deref(), Some("conduit-network"));
        assert!(report.contains("state=running"), "{report}");
    }
    Ok(())
}

#[test]
fn request_timeout_fails_with_exceeded_time_limit() -> Result<()> {
    let remote = FakeRemote::start(HelloMode::Answer(all_bits()), ReplyMode::Hold)?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    let request = ping(remote.target()).with_timeout(Duration::from_millis(150));
    net.start_command(handle, request, outcomes.callback(handle))?;
    let (_, outcome) = outcomes.next()?;
    assert_eq!(outcome, Err(ErrorKind::ExceededTimeLimit));
    assert_eq!(net.pool_stats().discarded, 1);
    net.shutdown()?;
    Ok(())
}

#[test]
fn refused_connection_is_local_to_its_command() -> Result<()> {
    let closed = {
        let listener = StdTcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?
    };
    let remote = FakeRemote::echo()?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();

    let doomed = OpHandle::new(1);
    let request = ping(HostAndPort::from(closed));
    net.start_command(doomed, request, outcomes.callback(doomed))?;
    let (_, outcome) = outcomes.next()?;
    assert_eq!(outcome, Err(ErrorKind::ConnectFailed));

    let healthy = OpHandle::new(2);
    net.start_command(healthy, ping(remote.target()), outcomes.callback(healthy))?;
    let (_, outcome) = outcomes.next()?;
    assert!(outcome.is_ok());
    assert_eq!(
        completed_kind(&recorder.events(), doomed),
        Some(Err(ErrorKind::ConnectFailed))
    );

    net.shutdown()?;
    Ok(())
}

#[test]
fn duplicate_handle_is_rejected_synchronously() -> Result<()> {
    let remote = FakeRemote::start(HelloMode::Answer(all_bits()), ReplyMode::Hold)?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(5);

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    let err = net
        .start_command(handle, ping(remote.target()), outcomes.callback(handle))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateHandle);

    net.shutdown()?;
    assert_eq!(outcomes.drain().len(), 1);
    Ok(())
}

#[test]
fn late_cancel_is_a_no_op() -> Result<()> {
    let remote = FakeRemote::echo()?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    assert!(outcomes.next()?.1.is_ok());
    eventually("table to empty", || net.in_progress_count() == 0)?;
    net.cancel_command(handle);
    net.cancel_command(OpHandle::new(404));

    net.shutdown()?;
    assert!(outcomes.drain().is_empty());
    Ok(())
}

#[test]
fn commands_from_many_threads_complete_exactly_once() -> Result<()> {
    let remote = FakeRemote::echo()?;
    let recorder = Arc::new(Recorder::default());
    let net = Arc::new(started(config(), &recorder)?);
    let outcomes = Outcomes::new();

    let submitters: Vec<_> = (0..4u64)
        .map(|thread_id| {
            let net = Arc::clone(&net);
            let target = remote.target();
            let callbacks: Vec<_> = (0..8u64)
                .map(|i| {
                    let handle = OpHandle::new(thread_id * 100 + i);
                    (handle, outcomes.callback(handle))
                })
                .collect();
            thread::spawn(move || -> Result<(), CommandError> {
                for (handle, callback) in callbacks {
                    net.start_command(handle, ping(target.clone()), callback)?;
                }
                Ok(())
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().expect("submitter panicked")?;
    }

    let mut seen = BTreeSet::new();
    for _ in 0..32 {
        let (handle, outcome) = outcomes.next()?;
        assert!(outcome.is_ok());
        assert!(seen.insert(handle), "{handle} completed twice");
    }
    net.shutdown()?;
    assert!(outcomes.drain().is_empty());
    assert_eq!(net.pool_stats().in_use, 0);
    Ok(())
}

struct TaggingCodec;

impl MessageCodec for TaggingCodec {
    fn encode(
        &self,
        request: &RemoteCommandRequest,
        protocol: Protocol,
    ) -> Result<Bytes, CommandError> {
        let mut body = format!("{}|{}|", protocol.name(), request.db_name).into_bytes();
        body.extend_from_slice(&request.payload);
        Ok(Bytes::from(body))
    }

    fn decode(&self, body: Bytes, _protocol: Protocol) -> Result<Bytes, CommandError> {
        Ok(body)
    }
}

#[test]
fn codec_sees_the_negotiated_protocol() -> Result<()> {
    let remote = FakeRemote::echo()?;
    let net = NetworkInterfaceTokio::builder(config())
        .with_codec(Arc::new(TaggingCodec))
        .build()?;
    net.startup()?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    let (_, outcome) = outcomes.next()?;
    let (data, protocol) = outcome.expect("echo succeeds");
    let expected = format!("{}|admin|{{ping: 1}}", protocol.name());
    assert_eq!(&data[..], expected.as_bytes());
    net.shutdown()?;
    Ok(())
}

#[test]
fn wait_for_work_wakes_on_completion() -> Result<()> {
    let remote = FakeRemote::echo()?;
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    let before = Instant::now();
    net.wait_for_work_until(before + Duration::from_millis(20));
    assert!(before.elapsed() >= Duration::from_millis(20));

    net.start_command(handle, ping(remote.target()), outcomes.callback(handle))?;
    net.wait_for_work_until(Instant::now() + support::WAIT);
    assert!(outcomes.next()?.1.is_ok());

    net.signal_work_available();
    net.wait_for_work();
    assert!(net.now() >= before);
    net.shutdown()?;
    Ok(())
}

#[test]
fn diagnostics_report_state_and_pool() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let net = started(config(), &recorder)?;
    let report = net.diagnostic_string();
    assert!(report.contains("state=running"), "{report}");
    assert!(report.contains("in_progress=0"), "{report}");
    assert!(report.contains("tickets=2"), "{report}");
    assert!(!net.host_name().is_empty());
    net.shutdown()?;
    assert!(net.diagnostic_string().contains("state=shutdown"));
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected_at_build() {
    let err = NetworkInterfaceTokio::builder(NetworkInterfaceConfig {
        max_connecting: 0,
        ..config()
    })
    .build()
    .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Config(ConfigError::Invalid {
            field: "max_connecting",
            ..
        })
    ));
}

#[test]
#[traced_test]
fn lifecycle_misuse_is_reported_and_logged() {
    let net = NetworkInterfaceTokio::new(config()).unwrap();
    let outcomes = Outcomes::new();
    let handle = OpHandle::new(1);

    assert_eq!(net.shutdown(), Err(LifecycleError::NotStarted));
    assert!(logs_contain("shutdown requested before startup"));
    let err = net
        .start_command(
            handle,
            ping(HostAndPort::new("localhost", 1)),
            outcomes.callback(handle),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);

    net.startup().unwrap();
    assert_eq!(net.startup(), Err(LifecycleError::AlreadyStarted));
    assert!(logs_contain("startup requested on a running network interface"));

    net.shutdown().unwrap();
    assert_eq!(net.shutdown(), Err(LifecycleError::AlreadyShutdown));
    assert_eq!(net.startup(), Err(LifecycleError::AlreadyShutdown));
    assert!(logs_contain("network interface shut down"));
    assert!(outcomes.drain().is_empty());
}
