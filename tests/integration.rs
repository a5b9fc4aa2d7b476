//! End-to-end scenarios against the `LifecycleController` trait, driven by a
//! fake `ContainerEngine` so they run without a Docker/Podman daemon.

use async_trait::async_trait;
use clc::activity::ActivityTracker;
use clc::config::Config;
use clc::controller::{ContainerLifecycleController, LifecycleController};
use clc::engine::{
    ContainerEngine, ContainerInfo, ContainerSummary, EngineEvent, ExecOutput, LogStream,
    LogsOptions, NetIo, RawStatus, RunSpec, Stats,
};
use clc::error::{ControllerError, EngineError};
use clc::ports::PortRegistry;
use clc::reconciler::Reconciler;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// One engine-side container record, keyed by container name.
#[derive(Clone)]
struct FakeContainer {
    host_port: u16,
    status: RawStatus,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    net_io: HashMap<String, NetIo>,
    last_command: Option<Vec<String>>,
}

/// A `ContainerEngine` double whose `run` binds a real TCP listener on the
/// assigned port so the readiness TCP probe in `run_start` succeeds without
/// a real container.
struct FakeEngine {
    state: AsyncMutex<FakeState>,
}

impl FakeEngine {
    fn new() -> Self {
        Self { state: AsyncMutex::new(FakeState::default()) }
    }

    async fn set_net_io(&self, name: &str, net_io: NetIo) {
        self.state.lock().await.net_io.insert(name.to_string(), net_io);
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list(&self, prefix: &str) -> Result<Vec<ContainerSummary>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .containers
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, c)| ContainerSummary {
                name: name.clone(),
                host_port: Some(c.host_port),
                status_text: match c.status {
                    RawStatus::Running => "running".to_string(),
                    RawStatus::Exited(_) => "exited".to_string(),
                },
                created_at: None,
            })
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        let state = self.state.lock().await;
        Ok(state.containers.get(name).map(|c| ContainerInfo {
            name: name.to_string(),
            host_port: Some(c.host_port),
            status: c.status,
        }))
    }

    async fn image_exists(&self, _tag: &str) -> Result<bool, EngineError> {
        Ok(true)
    }

    async fn build(&self, _path: &Path, _tag: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn run(&self, spec: RunSpec<'_>) -> Result<(), EngineError> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", spec.host_port))
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        tokio::spawn(async move {
            // Accept connections and hold them open (rather than dropping)
            // so a test client's socket stays ESTABLISHED on both ends for
            // as long as the test keeps its side alive.
            let mut held = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => held.push(stream),
                    Err(_) => break,
                }
            }
        });

        let mut state = self.state.lock().await;
        state.containers.insert(
            spec.name.to_string(),
            FakeContainer { host_port: spec.host_port, status: RawStatus::Running },
        );
        state.last_command = spec.command.map(|c| c.to_vec());
        Ok(())
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<(), EngineError> {
        self.state.lock().await.containers.remove(name);
        Ok(())
    }

    async fn rm(&self, _name: &str, _force: bool) -> Result<(), EngineError> {
        Ok(())
    }

    async fn exec(&self, _name: &str, _argv: &[String]) -> Result<ExecOutput, EngineError> {
        Ok(ExecOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
    }

    async fn logs(&self, _name: &str, _opts: LogsOptions) -> Result<String, EngineError> {
        Ok(String::new())
    }

    async fn stream_logs(&self, _name: &str, _opts: LogsOptions) -> Result<LogStream, EngineError> {
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Ok(LogStream { receiver: rx, shutdown })
    }

    async fn stats(&self, name: &str) -> Result<Stats, EngineError> {
        let state = self.state.lock().await;
        Ok(Stats { mem_percent: 0.0, net_io: state.net_io.get(name).copied().unwrap_or_default() })
    }

    async fn events(&self, _name: &str) -> Result<Vec<EngineEvent>, EngineError> {
        Ok(Vec::new())
    }
}

fn test_config(base_port: u16, max_port: u16) -> Config {
    let mut config = Config::default();
    config.base_port = base_port;
    config.max_port = max_port;
    config.startup_timeout_ms = 3_000;
    config.idle_timeout_ms = 200;
    config
}

fn make_controller(engine: Arc<FakeEngine>, config: Config) -> Arc<ContainerLifecycleController> {
    let ports = Arc::new(PortRegistry::new(&config));
    let activity = Arc::new(ActivityTracker::new(config.net_io_delta_threshold_bytes));
    Arc::new(ContainerLifecycleController::new(engine, ports, activity, config))
}

// Scenario A: two distinct apps get the two lowest free ports, in order.
#[tokio::test]
async fn scenario_a_lowest_port_first() {
    let engine = Arc::new(FakeEngine::new());
    let controller = make_controller(engine, test_config(41000, 41010));

    let a = controller.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None).await.unwrap();
    let b = controller.get_or_start("app-b", &PathBuf::from("/tmp/app-b"), None, None).await.unwrap();

    assert_eq!(a.port, 41000);
    assert_eq!(b.port, 41001);
    assert!(a.ready && b.ready);
}

// Scenario B: stopping an app keeps its port reserved; restarting returns it.
#[tokio::test]
async fn scenario_b_port_held_across_stop_restart() {
    let engine = Arc::new(FakeEngine::new());
    let controller = make_controller(engine, test_config(41100, 41110));

    let first = controller.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None).await.unwrap();
    controller.stop("app-a").await.unwrap();

    let status = controller.status("app-a").await.unwrap();
    assert_eq!(status.state, "stopped");
    assert_eq!(status.port, Some(first.port));

    let second = controller.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None).await.unwrap();
    assert_eq!(second.port, first.port);
}

// A port held across a stop that gets stolen by an unrelated container while
// stopped is not blindly reused on restart — the host-availability check
// catches the conflict and a fresh port is allocated instead.
#[tokio::test]
async fn stale_port_assignment_is_reallocated_if_stolen_while_stopped() {
    let engine = Arc::new(FakeEngine::new());
    let controller = make_controller(engine.clone(), test_config(41150, 41151));

    let first = controller.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None).await.unwrap();
    controller.stop("app-a").await.unwrap();

    {
        let mut state = engine.state.lock().await;
        state.containers.insert(
            "dyad-app-someone-else".to_string(),
            FakeContainer { host_port: first.port, status: RawStatus::Running },
        );
    }

    let second = controller.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None).await.unwrap();
    assert_ne!(second.port, first.port, "stolen port must not be reused");
}

// Scenario C: exhausting the port range surfaces `NoPortsAvailable`, and
// releasing via `remove` lets a waiting app reuse the freed port.
#[tokio::test]
async fn scenario_c_port_contention_exhaustion_and_reuse() {
    let engine = Arc::new(FakeEngine::new());
    let controller = make_controller(engine, test_config(41200, 41201));

    let a = controller.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None).await.unwrap();
    let _b = controller.get_or_start("app-b", &PathBuf::from("/tmp/app-b"), None, None).await.unwrap();

    let err = controller.get_or_start("app-c", &PathBuf::from("/tmp/app-c"), None, None).await.unwrap_err();
    assert!(matches!(err, ControllerError::NoPortsAvailable));
    assert_eq!(err.status_code(), 503);
    assert_eq!(err.code(), "NO_PORTS_AVAILABLE");

    controller.remove("app-a").await.unwrap();
    let c = controller.get_or_start("app-c", &PathBuf::from("/tmp/app-c"), None, None).await.unwrap();
    assert_eq!(c.port, a.port);
}

// Scenario D: a net-io delta above the threshold vetoes an otherwise-due
// reap; once activity genuinely stops, the next tick reaps it.
#[tokio::test]
async fn scenario_d_idle_reap_respects_net_activity_override() {
    let engine = Arc::new(FakeEngine::new());
    let config = test_config(41300, 41301);
    let controller = make_controller(engine.clone(), config);

    controller.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    // First stats sample establishes the baseline and, per the pessimistic
    // bootstrap rule, counts as activity on its own.
    engine.set_net_io("dyad-app-app-a", NetIo { rx_bytes: 0, tx_bytes: 0 }).await;
    let reaped_first = controller.reap_if_idle("app-a").await.unwrap();
    assert!(!reaped_first, "first stats sample establishes baseline, not a reap");

    tokio::time::sleep(Duration::from_millis(250)).await;
    engine.set_net_io("dyad-app-app-a", NetIo { rx_bytes: 100_000, tx_bytes: 0 }).await;
    let reaped_overridden = controller.reap_if_idle("app-a").await.unwrap();
    assert!(!reaped_overridden, "net-io delta above threshold should veto the reap");

    let status = controller.status("app-a").await.unwrap();
    assert_eq!(status.state, "ready");
}

// Scenario D continued: once the app is truly idle (no net-io, no touches),
// the reconciler reaps it.
#[tokio::test]
async fn scenario_d_idle_reap_fires_when_truly_idle() {
    let engine = Arc::new(FakeEngine::new());
    let controller = make_controller(engine, test_config(41310, 41311));

    controller.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let reaped = controller.reap_if_idle("app-a").await.unwrap();
    assert!(reaped);

    let status = controller.status("app-a").await.unwrap();
    assert_eq!(status.state, "stopped");
}

// Scenario D continued: an established TCP connection on the assigned port
// (e.g. a long-poll/WebSocket) blocks the reap even with an idle-looking
// net-io profile.
#[tokio::test]
async fn scenario_d_established_tcp_connection_blocks_reap() {
    let engine = Arc::new(FakeEngine::new());
    let controller = make_controller(engine.clone(), test_config(41320, 41321));

    let result = controller.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    engine.set_net_io("dyad-app-app-a", NetIo { rx_bytes: 0, tx_bytes: 0 }).await;
    controller.reap_if_idle("app-a").await.unwrap(); // establishes the net-io baseline

    tokio::time::sleep(Duration::from_millis(250)).await;
    engine.set_net_io("dyad-app-app-a", NetIo { rx_bytes: 0, tx_bytes: 0 }).await;

    let held_connection = tokio::net::TcpStream::connect(("127.0.0.1", result.port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reaped = controller.reap_if_idle("app-a").await.unwrap();
    assert!(!reaped, "an established tcp connection on the assigned port should veto the reap");

    drop(held_connection);
}

// Caller-supplied startCommand (§4.4's custom command override) is honored
// verbatim, with a port flag injected, instead of the package-manager default.
#[tokio::test]
async fn custom_start_command_flows_into_container_command() {
    let engine = Arc::new(FakeEngine::new());
    let controller = make_controller(engine.clone(), test_config(41330, 41331));

    let result = controller
        .get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, Some("node server.js"))
        .await
        .unwrap();

    let state = engine.state.lock().await;
    let command = state.last_command.as_ref().unwrap().join(" ");
    assert!(command.contains(&format!("exec node server.js --port {}", result.port)));
}

// Scenario E: a container that never becomes reachable surfaces the typed
// `StartupTimeout` error and keeps its port assignment (no port leak).
#[tokio::test]
async fn scenario_e_startup_timeout() {
    struct StallingEngine;

    #[async_trait]
    impl ContainerEngine for StallingEngine {
        async fn list(&self, _prefix: &str) -> Result<Vec<ContainerSummary>, EngineError> {
            Ok(Vec::new())
        }
        async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
            Ok(Some(ContainerInfo { name: name.to_string(), host_port: Some(41400), status: RawStatus::Running }))
        }
        async fn image_exists(&self, _tag: &str) -> Result<bool, EngineError> {
            Ok(true)
        }
        async fn build(&self, _path: &Path, _tag: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn run(&self, _spec: RunSpec<'_>) -> Result<(), EngineError> {
            // Started, but nothing ever listens on the port and logs never
            // carry a readiness token.
            Ok(())
        }
        async fn stop(&self, _name: &str, _grace: Duration) -> Result<(), EngineError> {
            Ok(())
        }
        async fn rm(&self, _name: &str, _force: bool) -> Result<(), EngineError> {
            Ok(())
        }
        async fn exec(&self, _name: &str, _argv: &[String]) -> Result<ExecOutput, EngineError> {
            Ok(ExecOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
        }
        async fn logs(&self, _name: &str, _opts: LogsOptions) -> Result<String, EngineError> {
            Ok(String::new())
        }
        async fn stream_logs(&self, _name: &str, _opts: LogsOptions) -> Result<LogStream, EngineError> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            let (shutdown, _) = tokio::sync::watch::channel(false);
            Ok(LogStream { receiver: rx, shutdown })
        }
        async fn stats(&self, _name: &str) -> Result<Stats, EngineError> {
            Ok(Stats { mem_percent: 0.0, net_io: NetIo::default() })
        }
        async fn events(&self, _name: &str) -> Result<Vec<EngineEvent>, EngineError> {
            Ok(Vec::new())
        }
    }

    let mut config = test_config(41400, 41401);
    config.startup_timeout_ms = 150;
    let ports = Arc::new(PortRegistry::new(&config));
    let activity = Arc::new(ActivityTracker::new(config.net_io_delta_threshold_bytes));
    let controller = ContainerLifecycleController::new(Arc::new(StallingEngine), ports.clone(), activity, config);

    let err = controller.get_or_start("app-slow", &PathBuf::from("/tmp/app-slow"), None, None).await.unwrap_err();
    assert!(matches!(err, ControllerError::StartupTimeout));
    assert_eq!(err.status_code(), 504);
    assert_eq!(ports.get("app-slow"), Some(41400));
}

// Scenario F: the reconciler's bootstrap walk rediscovers a container the
// engine already knows about and seeds C2/C3 state without calling `run`.
#[tokio::test]
async fn scenario_f_bootstrap_rediscovers_running_container() {
    let engine = Arc::new(FakeEngine::new());
    {
        let mut state = engine.state.lock().await;
        state.containers.insert(
            "dyad-app-app-running".to_string(),
            FakeContainer { host_port: 41500, status: RawStatus::Running },
        );
    }

    let config = test_config(41500, 41510);
    let controller = make_controller(engine.clone(), config.clone());
    let reconciler = Reconciler::new(
        engine,
        Arc::new(PortRegistry::new(&config)),
        controller.clone(),
        config.reconcile_interval(),
        config.idle_timeout(),
    );

    reconciler.bootstrap().await;

    let status = controller.status("app-running").await.unwrap();
    assert_eq!(status.state, "ready");
    assert_eq!(status.port, Some(41500));
}

// The second concurrent caller joins the in-flight start instead of
// triggering a second `run`, and both callers observe the same port.
#[tokio::test]
async fn concurrent_start_single_flights() {
    let engine = Arc::new(FakeEngine::new());
    let controller = make_controller(engine, test_config(41600, 41601));

    let c1 = controller.clone();
    let c2 = controller.clone();
    let (a, b) = tokio::join!(
        c1.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None),
        c2.get_or_start("app-a", &PathBuf::from("/tmp/app-a"), None, None),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.port, b.port);
}
