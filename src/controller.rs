//! The lifecycle controller (C4): the per-`appId` state machine, single-flight
//! start, and the reap decision the reconciler drives.

use crate::activity::ActivityTracker;
use crate::config::Config;
use crate::engine::{
    ContainerEngine, EngineEvent, ExecOutput, LogStream, LogsOptions, RawStatus, RunSpec,
};
use crate::error::{ControllerError, EngineError};
use crate::ports::PortRegistry;
use crate::startup::{compose_startup_script, detect_package_manager, package_store_volume};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const CONTAINER_PREFIX: &str = "dyad-app-";
const TRANSIENT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

fn container_name(app_id: &str) -> String {
    format!("{CONTAINER_PREFIX}{app_id}")
}

fn image_tag(app_id: &str) -> String {
    format!("dyad-app-{app_id}")
}

/// Per-`appId` lifecycle state. `Creating`/`Starting` always carry an
/// in-flight future in the owning entry; callers joining mid-transition
/// clone it rather than re-deriving state from here.
#[derive(Debug, Clone)]
enum AppState {
    Absent,
    Creating,
    Starting,
    Ready { ready_at: DateTime<Utc> },
    Stopping,
    Stopped,
    Error { reason: String },
}

impl AppState {
    fn label(&self) -> &'static str {
        match self {
            AppState::Absent => "absent",
            AppState::Creating => "creating",
            AppState::Starting => "starting",
            AppState::Ready { .. } => "ready",
            AppState::Stopping => "stopping",
            AppState::Stopped => "stopped",
            AppState::Error { .. } => "error",
        }
    }
}

type StartResult = Result<u16, ControllerError>;
type SharedStart = Shared<BoxFuture<'static, StartResult>>;

struct AppEntry {
    state: AppState,
    in_flight: Option<SharedStart>,
}

impl Default for AppEntry {
    fn default() -> Self {
        Self { state: AppState::Absent, in_flight: None }
    }
}

/// Result of `get_or_start`.
#[derive(Debug, Clone, Copy)]
pub struct GetOrStartResult {
    pub port: u16,
    pub ready: bool,
}

/// Read-only snapshot returned by `status`.
#[derive(Debug, Clone)]
pub struct AppStatus {
    pub state: &'static str,
    pub port: Option<u16>,
    pub ready_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub inactive_for: Option<Duration>,
}

/// The Controller API's operation set (§6), implemented by both the
/// containerized controller and the `NullController`/local-process fallback.
#[async_trait]
pub trait LifecycleController: Send + Sync {
    /// `install_command`/`start_command` are the caller-supplied overrides
    /// from §4.4's "Custom command override"; `None` falls back to the
    /// package-manager default.
    async fn get_or_start(
        &self,
        app_id: &str,
        app_path: &Path,
        install_command: Option<&str>,
        start_command: Option<&str>,
    ) -> Result<GetOrStartResult, ControllerError>;
    async fn stop(&self, app_id: &str) -> Result<(), ControllerError>;
    async fn remove(&self, app_id: &str) -> Result<(), ControllerError>;
    async fn status(&self, app_id: &str) -> Result<AppStatus, ControllerError>;
    async fn sync_files(&self, app_id: &str, paths: Option<&[String]>) -> Result<(), ControllerError>;
    async fn logs(&self, app_id: &str, opts: LogsOptions) -> Result<String, ControllerError>;
    async fn stream_logs(&self, app_id: &str, opts: LogsOptions) -> Result<LogStream, ControllerError>;
    async fn exec(&self, app_id: &str, argv: &[String]) -> Result<ExecOutput, ControllerError>;
    async fn events(&self, app_id: &str) -> Result<Vec<EngineEvent>, ControllerError>;
}

/// The containerized realization of `LifecycleController`, backed by a
/// `ContainerEngine` (Docker or Podman).
pub struct ContainerLifecycleController {
    engine: Arc<dyn ContainerEngine>,
    ports: Arc<PortRegistry>,
    activity: Arc<ActivityTracker>,
    config: Config,
    entries: DashMap<String, Mutex<AppEntry>>,
}

impl ContainerLifecycleController {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        ports: Arc<PortRegistry>,
        activity: Arc<ActivityTracker>,
        config: Config,
    ) -> Self {
        Self { engine, ports, activity, config, entries: DashMap::new() }
    }

    /// Seed a tracked app's state directly, used by the reconciler's
    /// bootstrap walk to adopt a container it found already running (or
    /// stopped) without re-deriving it through `get_or_start`.
    pub fn adopt(&self, app_id: &str, state_label: &str, ready_at: Option<DateTime<Utc>>) {
        let entry = self.entries.entry(app_id.to_string()).or_insert_with(|| Mutex::new(AppEntry::default()));
        let mut entry = entry.lock();
        entry.state = match state_label {
            "ready" => AppState::Ready { ready_at: ready_at.unwrap_or_else(Utc::now) },
            _ => AppState::Stopped,
        };
    }

    fn entry_for(&self, app_id: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<AppEntry>> {
        self.entries.entry(app_id.to_string()).or_insert_with(|| Mutex::new(AppEntry::default())).downgrade()
    }

    /// The activity tracker backing this controller, exposed for the
    /// reconciler's bootstrap walk to seed timestamps directly.
    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    /// Every `appId` this controller currently holds an entry for, used by
    /// the reconciler's periodic tick to know what to consider reaping.
    pub fn tracked_app_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Reap decision for the reconciler: only acts when `Ready`, idle long
    /// enough, and not mid-transition. Returns whether a reap was triggered.
    pub async fn reap_if_idle(&self, app_id: &str) -> Result<bool, ControllerError> {
        let should_consider = {
            let entry = self.entry_for(app_id);
            let guard = entry.lock();
            matches!(guard.state, AppState::Ready { .. })
        };
        if !should_consider {
            return Ok(false);
        }
        if !self.activity.is_idle(app_id, self.config.idle_timeout()) {
            return Ok(false);
        }

        let name = container_name(app_id);
        if let Ok(stats) = self.engine.stats(&name).await {
            if self.activity.record_sample(app_id, stats.net_io) {
                debug!(app_id, "net-io delta overrides idle reap");
                return Ok(false);
            }
        }

        if let Some(port) = self.ports.get(app_id) {
            if has_established_connection(port) {
                debug!(app_id, port, "established tcp connection overrides idle reap");
                return Ok(false);
            }
        }

        self.transition_to_stopping(app_id, &name).await?;
        info!(app_id, "reaped idle container");
        Ok(true)
    }

    async fn transition_to_stopping(&self, app_id: &str, name: &str) -> Result<(), ControllerError> {
        {
            let entry = self.entry_for(app_id);
            let mut guard = entry.lock();
            guard.state = AppState::Stopping;
        }
        with_transient_retry(|| self.engine.stop(name, Duration::from_secs(10))).await?;
        let entry = self.entry_for(app_id);
        let mut guard = entry.lock();
        guard.state = AppState::Stopped;
        Ok(())
    }

    async fn run_start(
        engine: Arc<dyn ContainerEngine>,
        activity: Arc<ActivityTracker>,
        config: Config,
        app_id: String,
        app_path: PathBuf,
        port: u16,
        install_command: Option<String>,
        start_command: Option<String>,
    ) -> StartResult {
        let name = container_name(&app_id);
        let tag = image_tag(&app_id);

        // Clean up any stale container left by a previous failed attempt.
        let _ = engine.stop(&name, Duration::from_secs(5)).await;
        let _ = engine.rm(&name, true).await;

        if !engine.image_exists(&tag).await? {
            let build_dir = tempfile::tempdir()
                .map_err(|e| ControllerError::Internal(format!("failed to create build context: {e}")))?;
            std::fs::write(build_dir.path().join("Dockerfile"), format!("FROM {}\n", config.node_image))
                .map_err(|e| ControllerError::Internal(format!("failed to write Dockerfile: {e}")))?;
            with_transient_retry(|| engine.build(build_dir.path(), &tag)).await?;
        }

        let manager = detect_package_manager(&app_path, &config);
        let script = compose_startup_script(manager, config.app_port_inside, start_command.as_deref(), install_command.as_deref());
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        let (store_volume, store_mount) = package_store_volume(manager, &app_id);
        let volumes = vec![(app_path.display().to_string(), "/app".to_string()), (store_volume, store_mount)];
        let env = vec![("PORT".to_string(), port.to_string()), ("VITE_PORT".to_string(), port.to_string())];

        with_transient_retry(|| {
            engine.run(RunSpec {
                name: &name,
                image: &tag,
                host_port: port,
                guest_port: config.app_port_inside,
                volumes: &volumes,
                env: &env,
                work_dir: Some("/app"),
                command: Some(&command),
                memory_limit: config.memory_limit.as_deref(),
                cpu_limit: config.cpu_limit.as_deref(),
            })
        })
        .await?;

        let deadline = Instant::now() + config.startup_timeout();
        let mut ticker = tokio::time::interval(Duration::from_millis(200));

        loop {
            ticker.tick().await;

            if Instant::now() >= deadline {
                let _ = engine.stop(&name, Duration::from_secs(5)).await;
                return Err(ControllerError::StartupTimeout);
            }

            match engine.inspect(&name).await? {
                Some(info) if matches!(info.status, RawStatus::Exited(_)) => {
                    return Err(ControllerError::StartFailed {
                        reason: "container exited before becoming ready".to_string(),
                    });
                }
                None => {
                    return Err(ControllerError::StartFailed {
                        reason: "container disappeared during startup".to_string(),
                    });
                }
                _ => {}
            }

            if tcp_probe(port).await {
                activity.touch(&app_id);
                return Ok(port);
            }

            if let Ok(log_tail) = engine.logs(&name, LogsOptions { tail: Some(50), since: None, follow: false }).await {
                if config.readiness_tokens.iter().any(|token| log_tail.contains(token.as_str())) {
                    activity.touch(&app_id);
                    return Ok(port);
                }
            }
        }
    }
}

async fn tcp_probe(port: u16) -> bool {
    tokio::time::timeout(Duration::from_millis(300), tokio::net::TcpStream::connect(("127.0.0.1", port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Runs an engine call once; on `EngineError::Transient` waits
/// `TRANSIENT_RETRY_BACKOFF` and retries exactly once more, then gives up
/// either way. §7: "Retried once with backoff in `start` and `stop`;
/// propagated otherwise."
async fn with_transient_retry<T, F, Fut>(mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    match op().await {
        Err(EngineError::Transient(msg)) => {
            debug!(error = %msg, "transient engine error, retrying once after backoff");
            tokio::time::sleep(TRANSIENT_RETRY_BACKOFF).await;
            op().await
        }
        other => other,
    }
}

/// Second mandatory secondary reap signal (§4.4 step 3, §3 Invariant 4):
/// scans `/proc/net/tcp`/`/proc/net/tcp6` for a connection in the
/// ESTABLISHED state whose local port matches `port`. Linux-only; on any
/// other platform (or a sandboxed/missing procfs) the read fails and this
/// conservatively reports no connection, leaving the net-I/O delta as the
/// sole signal for that cycle.
fn has_established_connection(port: u16) -> bool {
    ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .any(|path| std::fs::read_to_string(path).map(|body| tcp_table_has_established_port(&body, port)).unwrap_or(false))
}

fn tcp_table_has_established_port(tcp_table: &str, port: u16) -> bool {
    const ESTABLISHED: &str = "01";
    let port_hex = format!("{port:04X}");
    tcp_table.lines().skip(1).any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (Some(local_address), Some(state)) = (fields.get(1), fields.get(3)) else {
            return false;
        };
        *state == ESTABLISHED && local_address.rsplit(':').next() == Some(port_hex.as_str())
    })
}

#[async_trait]
impl LifecycleController for ContainerLifecycleController {
    async fn get_or_start(
        &self,
        app_id: &str,
        app_path: &Path,
        install_command: Option<&str>,
        start_command: Option<&str>,
    ) -> Result<GetOrStartResult, ControllerError> {
        self.activity.touch(app_id);

        // Fast path: already `Ready`, or another caller already owns the
        // single-flight start — neither needs the (async) port allocation
        // below, so they're resolved without ever leaving the sync lock.
        enum Existing {
            Ready(u16),
            InFlight(SharedStart),
            None,
        }
        let existing = {
            let entry = self.entry_for(app_id);
            let guard = entry.lock();
            match &guard.state {
                AppState::Ready { .. } => {
                    let port = self.ports.get(app_id).ok_or_else(|| ControllerError::Internal("ready app has no port".into()))?;
                    Existing::Ready(port)
                }
                _ => match &guard.in_flight {
                    Some(shared) => Existing::InFlight(shared.clone()),
                    None => Existing::None,
                },
            }
        };

        let shared = match existing {
            Existing::Ready(port) => return Ok(GetOrStartResult { port, ready: true }),
            Existing::InFlight(shared) => shared,
            Existing::None => {
                // Port allocation re-validates a reused assignment's host
                // availability (§4.2), which needs the engine and so can't
                // happen under the sync per-entry lock below; allocate it
                // first, then take the lock to commit the state transition.
                //
                // `run_start` unconditionally stops+removes any stale
                // container under this name first, which covers both the
                // `Error` and `Stopped` predecessor states from the
                // transition table.
                let port = self.ports.allocate_with_host_check(app_id, &self.engine, CONTAINER_PREFIX).await?;

                let entry = self.entry_for(app_id);
                let mut guard = entry.lock();

                // Re-check: a concurrent caller may have moved this app to
                // `Ready` or started its own in-flight attempt while we were
                // awaiting the host-availability check above.
                if let AppState::Ready { .. } = &guard.state {
                    drop(guard);
                    return Ok(GetOrStartResult { port, ready: true });
                }
                if let Some(shared) = &guard.in_flight {
                    shared.clone()
                } else {
                    guard.state = AppState::Creating;

                    let engine = self.engine.clone();
                    let activity = self.activity.clone();
                    let config = self.config.clone();
                    let app_id_owned = app_id.to_string();
                    let app_path_owned = app_path.to_path_buf();
                    let install_command_owned = install_command.map(str::to_string);
                    let start_command_owned = start_command.map(str::to_string);

                    let handle = tokio::spawn(async move {
                        Self::run_start(
                            engine,
                            activity,
                            config,
                            app_id_owned,
                            app_path_owned,
                            port,
                            install_command_owned,
                            start_command_owned,
                        )
                        .await
                    });

                    let shared: SharedStart = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(_) => Err(ControllerError::Internal("start task panicked".to_string())),
                        }
                    }
                    .boxed()
                    .shared();

                    guard.in_flight = Some(shared.clone());
                    shared
                }
            }
        };

        let result = shared.await;

        let entry = self.entry_for(app_id);
        let mut guard = entry.lock();
        guard.in_flight = None;
        match &result {
            Ok(_) => guard.state = AppState::Ready { ready_at: Utc::now() },
            Err(ControllerError::StartupTimeout) => guard.state = AppState::Error { reason: "startup timeout".to_string() },
            Err(e) => guard.state = AppState::Error { reason: e.to_string() },
        }
        drop(guard);

        result.map(|port| GetOrStartResult { port, ready: true })
    }

    async fn stop(&self, app_id: &str) -> Result<(), ControllerError> {
        let current = {
            let entry = self.entry_for(app_id);
            entry.lock().state.clone()
        };

        match current {
            AppState::Absent | AppState::Stopped => Ok(()),
            _ => {
                let name = container_name(app_id);
                self.transition_to_stopping(app_id, &name).await
            }
        }
    }

    async fn remove(&self, app_id: &str) -> Result<(), ControllerError> {
        let name = container_name(app_id);
        self.engine.stop(&name, Duration::from_secs(5)).await?;
        self.engine.rm(&name, true).await?;
        self.ports.release(app_id);
        self.activity.clear(app_id);

        let entry = self.entry_for(app_id);
        let mut guard = entry.lock();
        guard.state = AppState::Absent;
        guard.in_flight = None;
        Ok(())
    }

    async fn status(&self, app_id: &str) -> Result<AppStatus, ControllerError> {
        let (label, ready_at) = {
            let entry = self.entry_for(app_id);
            let guard = entry.lock();
            let ready_at = match &guard.state {
                AppState::Ready { ready_at } => Some(*ready_at),
                _ => None,
            };
            (guard.state.label(), ready_at)
        };

        let port = self.ports.get(app_id);
        let last_activity = self.activity.last_activity_at(app_id);
        let inactive_for = last_activity
            .and_then(|at| Utc::now().signed_duration_since(at).to_std().ok());

        Ok(AppStatus {
            state: label,
            port,
            ready_at,
            last_activity_at: last_activity,
            inactive_for,
        })
    }

    async fn sync_files(&self, app_id: &str, paths: Option<&[String]>) -> Result<(), ControllerError> {
        self.activity.touch(app_id);
        let Some(paths) = paths else {
            return Ok(());
        };
        let name = container_name(app_id);
        for path in paths {
            self.engine.exec(&name, &["touch".to_string(), path.clone()]).await?;
        }
        Ok(())
    }

    async fn logs(&self, app_id: &str, opts: LogsOptions) -> Result<String, ControllerError> {
        self.activity.touch(app_id);
        let name = container_name(app_id);
        Ok(self.engine.logs(&name, opts).await?)
    }

    async fn stream_logs(&self, app_id: &str, opts: LogsOptions) -> Result<LogStream, ControllerError> {
        self.activity.touch(app_id);
        let name = container_name(app_id);
        Ok(self.engine.stream_logs(&name, opts).await?)
    }

    async fn exec(&self, app_id: &str, argv: &[String]) -> Result<ExecOutput, ControllerError> {
        let name = container_name(app_id);
        let output = self.engine.exec(&name, argv).await?;
        if output.exit_code == 0 {
            self.activity.touch(app_id);
        }
        Ok(output)
    }

    async fn events(&self, app_id: &str) -> Result<Vec<EngineEvent>, ControllerError> {
        let name = container_name(app_id);
        Ok(self.engine.events(&name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerInfo, ContainerSummary, NetIo, Stats};
    use crate::error::EngineError;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct FakeState {
        containers: StdHashMap<String, (u16, RawStatus)>,
        run_calls: usize,
        readiness_logs: StdHashMap<String, String>,
    }

    struct FakeEngine {
        state: AsyncMutex<FakeState>,
        concurrent_runs: AtomicUsize,
        max_concurrent_runs: AtomicUsize,
        instant_ready_port: Option<u16>,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                state: AsyncMutex::new(FakeState::default()),
                concurrent_runs: AtomicUsize::new(0),
                max_concurrent_runs: AtomicUsize::new(0),
                instant_ready_port: None,
            }
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn list(&self, _prefix: &str) -> Result<Vec<ContainerSummary>, EngineError> {
            Ok(Vec::new())
        }

        async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
            let state = self.state.lock().await;
            Ok(state.containers.get(name).map(|(port, status)| ContainerInfo {
                name: name.to_string(),
                host_port: Some(*port),
                status: *status,
            }))
        }

        async fn image_exists(&self, _tag: &str) -> Result<bool, EngineError> {
            Ok(true)
        }

        async fn build(&self, _path: &std::path::Path, _tag: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn run(&self, spec: RunSpec<'_>) -> Result<(), EngineError> {
            let current = self.concurrent_runs.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_runs.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent_runs.fetch_sub(1, Ordering::SeqCst);

            let mut state = self.state.lock().await;
            state.run_calls += 1;
            state.containers.insert(spec.name.to_string(), (spec.host_port, RawStatus::Running));
            Ok(())
        }

        async fn stop(&self, name: &str, _grace: Duration) -> Result<(), EngineError> {
            let mut state = self.state.lock().await;
            state.containers.remove(name);
            Ok(())
        }

        async fn rm(&self, _name: &str, _force: bool) -> Result<(), EngineError> {
            Ok(())
        }

        async fn exec(&self, _name: &str, _argv: &[String]) -> Result<ExecOutput, EngineError> {
            Ok(ExecOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
        }

        async fn logs(&self, name: &str, _opts: LogsOptions) -> Result<String, EngineError> {
            let state = self.state.lock().await;
            Ok(state.readiness_logs.get(name).cloned().unwrap_or_default())
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

    fn test_config() -> Config {
        let mut config = Config::default();
        config.base_port = 32100;
        config.max_port = 32102;
        config.startup_timeout_ms = 2_000;
        config
    }

    fn make_controller(engine: Arc<FakeEngine>) -> ContainerLifecycleController {
        let config = test_config();
        let ports = Arc::new(PortRegistry::new(&config));
        let activity = Arc::new(ActivityTracker::new(config.net_io_delta_threshold_bytes));
        ContainerLifecycleController::new(engine, ports, activity, config)
    }

    #[tokio::test]
    async fn concurrent_get_or_start_joins_single_flight() {
        let engine = Arc::new(FakeEngine::new());
        let controller = Arc::new(make_controller(engine.clone()));

        let app_path = PathBuf::from("/tmp/app-a");
        let a = {
            let c = controller.clone();
            let p = app_path.clone();
            tokio::spawn(async move { c.get_or_start("app-a", &p, None, None).await })
        };
        let b = {
            let c = controller.clone();
            let p = app_path.clone();
            tokio::spawn(async move { c.get_or_start("app-a", &p, None, None).await })
        };

        let (ra, rb) = tokio::join!(a, b);
        let ra = ra.unwrap().unwrap();
        let rb = rb.unwrap().unwrap();
        assert_eq!(ra.port, rb.port);
        assert_eq!(engine.max_concurrent_runs.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state.lock().await.run_calls, 1);
    }

    #[tokio::test]
    async fn startup_timeout_surfaces_typed_error_and_keeps_port() {
        let mut config = test_config();
        config.startup_timeout_ms = 100;
        let ports = Arc::new(PortRegistry::new(&config));
        let activity = Arc::new(ActivityTracker::new(config.net_io_delta_threshold_bytes));

        struct NeverReadyEngine;
        #[async_trait]
        impl ContainerEngine for NeverReadyEngine {
            async fn list(&self, _: &str) -> Result<Vec<ContainerSummary>, EngineError> {
                Ok(Vec::new())
            }
            async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
                Ok(Some(ContainerInfo { name: name.to_string(), host_port: Some(32100), status: RawStatus::Running }))
            }
            async fn image_exists(&self, _: &str) -> Result<bool, EngineError> {
                Ok(true)
            }
            async fn build(&self, _: &std::path::Path, _: &str) -> Result<(), EngineError> {
                Ok(())
            }
            async fn run(&self, _: RunSpec<'_>) -> Result<(), EngineError> {
                Ok(())
            }
            async fn stop(&self, _: &str, _: Duration) -> Result<(), EngineError> {
                Ok(())
            }
            async fn rm(&self, _: &str, _: bool) -> Result<(), EngineError> {
                Ok(())
            }
            async fn exec(&self, _: &str, _: &[String]) -> Result<ExecOutput, EngineError> {
                Ok(ExecOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
            }
            async fn logs(&self, _: &str, _: LogsOptions) -> Result<String, EngineError> {
                Ok(String::new())
            }
            async fn stream_logs(&self, _: &str, _: LogsOptions) -> Result<LogStream, EngineError> {
                let (_tx, rx) = tokio::sync::mpsc::channel(1);
                let (shutdown, _) = tokio::sync::watch::channel(false);
                Ok(LogStream { receiver: rx, shutdown })
            }
            async fn stats(&self, _: &str) -> Result<Stats, EngineError> {
                Ok(Stats { mem_percent: 0.0, net_io: NetIo::default() })
            }
            async fn events(&self, _: &str) -> Result<Vec<EngineEvent>, EngineError> {
                Ok(Vec::new())
            }
        }

        let controller = ContainerLifecycleController::new(Arc::new(NeverReadyEngine), ports.clone(), activity, config);
        let result = controller.get_or_start("app-timeout", Path::new("/tmp/app-timeout"), None, None).await;
        assert!(matches!(result, Err(ControllerError::StartupTimeout)));
        assert_eq!(ports.get("app-timeout"), Some(32100));
    }

    #[tokio::test]
    async fn stop_and_remove_are_idempotent() {
        let engine = Arc::new(FakeEngine::new());
        let controller = make_controller(engine);
        controller.stop("app-never-started").await.unwrap();
        controller.stop("app-never-started").await.unwrap();
        controller.remove("app-never-started").await.unwrap();
        controller.remove("app-never-started").await.unwrap();
    }

    #[test]
    fn tcp_table_detects_established_local_port() {
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:7D64 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0 0 10 0 0 0 0
   1: 0100007F:7D64 0100007F:C350 01 00000000:00000000 00:00000000 00000000     0        0 12346 1 0 0 10 0 0 0 0
";
        assert!(tcp_table_has_established_port(table, 0x7D64));
    }

    #[test]
    fn tcp_table_ignores_non_established_rows() {
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:7D64 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0 0 10 0 0 0 0
";
        assert!(!tcp_table_has_established_port(table, 0x7D64));
    }

    #[tokio::test]
    async fn with_transient_retry_succeeds_on_second_attempt() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u16, EngineError> = with_transient_retry(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EngineError::Transient("temporary".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn with_transient_retry_gives_up_after_one_retry() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u16, EngineError> = with_transient_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(EngineError::Transient("still broken".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
