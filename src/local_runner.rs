//! Local-process fallback controller (§9): when containerization is
//! disabled but the operator still wants dev-server lifecycle management,
//! this realizes the same `LifecycleController` contract by spawning the dev
//! server directly as a child process instead of a container. It shares no
//! state with `ContainerLifecycleController`.

use crate::config::Config;
use crate::controller::{AppStatus, GetOrStartResult, LifecycleController};
use crate::engine::{EngineEvent, ExecOutput, LogStream, LogsOptions};
use crate::error::ControllerError;
use crate::startup::{detect_package_manager, effective_start_command};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const MAX_LOGS: usize = 1000;

struct RunningApp {
    child: Child,
    port: u16,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    logs: Arc<Mutex<VecDeque<String>>>,
}

/// Spawns and tracks dev servers as plain child processes.
pub struct LocalProcessRunner {
    config: Config,
    next_port: Mutex<u16>,
    apps: DashMap<String, RunningApp>,
}

impl LocalProcessRunner {
    pub fn new(config: Config) -> Self {
        let base_port = config.base_port;
        Self { config, next_port: Mutex::new(base_port), apps: DashMap::new() }
    }

    fn allocate_port(&self) -> Result<u16, ControllerError> {
        let mut next = self.next_port.lock();
        if *next > self.config.max_port {
            return Err(ControllerError::NoPortsAvailable);
        }
        let port = *next;
        *next += 1;
        Ok(port)
    }

    async fn kill_port_holder(&self, port: u16) {
        if !self.config.auto_kill_port {
            return;
        }
        debug!(port, "auto_kill_port: attempting to free port before start");
        let _ = Command::new("fuser")
            .args(["-k", &format!("{port}/tcp")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }

    fn push_log(buffer: &Arc<Mutex<VecDeque<String>>>, line: String) {
        let mut buffer = buffer.lock();
        if buffer.len() >= MAX_LOGS {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }
}

#[async_trait]
impl LifecycleController for LocalProcessRunner {
    async fn get_or_start(
        &self,
        app_id: &str,
        app_path: &Path,
        // No install step exists in this fallback runner (it execs the dev
        // server directly against the host's already-installed
        // node_modules), so an install-command override has nothing to hook
        // into here.
        _install_command: Option<&str>,
        start_command: Option<&str>,
    ) -> Result<GetOrStartResult, ControllerError> {
        if let Some(mut entry) = self.apps.get_mut(app_id) {
            entry.last_activity = Utc::now();
            return Ok(GetOrStartResult { port: entry.port, ready: true });
        }

        let port = self.allocate_port()?;
        self.kill_port_holder(port).await;

        let manager = detect_package_manager(app_path, &self.config);
        let command = effective_start_command(manager, port, start_command);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(app_path)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ControllerError::Internal(format!("failed to spawn dev server: {e}")))?;
        info!(app_id, port, pid = child.id(), "started local dev server process");

        let logs = Arc::new(Mutex::new(VecDeque::with_capacity(MAX_LOGS)));

        if let Some(stdout) = child.stdout.take() {
            let logs = logs.clone();
            let app_id = app_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    Self::push_log(&logs, line.clone());
                    debug!(app_id, "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = logs.clone();
            let app_id = app_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    Self::push_log(&logs, line.clone());
                    warn!(app_id, "{}", line);
                }
            });
        }

        self.apps.insert(
            app_id.to_string(),
            RunningApp { child, port, started_at: Utc::now(), last_activity: Utc::now(), logs },
        );

        Ok(GetOrStartResult { port, ready: true })
    }

    async fn stop(&self, app_id: &str) -> Result<(), ControllerError> {
        if let Some((_, mut app)) = self.apps.remove(app_id) {
            let _ = app.child.kill().await;
        }
        Ok(())
    }

    async fn remove(&self, app_id: &str) -> Result<(), ControllerError> {
        self.stop(app_id).await
    }

    async fn status(&self, app_id: &str) -> Result<AppStatus, ControllerError> {
        match self.apps.get(app_id) {
            Some(app) => Ok(AppStatus {
                state: "ready",
                port: Some(app.port),
                ready_at: Some(app.started_at),
                last_activity_at: Some(app.last_activity),
                inactive_for: Utc::now().signed_duration_since(app.last_activity).to_std().ok(),
            }),
            None => Ok(AppStatus { state: "absent", port: None, ready_at: None, last_activity_at: None, inactive_for: None }),
        }
    }

    async fn sync_files(&self, _app_id: &str, _paths: Option<&[String]>) -> Result<(), ControllerError> {
        // The dev server's own file watcher already sees host edits directly; no bind-mount indirection to bridge here.
        Ok(())
    }

    async fn logs(&self, app_id: &str, opts: LogsOptions) -> Result<String, ControllerError> {
        let app = self.apps.get(app_id).ok_or_else(|| ControllerError::NotFound(app_id.to_string()))?;
        let buffer = app.logs.lock();
        let tail = opts.tail.unwrap_or(buffer.len());
        Ok(buffer.iter().rev().take(tail).rev().cloned().collect::<Vec<_>>().join("\n"))
    }

    async fn stream_logs(&self, _app_id: &str, _opts: LogsOptions) -> Result<LogStream, ControllerError> {
        Err(ControllerError::Internal("log streaming is not supported by the local-process fallback runner".into()))
    }

    async fn exec(&self, _app_id: &str, _argv: &[String]) -> Result<ExecOutput, ControllerError> {
        Err(ControllerError::Internal("exec is not supported by the local-process fallback runner".into()))
    }

    async fn events(&self, _app_id: &str) -> Result<Vec<EngineEvent>, ControllerError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_caps_at_max_logs() {
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(4)));
        for i in 0..(MAX_LOGS + 10) {
            LocalProcessRunner::push_log(&buffer, format!("line {i}"));
        }
        assert_eq!(buffer.lock().len(), MAX_LOGS);
        assert_eq!(buffer.lock().front().unwrap(), &format!("line {}", 10));
    }

    #[test]
    fn allocate_port_respects_range_and_exhausts() {
        let mut config = Config::default();
        config.base_port = 9000;
        config.max_port = 9001;
        let runner = LocalProcessRunner::new(config);
        assert_eq!(runner.allocate_port().unwrap(), 9000);
        assert_eq!(runner.allocate_port().unwrap(), 9001);
        assert!(runner.allocate_port().is_err());
    }
}
