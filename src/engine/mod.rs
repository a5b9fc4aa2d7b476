//! The `ContainerEngine` adapter (C1): the capability set the rest of the
//! controller drives, independent of whether the backing daemon is Docker or
//! Podman — both are reachable through the same Docker-compatible remote API.

mod docker;
mod netio;

pub use docker::DockerEngine;
pub use netio::{format_net_io, parse_net_io};

use crate::error::EngineError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// One row from `list()`: a container the engine currently knows about.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub name: String,
    pub host_port: Option<u16>,
    pub status_text: String,
    pub created_at: Option<String>,
}

/// The engine's view of whether a container is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    Running,
    Exited(i64),
}

/// Full detail returned by `inspect()`.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub host_port: Option<u16>,
    pub status: RawStatus,
}

/// A single network-I/O sample, already resolved to byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetIo {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// A single non-streaming resource sample.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub mem_percent: f64,
    pub net_io: NetIo,
}

/// Parameters for starting a container.
pub struct RunSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub host_port: u16,
    pub guest_port: u16,
    pub volumes: &'a [(String, String)],
    pub env: &'a [(String, String)],
    pub work_dir: Option<&'a str>,
    pub command: Option<&'a [String]>,
    pub memory_limit: Option<&'a str>,
    pub cpu_limit: Option<&'a str>,
}

/// Output of a one-shot `exec`.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Stdout,
    Stderr,
}

/// A single tagged log line, the re-cast of the engine's dynamically-typed
/// output callback into a plain record.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub kind: LogKind,
    pub payload: String,
}

/// Options shared by `logs` and `stream_logs`.
#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    pub tail: Option<usize>,
    pub since: Option<i64>,
    pub follow: bool,
}

/// A lifecycle record surfaced by `events()`, when the engine keeps one.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub kind: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// A running log stream: a pull iterator of tagged lines ending in `None`,
/// plus a handle to tear it down without touching the container.
pub struct LogStream {
    pub receiver: tokio::sync::mpsc::Receiver<LogLine>,
    pub shutdown: tokio::sync::watch::Sender<bool>,
}

/// Adapter over an external container engine (Docker or Podman).
///
/// Implementations are stateless aside from a shared client handle and are
/// safe to call concurrently; every method is a potential multi-second
/// suspension point and callers are expected to bound it with a timeout.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Enumerate every container whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Resolve the current state of a single container, `None` if absent.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError>;

    /// Whether an image tag already exists locally.
    async fn image_exists(&self, tag: &str) -> Result<bool, EngineError>;

    /// Build (or rebuild) the image tag from a Dockerfile at `path`.
    async fn build(&self, path: &Path, tag: &str) -> Result<(), EngineError>;

    /// Create and start a container. Fails with `PortConflict`, `ImageMissing`
    /// `Unavailable`, or `Unknown`.
    async fn run(&self, spec: RunSpec<'_>) -> Result<(), EngineError>;

    /// Stop a container, idempotent (absent target = success).
    async fn stop(&self, name: &str, grace: Duration) -> Result<(), EngineError>;

    /// Remove a container, idempotent (absent target = success).
    async fn rm(&self, name: &str, force: bool) -> Result<(), EngineError>;

    /// Run a one-shot command inside a running container.
    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput, EngineError>;

    /// A single non-streaming log snapshot.
    async fn logs(&self, name: &str, opts: LogsOptions) -> Result<String, EngineError>;

    /// A live, cancellable stream of tagged log lines.
    async fn stream_logs(&self, name: &str, opts: LogsOptions) -> Result<LogStream, EngineError>;

    /// A single non-streaming resource sample.
    async fn stats(&self, name: &str) -> Result<Stats, EngineError>;

    /// Lifecycle history from the engine, empty if it doesn't keep one.
    async fn events(&self, name: &str) -> Result<Vec<EngineEvent>, EngineError>;
}
