//! Configuration for the container lifecycle controller.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Which container engine to drive. Both speak the same Docker-compatible
/// remote API; only the default socket search order differs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Docker,
    Podman,
}

/// Fallback package manager used when no lockfile is present.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Npm,
    Pnpm,
    Yarn,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
        }
    }
}

/// Top-level controller configuration, loaded once at startup from TOML.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Which container engine to drive.
    #[serde(default)]
    pub engine: Engine,

    /// When false, all write operations return `ContainerizationDisabled`
    /// and no engine processes are spawned.
    #[serde(default = "default_true")]
    pub containerization_enabled: bool,

    /// Lowest host port the registry will ever hand out.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Highest host port the registry will ever hand out (inclusive).
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// The port the dev server binds to inside the container.
    #[serde(default = "default_app_port_inside")]
    pub app_port_inside: u16,

    /// Base image for the per-app tag.
    #[serde(default = "default_node_image")]
    pub node_image: String,

    /// `T_idle`: how long a dev server may sit unused before it is reaped.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Reconciler tick interval.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// `T_startup`: how long a container may take to reach readiness.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Net-I/O delta (either direction) above which a sample counts as activity.
    #[serde(default = "default_net_io_delta_threshold_bytes")]
    pub net_io_delta_threshold_bytes: u64,

    /// Package manager assumed when no lockfile is present.
    #[serde(default)]
    pub default_package_manager: PackageManager,

    /// Only consulted by the local-process fallback runner.
    #[serde(default = "default_true")]
    pub auto_kill_port: bool,

    /// When `containerization_enabled = false`, selects between the strict
    /// `NullController` (every write returns `ContainerizationDisabled`,
    /// the default) and the local-process fallback runner that still spawns
    /// dev servers, just as plain child processes instead of containers.
    #[serde(default)]
    pub local_process_fallback: bool,

    /// Root directory apps are looked up under when the Controller API is
    /// not told an explicit `appPath` (`<apps_root>/<appId>`).
    #[serde(default = "default_apps_root")]
    pub apps_root: String,

    /// Stdout substrings that mark a dev server as ready.
    #[serde(default = "default_readiness_tokens")]
    pub readiness_tokens: Vec<String>,

    /// Flat per-container memory cap, e.g. "512m".
    #[serde(default = "default_memory_limit")]
    pub memory_limit: Option<String>,

    /// Flat per-container CPU cap, e.g. "0.5".
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: Option<String>,

    /// Address the Controller API HTTP binding listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// `tracing_subscriber::EnvFilter` directive, overridable by `RUST_LOG`.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: Engine::default(),
            containerization_enabled: default_true(),
            base_port: default_base_port(),
            max_port: default_max_port(),
            app_port_inside: default_app_port_inside(),
            node_image: default_node_image(),
            idle_timeout_ms: default_idle_timeout_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            net_io_delta_threshold_bytes: default_net_io_delta_threshold_bytes(),
            default_package_manager: PackageManager::default(),
            auto_kill_port: default_true(),
            local_process_fallback: false,
            apps_root: default_apps_root(),
            readiness_tokens: default_readiness_tokens(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            bind_addr: default_bind_addr(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_port < self.base_port {
            anyhow::bail!(
                "max_port ({}) must be >= base_port ({})",
                self.max_port,
                self.base_port
            );
        }
        if self.readiness_tokens.is_empty() {
            anyhow::bail!("readiness_tokens must not be empty");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Number of host ports in `[base_port, max_port]`.
    pub fn port_range_size(&self) -> u32 {
        self.max_port as u32 - self.base_port as u32 + 1
    }
}

fn default_true() -> bool {
    true
}

fn default_base_port() -> u16 {
    32100
}

fn default_max_port() -> u16 {
    32200
}

fn default_app_port_inside() -> u16 {
    32100
}

fn default_node_image() -> String {
    "node:22-alpine".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_reconcile_interval_ms() -> u64 {
    120_000
}

fn default_startup_timeout_ms() -> u64 {
    180_000
}

fn default_net_io_delta_threshold_bytes() -> u64 {
    51_200
}

fn default_apps_root() -> String {
    "./apps".to_string()
}

fn default_readiness_tokens() -> Vec<String> {
    vec![
        "Local:".to_string(),
        "ready in".to_string(),
        "Server running".to_string(),
    ]
}

fn default_memory_limit() -> Option<String> {
    Some("512m".to_string())
}

fn default_cpu_limit() -> Option<String> {
    Some("0.5".to_string())
}

fn default_bind_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_log_filter() -> String {
    "info,clc=debug".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.base_port, 32100);
        assert_eq!(config.max_port, 32200);
        assert_eq!(config.idle_timeout_ms, 600_000);
        assert_eq!(config.startup_timeout_ms, 180_000);
        assert_eq!(config.net_io_delta_threshold_bytes, 51_200);
        assert!(config.containerization_enabled);
        assert_eq!(config.port_range_size(), 101);
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut config = Config::default();
        config.max_port = config.base_port - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_from_toml() {
        let toml = r#"
            engine = "podman"
            base_port = 40000
            max_port = 40010
            idle_timeout_ms = 1000
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.engine, Engine::Podman);
        assert_eq!(config.base_port, 40000);
        assert_eq!(config.max_port, 40010);
        assert_eq!(config.idle_timeout_ms, 1000);
        // Untouched fields still take their defaults.
        assert!(config.containerization_enabled);
        assert_eq!(config.node_image, "node:22-alpine");
    }
}
