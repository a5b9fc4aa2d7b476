//! Bollard-backed `ContainerEngine`. Works against either a Docker daemon or
//! a Podman socket: both speak the same API, and Podman's compatibility
//! socket is one of the paths we probe by default.

use super::{
    ContainerEngine, ContainerInfo, ContainerSummary, EngineEvent, ExecOutput, LogKind, LogLine,
    LogStream, LogsOptions as EngineLogsOptions, NetIo, RawStatus, RunSpec, Stats,
};
use crate::config::Engine as EngineKind;
use crate::error::EngineError;
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions as BollardLogsOptions, RemoveContainerOptions, StartContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect using, in priority order: an explicit `docker_host`, the
    /// `DOCKER_HOST` environment variable, then a probe of common socket
    /// paths, filtered to those consistent with `engine` (the probe only
    /// ever tries Podman's socket when `engine = Engine::Podman`, and vice
    /// versa for the Docker-flavored paths).
    pub async fn connect(docker_host: Option<&str>, engine: EngineKind) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Self::connect_with_defaults(engine).await?
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("container engine is not responding: {e}"))?;

        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("cannot connect to unix socket '{socket_path}': {e}"))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("cannot connect to tcp endpoint '{host}': {e}"))
        } else {
            anyhow::bail!("invalid docker host '{host}': expected 'unix://...' or 'tcp://...'")
        }
    }

    async fn connect_with_defaults(engine: EngineKind) -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let docker_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{home}/.docker/run/docker.sock")),
            ("Colima (macOS)", format!("{home}/.colima/default/docker.sock")),
            ("Rancher Desktop", format!("{home}/.rd/docker.sock")),
        ];
        let podman_paths: Vec<(&str, String)> =
            vec![("Podman (Linux)", format!("{xdg_runtime}/podman/podman.sock"))];

        let socket_paths: Vec<(&str, String)> = match engine {
            EngineKind::Docker => docker_paths,
            EngineKind::Podman => podman_paths,
        };

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") || !Path::new(path).exists() {
                continue;
            }
            debug!(path, name, "found container engine socket");
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults()
            .map_err(|e| anyhow::anyhow!("no reachable container engine socket found: {e}"))
    }

    fn memory_bytes(limit: &str) -> Option<i64> {
        let limit = limit.trim().to_lowercase();
        let (num_str, multiplier) = if let Some(num) = limit.strip_suffix("gb").or_else(|| limit.strip_suffix('g')) {
            (num, 1024i64 * 1024 * 1024)
        } else if let Some(num) = limit.strip_suffix("mb").or_else(|| limit.strip_suffix('m')) {
            (num, 1024i64 * 1024)
        } else if let Some(num) = limit.strip_suffix("kb").or_else(|| limit.strip_suffix('k')) {
            (num, 1024i64)
        } else {
            (limit.as_str(), 1i64)
        };
        num_str.trim().parse::<f64>().ok().map(|n| (n * multiplier as f64) as i64)
    }
}

fn classify_err(name: &str, err: bollard::errors::Error) -> EngineError {
    if let bollard::errors::Error::DockerResponseServerError { status_code, message } = &err {
        match status_code {
            404 => return EngineError::NotFound(name.to_string()),
            409 if message.contains("port is already allocated") => {
                return EngineError::Unknown(format!("port conflict starting {name}: {message}"));
            }
            _ => {}
        }
    }
    EngineError::Transient(err.to_string())
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list(&self, prefix: &str) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let name = c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string();
                let host_port = c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|p| p.public_port);
                ContainerSummary {
                    name,
                    host_port,
                    status_text: c.status.unwrap_or_default(),
                    created_at: c.created.map(|t| t.to_string()),
                }
            })
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        match self.client.inspect_container(name, None).await {
            Ok(info) => {
                let running = info
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                let exit_code = info.state.as_ref().and_then(|s| s.exit_code).unwrap_or(0);
                let status = if running { RawStatus::Running } else { RawStatus::Exited(exit_code) };
                let host_port = info
                    .network_settings
                    .and_then(|ns| ns.ports)
                    .and_then(|ports| ports.into_values().flatten().flatten().next())
                    .and_then(|binding| binding.host_port)
                    .and_then(|p| p.parse().ok());
                Ok(Some(ContainerInfo { name: name.to_string(), host_port, status }))
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(EngineError::Transient(e.to_string())),
        }
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, EngineError> {
        match self.client.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(EngineError::Transient(e.to_string())),
        }
    }

    async fn build(&self, path: &Path, tag: &str) -> Result<(), EngineError> {
        let tar_bytes = tar_directory(path)
            .await
            .map_err(|e| EngineError::Unknown(format!("failed to package build context: {e}")))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: tag,
            rm: true,
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(tar_bytes.into()));
        let mut stderr = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(info) => {
                    if let Some(err) = info.error {
                        stderr.push_str(&err);
                        stderr.push('\n');
                    }
                }
                Err(e) => {
                    stderr.push_str(&e.to_string());
                    stderr.push('\n');
                }
            }
        }

        if !stderr.is_empty() {
            return Err(EngineError::ImageBuildFailed { stderr });
        }
        Ok(())
    }

    async fn run(&self, spec: RunSpec<'_>) -> Result<(), EngineError> {
        let _ = self.rm(spec.name, true).await;

        let port_key = format!("{}/tcp", spec.guest_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if spec.volumes.is_empty() {
                None
            } else {
                Some(spec.volumes.iter().map(|(h, c)| format!("{h}:{c}")).collect())
            },
            ..Default::default()
        };
        if let Some(mem) = spec.memory_limit.and_then(Self::memory_bytes) {
            host_config.memory = Some(mem);
        }
        if let Some(cpus) = spec.cpu_limit.and_then(|c| c.parse::<f64>().ok()) {
            host_config.nano_cpus = Some((cpus * 1_000_000_000.0) as i64);
        }

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let container_config = ContainerConfig {
            image: Some(spec.image.to_string()),
            cmd: spec.command.map(|c| c.to_vec()),
            env: Some(env),
            working_dir: spec.work_dir.map(|d| d.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions { name: spec.name.to_string(), platform: None };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("port is already allocated") || msg.contains("address already in use") {
                    EngineError::PortConflict(spec.host_port)
                } else if msg.contains("No such image") {
                    EngineError::ImageMissing(spec.image.to_string())
                } else {
                    classify_err(spec.name, e)
                }
            })?;

        self.client
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("port is already allocated") {
                    EngineError::PortConflict(spec.host_port)
                } else {
                    classify_err(spec.name, e)
                }
            })?;

        Ok(())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptions { t: grace.as_secs() as i64 };
        match self.client.stop_container(name, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(EngineError::Transient(e.to_string())),
        }
    }

    async fn rm(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions { force, ..Default::default() };
        match self.client.remove_container(name, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => {
                warn!(name, error = %e, "failed to remove container");
                Ok(())
            }
        }
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput, EngineError> {
        let exec = self
            .client
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify_err(name, e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify_err(name, e))?
        {
            while let Some(Ok(msg)) = output.next().await {
                match msg {
                    LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                    LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                    _ => {}
                }
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify_err(name, e))?;

        Ok(ExecOutput { exit_code: inspect.exit_code.unwrap_or(0), stdout, stderr })
    }

    async fn logs(&self, name: &str, opts: EngineLogsOptions) -> Result<String, EngineError> {
        let options = BollardLogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: opts.tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
            since: opts.since.unwrap_or(0),
            ..Default::default()
        };

        let mut stream = self.client.logs(name, Some(options));
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message } | LogOutput::Console { message }) => {
                    buf.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                    return Err(EngineError::NotFound(name.to_string()));
                }
                Err(e) => return Err(EngineError::Transient(e.to_string())),
            }
        }
        Ok(buf)
    }

    async fn stream_logs(&self, name: &str, opts: EngineLogsOptions) -> Result<LogStream, EngineError> {
        if self.inspect(name).await?.is_none() {
            return Err(EngineError::NotFound(name.to_string()));
        }

        let (tx, rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client.clone();
        let name = name.to_string();

        let options = BollardLogsOptions::<String> {
            follow: opts.follow,
            stdout: true,
            stderr: true,
            tail: opts.tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
            since: opts.since.unwrap_or(0),
            ..Default::default()
        };

        tokio::spawn(async move {
            let mut stream = client.logs(&name, Some(options));
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    chunk = stream.next() => {
                        let Some(chunk) = chunk else { break };
                        let line = match chunk {
                            Ok(LogOutput::StdOut { message }) => LogLine { kind: LogKind::Stdout, payload: String::from_utf8_lossy(&message).into_owned() },
                            Ok(LogOutput::StdErr { message }) => LogLine { kind: LogKind::Stderr, payload: String::from_utf8_lossy(&message).into_owned() },
                            Ok(LogOutput::Console { message }) => LogLine { kind: LogKind::Stdout, payload: String::from_utf8_lossy(&message).into_owned() },
                            Ok(LogOutput::StdIn { .. }) => continue,
                            Err(_) => break,
                        };
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(LogStream { receiver: rx, shutdown: shutdown_tx })
    }

    async fn stats(&self, name: &str) -> Result<Stats, EngineError> {
        let options = StatsOptions { stream: false, one_shot: true };
        let mut stream = self.client.stats(name, Some(options));
        let sample = stream
            .next()
            .await
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?
            .map_err(|e| classify_err(name, e))?;

        let mem_percent = match (sample.memory_stats.usage, sample.memory_stats.limit) {
            (Some(usage), Some(limit)) if limit > 0 => (usage as f64 / limit as f64) * 100.0,
            _ => 0.0,
        };

        let (rx_bytes, tx_bytes) = sample
            .networks
            .unwrap_or_default()
            .values()
            .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes));

        Ok(Stats { mem_percent, net_io: NetIo { rx_bytes, tx_bytes } })
    }

    async fn events(&self, _name: &str) -> Result<Vec<EngineEvent>, EngineError> {
        // Docker's event stream is daemon-wide and ordered by time, not easily
        // scoped to a single idle container without a persistent subscriber;
        // the reconciler derives lifecycle state from `inspect` instead.
        Ok(Vec::new())
    }
}

async fn tar_directory(path: &Path) -> std::io::Result<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", &path)?;
        builder.into_inner()
    })
    .await
    .expect("tar packaging task panicked")
}
