//! The Controller API HTTP binding (§6): a minimal, unauthenticated surface
//! over `LifecycleController`, intended to sit behind an authenticating
//! reverse proxy.

use crate::controller::LifecycleController;
use crate::engine::{EngineEvent, LogKind, LogStream, LogsOptions};
use crate::error::ControllerError;
use anyhow::Result;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Shared, boxed hyper body used for both plain JSON responses and the SSE
/// log stream — they must share a type to flow through one `match` arm.
type ApiBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub struct ApiServer {
    controller: Arc<dyn LifecycleController>,
    bind_addr: SocketAddr,
    apps_root: PathBuf,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        controller: Arc<dyn LifecycleController>,
        bind_addr: SocketAddr,
        apps_root: PathBuf,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self { controller, bind_addr, apps_root, shutdown_rx }
    }

    fn app_path(&self, app_id: &str, override_path: Option<String>) -> PathBuf {
        match override_path {
            Some(p) => PathBuf::from(p),
            None => self.apps_root.join(app_id),
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "controller API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(%addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("controller API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, _addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

        Ok(())
    }

    async fn handle_request(self: Arc<Self>, req: Request<Incoming>) -> Result<Response<ApiBody>, hyper::Error> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let method = req.method().clone();

        debug!(%method, %path, "controller API request");

        if path == "/health" && method == Method::GET {
            return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
        }

        let Some(rest) = path.strip_prefix("/apps/") else {
            return Ok(not_found());
        };
        let mut segments = rest.splitn(2, '/');
        let app_id = segments.next().unwrap_or("").to_string();
        let sub = segments.next().unwrap_or("");
        if app_id.is_empty() {
            return Ok(not_found());
        }

        let response = match (&method, sub) {
            (&Method::GET, "") | (&Method::GET, "status") => self.handle_status(&app_id).await,
            (&Method::POST, "start") => self.handle_start(&app_id, req).await,
            (&Method::POST, "stop") => self.handle_stop(&app_id).await,
            (&Method::DELETE, "") => self.handle_remove(&app_id).await,
            (&Method::GET, "logs") => self.handle_logs_history(&app_id, &query).await,
            (&Method::GET, "logs/stream") => self.handle_logs_stream(&app_id, &query).await,
            (&Method::GET, "events") => self.handle_events(&app_id).await,
            (&Method::POST, "exec") => self.handle_exec(&app_id, req).await,
            _ => not_found(),
        };

        Ok(response)
    }

    async fn handle_status(&self, app_id: &str) -> Response<ApiBody> {
        match self.controller.status(app_id).await {
            Ok(status) => {
                let body = serde_json::json!({
                    "state": status.state,
                    "port": status.port,
                    "readyAt": status.ready_at,
                    "lastActivityAt": status.last_activity_at,
                    "inactiveFor": status.inactive_for.map(|d| d.as_secs()),
                });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => controller_error_response(&e),
        }
    }

    async fn handle_start(&self, app_id: &str, req: Request<Incoming>) -> Response<ApiBody> {
        let body = read_body(req).await.unwrap_or_default();
        let parsed: StartRequest = serde_json::from_slice(&body).unwrap_or_default();
        let app_path = self.app_path(app_id, parsed.app_path);

        match self
            .controller
            .get_or_start(app_id, &app_path, parsed.install_command.as_deref(), parsed.start_command.as_deref())
            .await
        {
            Ok(result) => {
                let body = serde_json::json!({ "port": result.port, "ready": result.ready });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => controller_error_response(&e),
        }
    }

    async fn handle_stop(&self, app_id: &str) -> Response<ApiBody> {
        match self.controller.stop(app_id).await {
            Ok(()) => json_response(StatusCode::OK, r#"{"ok":true}"#),
            Err(e) => controller_error_response(&e),
        }
    }

    async fn handle_remove(&self, app_id: &str) -> Response<ApiBody> {
        match self.controller.remove(app_id).await {
            Ok(()) => json_response(StatusCode::OK, r#"{"ok":true}"#),
            Err(e) => controller_error_response(&e),
        }
    }

    async fn handle_logs_history(&self, app_id: &str, query: &str) -> Response<ApiBody> {
        let params = parse_query(query);
        let opts = LogsOptions {
            tail: params.get("tail").and_then(|v| v.parse().ok()),
            since: params.get("since").and_then(|v| v.parse().ok()),
            follow: false,
        };
        match self.controller.logs(app_id, opts).await {
            Ok(text) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(full_body(text))
                .expect("valid response"),
            Err(e) => controller_error_response(&e),
        }
    }

    async fn handle_logs_stream(&self, app_id: &str, query: &str) -> Response<ApiBody> {
        let params = parse_query(query);
        let opts = LogsOptions {
            tail: params.get("tail").and_then(|v| v.parse().ok()),
            since: None,
            follow: params.get("follow").map(|v| v != "false").unwrap_or(true),
        };

        let stream = match self.controller.stream_logs(app_id, opts).await {
            Ok(stream) => stream,
            Err(e) => return controller_error_response(&e),
        };

        // The shutdown sender travels alongside the receiver in the unfold
        // state so it stays alive exactly as long as the response body does;
        // dropping it when the client disconnects tears down the background
        // log-piping task without touching the container.
        let LogStream { receiver, shutdown } = stream;
        let body_stream = futures::stream::unfold(Some((receiver, shutdown)), |state| async move {
            let (mut receiver, shutdown) = state?;
            match receiver.recv().await {
                Some(line) => {
                    let level = match line.kind {
                        LogKind::Stdout => "info",
                        LogKind::Stderr => "error",
                    };
                    let event = serde_json::json!({
                        "timestamp": chrono::Utc::now(),
                        "level": level,
                        "message": line.payload,
                    });
                    let frame = Ok(Frame::data(Bytes::from(format!("data: {event}\n\n"))));
                    Some((frame, Some((receiver, shutdown))))
                }
                None => {
                    let frame = Ok(Frame::data(Bytes::from("data: {\"type\":\"end\"}\n\n")));
                    Some((frame, None))
                }
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header("Cache-Control", "no-cache")
            .body(ApiBody::new(StreamBody::new(body_stream)))
            .expect("valid response")
    }

    async fn handle_events(&self, app_id: &str) -> Response<ApiBody> {
        match self.controller.events(app_id).await {
            Ok(events) => {
                let body = serde_json::to_string(&events.iter().map(EventView::from).collect::<Vec<_>>())
                    .unwrap_or_else(|_| "[]".to_string());
                json_response(StatusCode::OK, body)
            }
            Err(e) => controller_error_response(&e),
        }
    }

    async fn handle_exec(&self, app_id: &str, req: Request<Incoming>) -> Response<ApiBody> {
        let body = read_body(req).await.unwrap_or_default();
        let parsed: ExecRequest = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "INVALID_BODY", "expected {\"argv\": [...]}"),
        };

        match self.controller.exec(app_id, &parsed.argv).await {
            Ok(output) => {
                let body = serde_json::json!({
                    "exitCode": output.exit_code,
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => controller_error_response(&e),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct StartRequest {
    #[serde(rename = "appPath")]
    app_path: Option<String>,
    #[serde(rename = "installCommand")]
    install_command: Option<String>,
    #[serde(rename = "startCommand")]
    start_command: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    argv: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EventView {
    #[serde(rename = "type")]
    kind: String,
    at: chrono::DateTime<chrono::Utc>,
}

impl From<&EngineEvent> for EventView {
    fn from(e: &EngineEvent) -> Self {
        Self { kind: e.kind.clone(), at: e.at }
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes> {
    Ok(req.into_body().collect().await?.to_bytes())
}

fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            Some((key, value))
        })
        .collect()
}

fn full_body(body: impl Into<Bytes>) -> ApiBody {
    ApiBody::new(Full::new(body.into()).map_err(|never| match never {}))
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ApiBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response")
}

fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response<ApiBody> {
    let body = serde_json::json!({ "error": message.into(), "code": code });
    json_response(status, body.to_string())
}

fn not_found() -> Response<ApiBody> {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "no such route")
}

/// Maps `ControllerError` to the HTTP status and `{error, code}` envelope per
/// the error-handling design: `NotFound -> 404`, `NoPortsAvailable -> 503`
/// with `Retry-After`, `StartupTimeout -> 504`, `ContainerizationDisabled ->
/// 501`, everything else -> 500.
fn controller_error_response(err: &ControllerError) -> Response<ApiBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "error": err.to_string(), "code": err.code() });

    let mut builder = Response::builder().status(status).header(CONTENT_TYPE, "application/json");
    if matches!(err, ControllerError::NoPortsAvailable) {
        builder = builder.header("Retry-After", "5");
    }
    builder.body(full_body(body.to_string())).expect("valid response")
}
