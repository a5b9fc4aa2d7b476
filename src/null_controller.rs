//! The controller realized when `containerization_enabled = false`: every
//! write returns `ContainerizationDisabled`, every read reports an empty,
//! already-absent world. No engine process is ever spawned.

use crate::controller::{AppStatus, GetOrStartResult, LifecycleController};
use crate::engine::{EngineEvent, ExecOutput, LogStream, LogsOptions};
use crate::error::ControllerError;
use async_trait::async_trait;
use std::path::Path;

pub struct NullController;

#[async_trait]
impl LifecycleController for NullController {
    async fn get_or_start(
        &self,
        _app_id: &str,
        _app_path: &Path,
        _install_command: Option<&str>,
        _start_command: Option<&str>,
    ) -> Result<GetOrStartResult, ControllerError> {
        Err(ControllerError::ContainerizationDisabled)
    }

    async fn stop(&self, _app_id: &str) -> Result<(), ControllerError> {
        Err(ControllerError::ContainerizationDisabled)
    }

    async fn remove(&self, _app_id: &str) -> Result<(), ControllerError> {
        Err(ControllerError::ContainerizationDisabled)
    }

    async fn status(&self, _app_id: &str) -> Result<AppStatus, ControllerError> {
        Ok(AppStatus {
            state: "absent",
            port: None,
            ready_at: None,
            last_activity_at: None,
            inactive_for: None,
        })
    }

    async fn sync_files(&self, _app_id: &str, _paths: Option<&[String]>) -> Result<(), ControllerError> {
        Err(ControllerError::ContainerizationDisabled)
    }

    async fn logs(&self, _app_id: &str, _opts: LogsOptions) -> Result<String, ControllerError> {
        Ok(String::new())
    }

    async fn stream_logs(&self, _app_id: &str, _opts: LogsOptions) -> Result<LogStream, ControllerError> {
        Err(ControllerError::ContainerizationDisabled)
    }

    async fn exec(&self, _app_id: &str, _argv: &[String]) -> Result<ExecOutput, ControllerError> {
        Err(ControllerError::ContainerizationDisabled)
    }

    async fn events(&self, _app_id: &str) -> Result<Vec<EngineEvent>, ControllerError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_are_disabled() {
        let controller = NullController;
        let err = controller.get_or_start("app-a", Path::new("/tmp/app-a"), None, None).await.unwrap_err();
        assert!(matches!(err, ControllerError::ContainerizationDisabled));
    }

    #[tokio::test]
    async fn status_reports_absent() {
        let controller = NullController;
        let status = controller.status("app-a").await.unwrap();
        assert_eq!(status.state, "absent");
        assert!(status.port.is_none());
    }
}
