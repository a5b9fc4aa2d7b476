//! Stable error taxonomy for the container lifecycle controller.
//!
//! `EngineError` covers faults surfaced by the container engine adapter (C1).
//! `ControllerError` is the outward-facing taxonomy callers of the
//! `LifecycleController` trait match on; it wraps `EngineError` where the
//! fault originated there.

use thiserror::Error;

/// Errors surfaced by the `ContainerEngine` adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    #[error("container engine returned a transient error: {0}")]
    Transient(String),

    #[error("image build failed:\n{stderr}")]
    ImageBuildFailed { stderr: String },

    #[error("port {0} is no longer available")]
    PortConflict(u16),

    #[error("image missing: {0}")]
    ImageMissing(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container engine error: {0}")]
    Unknown(String),
}

/// The stable, outward-facing error taxonomy for `LifecycleController` operations.
#[derive(Debug, Error, Clone)]
pub enum ControllerError {
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("image build failed:\n{stderr}")]
    ImageBuildFailed { stderr: String },

    #[error("no ports available in the configured range")]
    NoPortsAvailable,

    #[error("dev server did not become ready within the startup timeout")]
    StartupTimeout,

    #[error("container exited during startup: {reason}")]
    StartFailed { reason: String },

    #[error("unknown app id: {0}")]
    NotFound(String),

    #[error("containerization is disabled")]
    ContainerizationDisabled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ControllerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => ControllerError::EngineUnavailable(msg),
            // A transient engine error that survives the single
            // retry-with-backoff in `run_start`/`transition_to_stopping`
            // (see controller.rs) is reported to the caller as an internal
            // error: it is not one of the stable, user-actionable variants.
            EngineError::Transient(msg) => ControllerError::Internal(msg),
            EngineError::ImageBuildFailed { stderr } => ControllerError::ImageBuildFailed { stderr },
            EngineError::PortConflict(port) => {
                ControllerError::Internal(format!("port conflict on {port}"))
            }
            EngineError::ImageMissing(image) => {
                ControllerError::Internal(format!("image missing: {image}"))
            }
            EngineError::NotFound(name) => ControllerError::NotFound(name),
            EngineError::Unknown(msg) => ControllerError::Internal(msg),
        }
    }
}

impl ControllerError {
    /// HTTP status code this error maps to in the Controller API binding.
    pub fn status_code(&self) -> u16 {
        match self {
            ControllerError::NotFound(_) => 404,
            ControllerError::NoPortsAvailable => 503,
            ControllerError::StartupTimeout => 504,
            ControllerError::ContainerizationDisabled => 501,
            _ => 500,
        }
    }

    /// Machine-readable code for the JSON error envelope / header.
    pub fn code(&self) -> &'static str {
        match self {
            ControllerError::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            ControllerError::ImageBuildFailed { .. } => "IMAGE_BUILD_FAILED",
            ControllerError::NoPortsAvailable => "NO_PORTS_AVAILABLE",
            ControllerError::StartupTimeout => "STARTUP_TIMEOUT",
            ControllerError::StartFailed { .. } => "START_FAILED",
            ControllerError::NotFound(_) => "NOT_FOUND",
            ControllerError::ContainerizationDisabled => "CONTAINERIZATION_DISABLED",
            ControllerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_not_found_maps_to_controller_not_found() {
        let err: ControllerError = EngineError::NotFound("dyad-app-1".into()).into();
        assert!(matches!(err, ControllerError::NotFound(_)));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(ControllerError::NoPortsAvailable.status_code(), 503);
        assert_eq!(ControllerError::StartupTimeout.status_code(), 504);
        assert_eq!(ControllerError::ContainerizationDisabled.status_code(), 501);
        assert_eq!(
            ControllerError::ImageBuildFailed { stderr: String::new() }.status_code(),
            500
        );
    }
}
