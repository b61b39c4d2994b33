use facelog_core::{ControllerError, EnrollError, SessionController};
use std::sync::Arc;
use std::time::Duration;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.facelog.Session1";
pub const OBJECT_PATH: &str = "/org/facelog/Session1";

/// D-Bus interface for the facelog recognition daemon.
///
/// Bus name: org.facelog.Session1
/// Object path: /org/facelog/Session1
pub struct SessionService {
    controller: Arc<SessionController>,
}

impl SessionService {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }
}

fn to_fdo(err: ControllerError) -> zbus::fdo::Error {
    match err {
        ControllerError::MissingLabel
        | ControllerError::Enroll(EnrollError::Invalid(_))
        | ControllerError::Enroll(EnrollError::Duplicate(_)) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.facelog.Session1")]
impl SessionService {
    /// Start a recognition session. `minutes == 0` runs until `Stop`.
    async fn start(&self, label: &str, minutes: u32) -> zbus::fdo::Result<()> {
        tracing::info!(label, minutes, "start requested");
        let duration = (minutes > 0).then(|| Duration::from_secs(u64::from(minutes) * 60));
        self.controller
            .start(label, duration)
            .await
            .map_err(to_fdo)
    }

    /// Stop the running session. Returns false if none was running.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        let summary = self.controller.stop().await.map_err(to_fdo)?;
        Ok(summary.is_some())
    }

    /// Return session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.controller.status().await;
        serde_json::to_string(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Enroll the next unknown face seen by the running session.
    async fn enroll(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "enroll requested");
        self.controller.enroll(name).await.map_err(to_fdo)
    }

    /// Annotated preview frame as a `data:image/jpeg;base64,...` URI.
    #[zbus(signal)]
    pub async fn frame(emitter: &SignalEmitter<'_>, data_uri: &str) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use facelog_core::NameError;

    #[test]
    fn test_validation_errors_are_invalid_args() {
        assert!(matches!(
            to_fdo(ControllerError::MissingLabel),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo(ControllerError::Enroll(EnrollError::Invalid(NameError::Empty))),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo(ControllerError::Enroll(EnrollError::Duplicate("Ann".into()))),
            zbus::fdo::Error::InvalidArgs(_)
        ));
    }

    #[test]
    fn test_runtime_errors_are_failed() {
        assert!(matches!(
            to_fdo(ControllerError::NotRunning),
            zbus::fdo::Error::Failed(_)
        ));
        assert!(matches!(
            to_fdo(ControllerError::Enroll(EnrollError::NoCandidate)),
            zbus::fdo::Error::Failed(_)
        ));
    }
}
