//! External start/stop control of recognition sessions.
//!
//! The controller runs each session on the blocking thread pool, enforces an
//! optional duration with a timer that clears the session's keep-running
//! flag, and forwards enrollment requests to the running loop.

use crate::enroll::EnrollError;
use crate::session::{
    EnrollRequest, RecognitionSession, SessionError, SessionStats, SessionSummary, StatsSnapshot,
};
use crate::store::TIMESTAMP_FORMAT;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const ENROLL_QUEUE: usize = 4;

/// Builds a fresh, stopped session for each `start`.
pub type SessionFactory =
    Box<dyn Fn() -> Result<RecognitionSession, SessionError> + Send + Sync>;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("a label is required to start a session")]
    MissingLabel,
    #[error("a session is already running")]
    AlreadyRunning,
    #[error("no session is running")]
    NotRunning,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("session worker failed: {0}")]
    Worker(String),
}

/// Snapshot returned by [`SessionController::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub label: Option<String>,
    pub started_at: Option<String>,
    pub remaining_secs: Option<u64>,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub last_outcome: Option<String>,
}

struct ActiveRun {
    label: String,
    started_at: DateTime<Local>,
    deadline: Option<Instant>,
    keep_running: Arc<AtomicBool>,
    enroll_tx: mpsc::Sender<EnrollRequest>,
    stats: Arc<SessionStats>,
    worker: JoinHandle<Result<SessionSummary, SessionError>>,
    timer: Option<JoinHandle<()>>,
}

impl ActiveRun {
    fn is_live(&self) -> bool {
        !self.worker.is_finished()
    }
}

#[derive(Default)]
struct Inner {
    active: Option<ActiveRun>,
    last_outcome: Option<String>,
}

pub struct SessionController {
    factory: SessionFactory,
    inner: Mutex<Inner>,
}

impl SessionController {
    pub fn new(factory: SessionFactory) -> Self {
        Self {
            factory,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Start a session labelled `label`, optionally bounded by `duration`.
    ///
    /// Returns once the camera and storage are open, or with the error
    /// that prevented it.
    pub async fn start(&self, label: &str, duration: Option<Duration>) -> Result<(), ControllerError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(ControllerError::MissingLabel);
        }

        let mut inner = self.inner.lock().await;
        if inner.active.as_ref().is_some_and(ActiveRun::is_live) {
            return Err(ControllerError::AlreadyRunning);
        }
        if let Some(finished) = inner.active.take() {
            if let Err(e) = Self::finish(&mut inner, finished).await {
                tracing::warn!(error = %e, "previous session ended with error");
            }
        }

        let mut session = (self.factory)()?;
        let stats = session.stats();
        let (session, started) = tokio::task::spawn_blocking(move || {
            let started = session.start();
            (session, started)
        })
        .await
        .map_err(|e| ControllerError::Worker(e.to_string()))?;
        started?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let (enroll_tx, mut enroll_rx) = mpsc::channel(ENROLL_QUEUE);

        let flag = Arc::clone(&keep_running);
        let worker = tokio::task::spawn_blocking(move || {
            let mut session = session;
            session.run(&flag, &mut enroll_rx)
        });

        let timer = duration.map(|duration| {
            let flag = Arc::clone(&keep_running);
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                tracing::info!(secs = duration.as_secs(), "session duration elapsed");
                flag.store(false, Ordering::Release);
            })
        });

        tracing::info!(label, duration_secs = ?duration.map(|d| d.as_secs()), "session started");
        inner.active = Some(ActiveRun {
            label: label.to_string(),
            started_at: Local::now(),
            deadline: duration.map(|d| Instant::now() + d),
            keep_running,
            enroll_tx,
            stats,
            worker,
            timer,
        });
        Ok(())
    }

    /// Stop the current session and wait for it to release its resources.
    ///
    /// Returns `Ok(None)` when nothing was running, so it is safe to call
    /// on every shutdown path. A session that had already failed reports
    /// its error here.
    pub async fn stop(&self) -> Result<Option<SessionSummary>, ControllerError> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.active.take() else {
            return Ok(None);
        };
        run.keep_running.store(false, Ordering::Release);
        Self::finish(&mut inner, run).await.map(Some)
    }

    async fn finish(inner: &mut Inner, run: ActiveRun) -> Result<SessionSummary, ControllerError> {
        if let Some(timer) = run.timer {
            timer.abort();
        }
        drop(run.enroll_tx);

        let result = match run.worker.await {
            Ok(result) => result.map_err(ControllerError::from),
            Err(e) => Err(ControllerError::Worker(e.to_string())),
        };

        inner.last_outcome = Some(match &result {
            Ok(summary) => format!(
                "{} stopped ({:?}): {} frames, {} logged, {} enrolled",
                run.label,
                summary.reason,
                summary.stats.frames,
                summary.stats.logged,
                summary.stats.enrolled
            ),
            Err(e) => format!("{} failed: {e}", run.label),
        });
        tracing::info!(label = %run.label, outcome = ?inner.last_outcome, "session finished");
        result
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .is_some_and(ActiveRun::is_live)
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        match &inner.active {
            Some(run) => SessionStatus {
                running: run.is_live(),
                label: Some(run.label.clone()),
                started_at: Some(run.started_at.format(TIMESTAMP_FORMAT).to_string()),
                remaining_secs: run
                    .deadline
                    .map(|d| d.saturating_duration_since(Instant::now()).as_secs()),
                stats: run.stats.snapshot(),
                last_outcome: inner.last_outcome.clone(),
            },
            None => SessionStatus {
                running: false,
                label: None,
                started_at: None,
                remaining_secs: None,
                stats: StatsSnapshot::default(),
                last_outcome: inner.last_outcome.clone(),
            },
        }
    }

    /// Enroll the first unknown face of the next frame under `name`.
    pub async fn enroll(&self, name: &str) -> Result<String, ControllerError> {
        let tx = {
            let inner = self.inner.lock().await;
            match &inner.active {
                Some(run) if run.is_live() => run.enroll_tx.clone(),
                _ => return Err(ControllerError::NotRunning),
            }
        };

        let (request, reply) = EnrollRequest::new(name);
        tx.send(request)
            .await
            .map_err(|_| EnrollError::SessionAborted)?;
        let stored = reply.await.map_err(|_| EnrollError::SessionAborted)??;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CaptureError, StopReason};
    use crate::testing::{face, settings, FakeAnalyzer, FakeCamera};
    use crate::NullSink;
    use std::path::{Path, PathBuf};

    fn controller_with(dir: &Path, camera: fn() -> FakeCamera) -> SessionController {
        let dir: PathBuf = dir.to_path_buf();
        SessionController::new(Box::new(move || -> Result<RecognitionSession, SessionError> {
            Ok(RecognitionSession::new(
                settings(&dir),
                Box::new(camera()),
                Box::new(FakeAnalyzer::constant(vec![face(&[0.9, 0.9])])),
                Box::new(NullSink),
            ))
        }))
    }

    async fn wait_until_stopped(controller: &SessionController) {
        for _ in 0..200 {
            if !controller.is_running().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session did not stop");
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_with(dir.path(), FakeCamera::endless);

        controller.start("front desk", None).await.unwrap();
        let status = controller.status().await;
        assert!(status.running);
        assert_eq!(status.label.as_deref(), Some("front desk"));
        assert_eq!(status.remaining_secs, None);

        let summary = controller.stop().await.unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert!(!controller.is_running().await);

        // Idempotent
        assert!(controller.stop().await.unwrap().is_none());
        let status = controller.status().await;
        assert!(!status.running);
        assert!(status.last_outcome.unwrap().starts_with("front desk stopped"));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_with(dir.path(), FakeCamera::endless);
        controller.start("a", None).await.unwrap();
        assert!(matches!(
            controller.start("b", None).await,
            Err(ControllerError::AlreadyRunning)
        ));
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_label_required() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_with(dir.path(), FakeCamera::endless);
        assert!(matches!(
            controller.start("  ", None).await,
            Err(ControllerError::MissingLabel)
        ));
        assert!(!controller.is_running().await);
    }

    #[tokio::test]
    async fn test_duration_deadline_stops_session() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_with(dir.path(), FakeCamera::endless);
        controller
            .start("timed", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        wait_until_stopped(&controller).await;

        let summary = controller.stop().await.unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert!(summary.stats.frames > 0);
    }

    #[tokio::test]
    async fn test_camera_failure_surfaces_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_with(dir.path(), FakeCamera::unavailable);
        let err = controller.start("x", None).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Session(SessionError::Capture(CaptureError::Open(_)))
        ));
        assert!(!controller.is_running().await);
        assert!(controller.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_after_stream_end() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_with(dir.path(), || FakeCamera::finite(2));
        controller.start("first", None).await.unwrap();
        wait_until_stopped(&controller).await;

        controller.start("second", None).await.unwrap();
        let status = controller.status().await;
        assert_eq!(status.label.as_deref(), Some("second"));
        assert!(status.last_outcome.unwrap().contains("StreamEnded"));
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_failed_session_keeps_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let controller = SessionController::new(Box::new(
            move || -> Result<RecognitionSession, SessionError> {
                Ok(RecognitionSession::new(
                    settings(&path),
                    Box::new(FakeCamera::endless()),
                    Box::new(FakeAnalyzer::dead()),
                    Box::new(NullSink),
                ))
            },
        ));

        controller.start("broken", None).await.unwrap();
        wait_until_stopped(&controller).await;

        // The failed run is reaped here rather than reported to the caller.
        controller.start("retry", None).await.unwrap();
        let status = controller.status().await;
        assert_eq!(status.label.as_deref(), Some("retry"));
        let outcome = status.last_outcome.unwrap();
        assert!(outcome.starts_with("broken failed"), "{outcome}");
        assert!(controller.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_enroll_through_controller() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_with(dir.path(), FakeCamera::endless);
        controller.start("desk", None).await.unwrap();

        assert_eq!(controller.enroll("zoe").await.unwrap(), "Zoe");
        // The only face in view is now known, so there is no candidate left.
        assert!(matches!(
            controller.enroll("Yara").await,
            Err(ControllerError::Enroll(EnrollError::NoCandidate))
        ));

        let summary = controller.stop().await.unwrap().unwrap();
        assert_eq!(summary.stats.enrolled, 1);
        assert_eq!(summary.stats.logged, 1);
    }

    #[tokio::test]
    async fn test_enroll_requires_running_session() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_with(dir.path(), FakeCamera::endless);
        assert!(matches!(
            controller.enroll("zoe").await,
            Err(ControllerError::NotRunning)
        ));
    }
}
