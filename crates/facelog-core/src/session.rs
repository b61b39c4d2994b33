//! The recognition loop: capture → analyze → match → log, with enrollment.
//!
//! A [`RecognitionSession`] is either stopped or running. While running it
//! exclusively owns the camera stream, the storage connection and the
//! in-memory registry snapshot. The loop is single-threaded and blocking;
//! callers run it on a dedicated thread and stop it by clearing the
//! keep-running flag.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::enroll::{EnrollError, EnrollmentController};
use crate::frame::{annotate, AnnotatedFrame, FaceAnnotation, Frame};
use crate::sink::FrameSink;
use crate::store::{Storage, StorageError, DEFAULT_BUFFER_SECS};
use crate::types::{EuclideanMatcher, Identification, Matcher, Registry};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open camera: {0}")]
    Open(String),
    #[error("failed to read frame: {0}")]
    Read(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("session already running")]
    AlreadyRunning,
    #[error("session not running")]
    NotRunning,
}

/// An open camera stream.
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream has ended.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Opens camera streams. Dropping the returned source releases the device.
pub trait CameraBackend: Send {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// Paths and thresholds a session runs with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub db_path: PathBuf,
    pub log_path: PathBuf,
    pub faces_dir: PathBuf,
    pub tolerance: f64,
    pub buffer_secs: i64,
}

impl SessionSettings {
    pub fn new(db_path: PathBuf, log_path: PathBuf, faces_dir: PathBuf) -> Self {
        Self {
            db_path,
            log_path,
            faces_dir,
            tolerance: EuclideanMatcher::DEFAULT_TOLERANCE,
            buffer_secs: DEFAULT_BUFFER_SECS,
        }
    }
}

/// Request to enroll the first unknown face of the next processed frame.
#[derive(Debug)]
pub struct EnrollRequest {
    pub name: String,
    pub reply: oneshot::Sender<Result<String, EnrollError>>,
}

impl EnrollRequest {
    pub fn new(name: impl Into<String>) -> (Self, oneshot::Receiver<Result<String, EnrollError>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                name: name.into(),
                reply,
            },
            rx,
        )
    }
}

/// Counters shared between the loop thread and observers.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames: AtomicU64,
    faces: AtomicU64,
    logged: AtomicU64,
    enrolled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub faces: u64,
    pub logged: u64,
    pub enrolled: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            faces: self.faces.load(Ordering::Relaxed),
            logged: self.logged.load(Ordering::Relaxed),
            enrolled: self.enrolled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The keep-running flag was cleared.
    Cancelled,
    /// The camera stopped delivering frames.
    StreamEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub reason: StopReason,
    pub stats: StatsSnapshot,
}

/// What happened in one processed frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub faces: Vec<FaceAnnotation>,
    /// Names newly written to the recognition log.
    pub logged: Vec<String>,
    pub enrolled: Option<String>,
}

struct Active {
    source: Box<dyn FrameSource>,
    storage: Storage,
    registry: Registry,
}

pub struct RecognitionSession {
    settings: SessionSettings,
    camera: Box<dyn CameraBackend>,
    analyzer: Box<dyn FaceAnalyzer>,
    sink: Box<dyn FrameSink>,
    matcher: EuclideanMatcher,
    enrollment: EnrollmentController,
    stats: Arc<SessionStats>,
    active: Option<Active>,
}

impl RecognitionSession {
    pub fn new(
        settings: SessionSettings,
        camera: Box<dyn CameraBackend>,
        analyzer: Box<dyn FaceAnalyzer>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            matcher: EuclideanMatcher::new(settings.tolerance),
            enrollment: EnrollmentController::new(settings.faces_dir.clone()),
            settings,
            camera,
            analyzer,
            sink,
            stats: Arc::new(SessionStats::default()),
            active: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// Number of encodings in the current registry snapshot.
    pub fn registry_len(&self) -> Option<usize> {
        self.active.as_ref().map(|a| a.registry.len())
    }

    /// Open the camera and storage, load the registry, enter RUNNING.
    ///
    /// On failure everything acquired so far is released and the session
    /// stays stopped.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyRunning);
        }

        let source = self.camera.open()?;
        let storage = Storage::open(&self.settings.db_path, &self.settings.log_path)?;
        let registry = storage.faces().registry()?;

        tracing::info!(
            known = registry.len(),
            db = %self.settings.db_path.display(),
            tolerance = self.settings.tolerance,
            "recognition session started"
        );

        self.active = Some(Active {
            source,
            storage,
            registry,
        });
        Ok(())
    }

    /// Release the camera and close storage. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        drop(active.source);
        if let Err(e) = active.storage.close() {
            tracing::warn!(error = %e, "failed to close storage cleanly");
        }
        tracing::info!(stats = ?self.stats.snapshot(), "recognition session stopped");
    }

    /// Run until `keep_running` is cleared or the stream ends, then stop.
    ///
    /// `keep_running` is polled once per frame. Enrollment requests are
    /// taken from `requests` without blocking, at most one per frame.
    pub fn run(
        &mut self,
        keep_running: &AtomicBool,
        requests: &mut mpsc::Receiver<EnrollRequest>,
    ) -> Result<SessionSummary, SessionError> {
        let result = self.run_loop(keep_running, requests);
        self.stop();

        while let Ok(pending) = requests.try_recv() {
            let _ = pending.reply.send(Err(EnrollError::SessionAborted));
        }

        match result {
            Ok(reason) => Ok(SessionSummary {
                reason,
                stats: self.stats.snapshot(),
            }),
            Err(e) => {
                tracing::error!(error = %e, "recognition session failed");
                Err(e)
            }
        }
    }

    fn run_loop(
        &mut self,
        keep_running: &AtomicBool,
        requests: &mut mpsc::Receiver<EnrollRequest>,
    ) -> Result<StopReason, SessionError> {
        loop {
            if !keep_running.load(Ordering::Acquire) {
                tracing::info!("stop requested");
                return Ok(StopReason::Cancelled);
            }

            let active = self.active.as_mut().ok_or(SessionError::NotRunning)?;
            let frame = match active.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("camera stream ended");
                    return Ok(StopReason::StreamEnded);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "frame read failed; ending session");
                    return Ok(StopReason::StreamEnded);
                }
            };

            let request = requests.try_recv().ok();
            self.process_frame(&frame, Local::now().naive_local(), request)?;
        }
    }

    /// Run one frame through detection, matching, logging and (if requested)
    /// enrollment, then publish the annotated frame.
    ///
    /// The enrollment candidate is always taken from this same frame.
    /// On a fatal error `request` is dropped, which its receiver observes
    /// as the session ending.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        now: NaiveDateTime,
        request: Option<EnrollRequest>,
    ) -> Result<FrameReport, SessionError> {
        let active = self.active.as_mut().ok_or(SessionError::NotRunning)?;

        let mut image = match frame.to_rgb() {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "dropping unreadable frame");
                if let Some(request) = request {
                    let _ = request.reply.send(Err(EnrollError::NoCandidate));
                }
                return Ok(FrameReport::default());
            }
        };

        let detections = match self.analyzer.analyze(&image) {
            Ok(faces) => faces,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "face analysis failed for frame");
                Vec::new()
            }
        };
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.stats
            .faces
            .fetch_add(detections.len() as u64, Ordering::Relaxed);

        let log = active.storage.log().with_buffer_secs(self.settings.buffer_secs);
        let mut report = FrameReport::default();
        let mut candidate = None;

        for (idx, face) in detections.iter().enumerate() {
            match self.matcher.identify(&face.embedding, &active.registry) {
                Identification::Known { name, distance } => {
                    tracing::debug!(name = %name, distance, "face recognized");
                    if log.record(&name, now)? {
                        self.stats.logged.fetch_add(1, Ordering::Relaxed);
                        report.logged.push(name.clone());
                    }
                    report.faces.push(FaceAnnotation {
                        bbox: face.bbox,
                        name: Some(name),
                        distance: Some(distance),
                    });
                }
                Identification::Unknown => {
                    candidate.get_or_insert(idx);
                    report.faces.push(FaceAnnotation {
                        bbox: face.bbox,
                        name: None,
                        distance: None,
                    });
                }
            }
        }

        if let Some(request) = request {
            let outcome = match candidate {
                Some(idx) => self.enrollment.enroll(
                    &active.storage.faces(),
                    &request.name,
                    &image,
                    &detections[idx].embedding,
                ),
                None => Err(EnrollError::NoCandidate),
            };

            match outcome {
                Ok(name) => {
                    active.registry = active.storage.faces().registry()?;
                    self.stats.enrolled.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(name = %name, known = active.registry.len(), "registry reloaded");
                    report.enrolled = Some(name.clone());
                    let _ = request.reply.send(Ok(name));
                }
                Err(EnrollError::Storage(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::info!(input = %request.name, reason = %e, "enrollment rejected");
                    let _ = request.reply.send(Err(e));
                }
            }
        }

        annotate(&mut image, &report.faces);
        self.sink.publish(&AnnotatedFrame {
            image,
            faces: report.faces.clone(),
            sequence: frame.sequence,
        });

        Ok(report)
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        self.stop();
    }
}
