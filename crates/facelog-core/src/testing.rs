//! Fakes for the camera, analyzer and sink seams.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::frame::{AnnotatedFrame, FaceAnnotation, Frame, PixelFormat};
use crate::session::{CameraBackend, CaptureError, FrameSource, SessionSettings};
use crate::sink::FrameSink;
use crate::store::Storage;
use crate::types::{BoundingBox, DetectedFace, Embedding};
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn settings(dir: &Path) -> SessionSettings {
    SessionSettings::new(
        dir.join("faces.db"),
        dir.join("logs.txt"),
        dir.join("faces"),
    )
}

/// Insert identities into the database at `settings.db_path`.
pub(crate) fn seed(settings: &SessionSettings, faces: &[(&str, &[f64])]) {
    let storage = Storage::open(&settings.db_path, &settings.log_path).unwrap();
    for (name, values) in faces {
        storage.faces().insert(name, &Embedding::new(values.to_vec())).unwrap();
    }
    storage.close().unwrap();
}

pub(crate) fn face(values: &[f64]) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox { x: 1, y: 1, width: 4, height: 4 },
        embedding: Embedding::new(values.to_vec()),
    }
}

pub(crate) fn frame(sequence: u32) -> Frame {
    Frame {
        data: vec![120; 8 * 8 * 3],
        width: 8,
        height: 8,
        format: PixelFormat::Rgb,
        sequence,
    }
}

enum Script {
    Finite(usize),
    Endless,
    FailAfter(usize),
}

pub(crate) struct FakeCamera {
    script: Option<Script>,
    open_handles: Arc<AtomicUsize>,
}

impl FakeCamera {
    pub(crate) fn finite(frames: usize) -> Self {
        Self::with_script(Some(Script::Finite(frames)))
    }

    /// Produces frames until stopped, pacing them slightly.
    pub(crate) fn endless() -> Self {
        Self::with_script(Some(Script::Endless))
    }

    pub(crate) fn failing_after(frames: usize) -> Self {
        Self::with_script(Some(Script::FailAfter(frames)))
    }

    pub(crate) fn unavailable() -> Self {
        Self::with_script(None)
    }

    fn with_script(script: Option<Script>) -> Self {
        Self {
            script,
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of streams currently open.
    pub(crate) fn open_handles(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_handles)
    }
}

impl CameraBackend for FakeCamera {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        let (limit, fail) = match self.script {
            None => return Err(CaptureError::Open("no such device".into())),
            Some(Script::Finite(n)) => (Some(n), false),
            Some(Script::Endless) => (None, false),
            Some(Script::FailAfter(n)) => (Some(n), true),
        };
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            produced: 0,
            limit,
            fail,
            handles: Arc::clone(&self.open_handles),
        }))
    }
}

struct FakeSource {
    produced: usize,
    limit: Option<usize>,
    fail: bool,
    handles: Arc<AtomicUsize>,
}

impl FrameSource for FakeSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.limit {
            Some(limit) if self.produced >= limit => {
                if self.fail {
                    return Err(CaptureError::Read("device unplugged".into()));
                }
                return Ok(None);
            }
            None => std::thread::sleep(Duration::from_millis(2)),
            Some(_) => {}
        }
        self.produced += 1;
        Ok(Some(frame(self.produced as u32)))
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeAnalyzer {
    faces: Vec<DetectedFace>,
    dead: bool,
}

impl FakeAnalyzer {
    pub(crate) fn empty() -> Self {
        Self::constant(Vec::new())
    }

    /// Reports the same faces for every image.
    pub(crate) fn constant(faces: Vec<DetectedFace>) -> Self {
        Self { faces, dead: false }
    }

    /// Behaves like a helper process that has exited.
    pub(crate) fn dead() -> Self {
        Self { faces: Vec::new(), dead: true }
    }
}

impl FaceAnalyzer for FakeAnalyzer {
    fn analyze(&mut self, _image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        if self.dead {
            return Err(AnalyzerError::Exited);
        }
        Ok(self.faces.clone())
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    frames: Arc<Mutex<Vec<Vec<FaceAnnotation>>>>,
}

impl RecordingSink {
    pub(crate) fn frames(&self) -> Arc<Mutex<Vec<Vec<FaceAnnotation>>>> {
        Arc::clone(&self.frames)
    }
}

impl FrameSink for RecordingSink {
    fn publish(&mut self, frame: &AnnotatedFrame) {
        self.frames.lock().unwrap().push(frame.faces.clone());
    }
}
