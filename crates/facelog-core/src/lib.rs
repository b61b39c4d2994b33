//! facelog-core — Face recognition attendance logging.
//!
//! Matches face encodings from an external analyzer against an enrolled
//! registry in SQLite, logs recognized identities with a per-identity
//! dedup window, and enrolls new identities from the live camera loop.

pub mod analyzer;
pub mod config;
pub mod controller;
pub mod enroll;
pub mod frame;
pub mod import;
pub mod session;
pub mod sink;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use analyzer::{AnalyzerError, CommandAnalyzer, FaceAnalyzer};
pub use config::Config;
pub use controller::{ControllerError, SessionController, SessionFactory, SessionStatus};
pub use enroll::{EnrollError, EnrollmentController, NameError};
pub use frame::{AnnotatedFrame, FaceAnnotation, Frame, FrameError, PixelFormat};
pub use session::{
    CameraBackend, CaptureError, EnrollRequest, FrameSource, RecognitionSession, SessionError,
    SessionSettings, SessionSummary, StopReason,
};
pub use sink::{FrameSink, JpegFileSink, NullSink, ThrottledSink};
pub use store::{FaceStore, RecognitionEvent, RecognitionLog, Storage, StorageError};
pub use types::{BoundingBox, DetectedFace, Embedding, EuclideanMatcher, Identification, Matcher, Registry};
