//! facelog-hw — V4L2 webcam capture for the recognition loop.

pub mod camera;

pub use camera::{Camera, CameraError, DeviceInfo, CaptureReport, V4lCamera};
