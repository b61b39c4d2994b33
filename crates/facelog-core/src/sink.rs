//! Frame sinks: where annotated frames go for display.

use crate::frame::{encode_jpeg, AnnotatedFrame};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Receives annotated frames from the recognition loop.
///
/// Publishing never fails the loop; implementations log their own errors.
pub trait FrameSink: Send {
    fn publish(&mut self, frame: &AnnotatedFrame);
}

/// Discards every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn publish(&mut self, _frame: &AnnotatedFrame) {}
}

/// Forwards at most one frame per interval to the inner sink.
pub struct ThrottledSink<S> {
    inner: S,
    min_interval: Duration,
    last: Option<Instant>,
}

impl<S: FrameSink> ThrottledSink<S> {
    pub fn new(inner: S, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last: None,
        }
    }

    /// Limit to `fps` frames per second. Zero disables throttling.
    pub fn per_second(inner: S, fps: u32) -> Self {
        let min_interval = if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / fps
        };
        Self::new(inner, min_interval)
    }
}

impl<S: FrameSink> FrameSink for ThrottledSink<S> {
    fn publish(&mut self, frame: &AnnotatedFrame) {
        let now = Instant::now();
        if let Some(last) = self.last {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }
        self.last = Some(now);
        self.inner.publish(frame);
    }
}

/// Overwrites a JPEG preview file with the latest frame.
pub struct JpegFileSink {
    path: PathBuf,
}

impl JpegFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FrameSink for JpegFileSink {
    fn publish(&mut self, frame: &AnnotatedFrame) {
        let result = encode_jpeg(&frame.image)
            .map_err(|e| e.to_string())
            .and_then(|jpeg| {
                // Write-then-rename so viewers never see a partial file.
                let tmp = self.path.with_extension("tmp");
                std::fs::write(&tmp, jpeg)
                    .and_then(|_| std::fs::rename(&tmp, &self.path))
                    .map_err(|e| e.to_string())
            });
        if let Err(error) = result {
            tracing::warn!(path = %self.path.display(), error = %error, "failed to write preview frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[derive(Default)]
    struct CountingSink(usize);

    impl FrameSink for CountingSink {
        fn publish(&mut self, _frame: &AnnotatedFrame) {
            self.0 += 1;
        }
    }

    fn frame() -> AnnotatedFrame {
        AnnotatedFrame {
            image: RgbImage::new(4, 4),
            faces: Vec::new(),
            sequence: 0,
        }
    }

    #[test]
    fn test_throttle_drops_bursts() {
        let mut sink = ThrottledSink::new(CountingSink::default(), Duration::from_secs(3600));
        for _ in 0..10 {
            sink.publish(&frame());
        }
        assert_eq!(sink.inner.0, 1);
    }

    #[test]
    fn test_zero_fps_passes_everything() {
        let mut sink = ThrottledSink::per_second(CountingSink::default(), 0);
        for _ in 0..5 {
            sink.publish(&frame());
        }
        assert_eq!(sink.inner.0, 5);
    }

    #[test]
    fn test_interval_elapses() {
        let mut sink = ThrottledSink::new(CountingSink::default(), Duration::from_millis(5));
        sink.publish(&frame());
        std::thread::sleep(Duration::from_millis(20));
        sink.publish(&frame());
        assert_eq!(sink.inner.0, 2);
    }

    #[test]
    fn test_jpeg_file_sink_writes_preview() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        JpegFileSink::new(&path).publish(&frame());
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
