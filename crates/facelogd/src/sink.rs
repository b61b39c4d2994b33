use facelog_core::frame::encode_data_uri;
use facelog_core::{AnnotatedFrame, FrameSink};
use tokio::sync::mpsc;

/// Encodes frames as data URIs and hands them to the signal task.
///
/// Runs on the session thread, so it never blocks: when the channel is
/// full the frame is dropped.
pub struct SignalSink {
    tx: mpsc::Sender<String>,
}

impl SignalSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

impl FrameSink for SignalSink {
    fn publish(&mut self, frame: &AnnotatedFrame) {
        let uri = match encode_data_uri(&frame.image) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "frame encode failed");
                return;
            }
        };
        match self.tx.try_send(uri) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(seq = frame.sequence, "signal queue full; frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("signal task gone; frame dropped");
            }
        }
    }
}
