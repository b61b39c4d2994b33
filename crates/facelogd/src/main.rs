use anyhow::Result;
use facelog_core::{
    CommandAnalyzer, Config, RecognitionSession, SessionController, SessionError, SessionFactory,
    ThrottledSink,
};
use facelog_hw::V4lCamera;
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod sink;

use dbus_interface::{SessionService, BUS_NAME, OBJECT_PATH};
use sink::SignalSink;

/// Encoded frames waiting for the signal task.
const FRAME_QUEUE: usize = 2;

fn session_factory(config: Config, frames: mpsc::Sender<String>) -> SessionFactory {
    Box::new(move || -> Result<RecognitionSession, SessionError> {
        let camera = V4lCamera::new(
            config.camera_device(),
            config.frame_width,
            config.frame_height,
        );
        let analyzer = CommandAnalyzer::spawn(&config.analyzer_cmd)?;
        let sink = ThrottledSink::per_second(SignalSink::new(frames.clone()), config.sink_fps);
        Ok(RecognitionSession::new(
            config.session_settings(),
            Box::new(camera),
            Box::new(analyzer),
            Box::new(sink),
        ))
    })
}

/// Resolves with the signal name on Ctrl-C (SIGINT) or SIGTERM.
///
/// The SIGTERM handler is installed before this returns, so a service
/// manager stop that arrives before the future is polled is not lost.
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    let mut term = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => "SIGINT",
                Err(e) => {
                    tracing::warn!(error = %e, "cannot listen for Ctrl-C; waiting for SIGTERM");
                    term.recv().await;
                    "SIGTERM"
                }
            },
            _ = term.recv() => "SIGTERM",
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facelogd starting");

    let shutdown = shutdown_signal()?;
    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device(),
        db = %config.db_path.display(),
        log = %config.log_path.display(),
        analyzer = %config.analyzer_cmd,
        tolerance = config.tolerance,
        buffer_secs = config.buffer_secs,
        "configuration loaded"
    );

    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(FRAME_QUEUE);
    let controller = Arc::new(SessionController::new(session_factory(config, frame_tx)));

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, SessionService::new(Arc::clone(&controller)))?
        .build()
        .await?;

    let iface = conn
        .object_server()
        .interface::<_, SessionService>(OBJECT_PATH)
        .await?;
    let forwarder = tokio::spawn(async move {
        while let Some(uri) = frame_rx.recv().await {
            if let Err(e) = SessionService::frame(iface.signal_emitter(), &uri).await {
                tracing::debug!(error = %e, "failed to emit frame signal");
            }
        }
    });

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facelogd ready");

    let received = shutdown.await;
    tracing::info!(signal = received, "facelogd shutting down");

    match controller.stop().await {
        Ok(Some(summary)) => tracing::info!(reason = ?summary.reason, stats = ?summary.stats, "session stopped"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "session ended with error"),
    }
    forwarder.abort();

    Ok(())
}
