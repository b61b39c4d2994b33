use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facelog_core::import::import_folder;
use facelog_core::{
    CommandAnalyzer, Config, ControllerError, FrameSink, JpegFileSink, NameError, NullSink,
    RecognitionSession, SessionController, SessionError, Storage, ThrottledSink,
};
use facelog_hw::{Camera, V4lCamera};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

// `#[zbus::proxy]` generates `Session1Proxy` (async) and `Session1ProxyBlocking`.
#[zbus::proxy(
    interface = "org.facelog.Session1",
    default_service = "org.facelog.Session1",
    default_path = "/org/facelog/Session1"
)]
trait Session1 {
    async fn start(&self, label: &str, minutes: u32) -> zbus::Result<()>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn enroll(&self, name: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facelog", about = "Face recognition attendance logging")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a recognition session in the daemon
    Start {
        /// Session label (e.g., a class or meeting name)
        label: String,
        /// Stop automatically after this many minutes (0 = until stopped)
        #[arg(short, long, default_value_t = 0)]
        minutes: u32,
    },
    /// Stop the daemon's recognition session
    Stop,
    /// Show daemon session status
    Status,
    /// Enroll the next unknown face seen by the daemon's session
    Enroll {
        /// Name to store for the face
        name: String,
    },
    /// Run a session in the foreground, reading enrollment names from stdin
    Run {
        /// Session label
        label: String,
        /// Stop automatically after this many minutes
        #[arg(short, long)]
        minutes: Option<u64>,
        /// Keep the latest annotated frame in this JPEG file
        #[arg(long)]
        preview: Option<PathBuf>,
    },
    /// Store every face found in a folder of images under one name
    Import {
        /// Name to store the faces under
        #[arg(short, long)]
        name: String,
        /// Folder of .jpg/.jpeg/.png images
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Show the most recent recognition events
    Log {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List video capture devices
    Cameras,
    /// Read frames from a camera for a few seconds
    TestCamera {
        /// Device index (opens /dev/video<N>)
        #[arg(short, long, default_value_t = 0)]
        index: u32,
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Start { label, minutes } => {
            let proxy = daemon().await?;
            proxy.start(&label, minutes).await?;
            if minutes > 0 {
                println!("Session '{label}' started for {minutes} minute(s)");
            } else {
                println!("Session '{label}' started");
            }
        }
        Commands::Stop => {
            let proxy = daemon().await?;
            if proxy.stop().await? {
                println!("Session stopped");
            } else {
                println!("No session running");
            }
        }
        Commands::Status => {
            let proxy = daemon().await?;
            let status = proxy.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Enroll { name } => {
            let proxy = daemon().await?;
            let stored = proxy.enroll(&name).await?;
            println!("Enrolled {stored}");
        }
        Commands::Run {
            label,
            minutes,
            preview,
        } => {
            run_foreground(config, &label, minutes.map(|m| Duration::from_secs(m * 60)), preview)
                .await?;
        }
        Commands::Import { name, dir } => {
            let storage = Storage::open(&config.db_path, &config.log_path)?;
            let mut analyzer = CommandAnalyzer::spawn(&config.analyzer_cmd)?;
            let report = import_folder(&storage, &mut analyzer, &dir, &name)?;
            for path in &report.no_face {
                println!("No faces found in {}", path.display());
            }
            for path in &report.failed {
                println!("Could not read {}", path.display());
            }
            println!("Stored {} encoding(s) for {name}", report.stored);
        }
        Commands::List => {
            let storage = Storage::open(&config.db_path, &config.log_path)?;
            let names = storage.faces().names()?;
            if names.is_empty() {
                println!("No faces enrolled");
            }
            for (name, count) in names {
                println!("{name:<24} {count} encoding(s)");
            }
        }
        Commands::Log { limit } => {
            let storage = Storage::open(&config.db_path, &config.log_path)?;
            for event in storage.log().recent(limit)? {
                println!("{} - {}", event.timestamp.format("%Y-%m-%d %H:%M:%S"), event.name);
            }
        }
        Commands::Cameras => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::TestCamera { index, seconds } => {
            let path = format!("/dev/video{index}");
            let mut camera = Camera::open(&path, config.frame_width, config.frame_height)
                .with_context(|| format!("cannot open camera at index {index}"))?;
            println!(
                "Opened {path}: {}x{} {:?}",
                camera.width, camera.height, camera.fourcc
            );
            let report = camera.sample(Duration::from_secs(seconds));
            println!(
                "Captured {} frame(s) in {:.1}s ({:.1} fps)",
                report.frames,
                report.elapsed.as_secs_f64(),
                report.fps()
            );
            if report.dark > 0 || report.undecodable > 0 {
                println!(
                    "{} dark frame(s), {} undecodable frame(s)",
                    report.dark, report.undecodable
                );
            }
            if let Some(err) = report.error {
                anyhow::bail!("capture failed: {err}");
            }
        }
    }

    Ok(())
}

async fn daemon() -> Result<Session1Proxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    Ok(Session1Proxy::new(&conn).await?)
}

/// Name typed at the enrollment prompt. A blank line is rejected here so
/// the operator is told why nothing happened.
fn prompted_name(line: &str) -> Result<&str, NameError> {
    let name = line.trim();
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    Ok(name)
}

async fn run_foreground(
    config: Config,
    label: &str,
    duration: Option<Duration>,
    preview: Option<PathBuf>,
) -> Result<()> {
    let factory = Box::new(move || -> Result<RecognitionSession, SessionError> {
        let camera = V4lCamera::new(
            config.camera_device(),
            config.frame_width,
            config.frame_height,
        );
        let analyzer = CommandAnalyzer::spawn(&config.analyzer_cmd)?;
        let sink: Box<dyn FrameSink> = match &preview {
            Some(path) => Box::new(ThrottledSink::per_second(
                JpegFileSink::new(path.clone()),
                config.sink_fps,
            )),
            None => Box::new(NullSink),
        };
        Ok(RecognitionSession::new(
            config.session_settings(),
            Box::new(camera),
            Box::new(analyzer),
            sink,
        ))
    });
    let controller = SessionController::new(factory);
    tracing::debug!(label, ?duration, "starting foreground session");
    controller.start(label, duration).await?;

    println!("Session '{label}' running. Type a name and press Enter to enroll the unknown face in view; Ctrl-C to stop.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut tick = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                if !controller.is_running().await {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                let name = match prompted_name(&line) {
                    Ok(name) => name,
                    Err(e) => {
                        println!("{e}. Enter a name to try again.");
                        continue;
                    }
                };
                match controller.enroll(name).await {
                    Ok(stored) => println!("Enrolled {stored}"),
                    Err(ControllerError::Enroll(e)) if e.is_recoverable() => {
                        println!("{e}. Enter a name to try again.");
                    }
                    Err(ControllerError::NotRunning) => break,
                    Err(e) => {
                        eprintln!("Enrollment failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    match controller.stop().await? {
        Some(summary) => println!(
            "Session ended ({:?}): {} frame(s), {} face(s), {} logged, {} enrolled",
            summary.reason,
            summary.stats.frames,
            summary.stats.faces,
            summary.stats.logged,
            summary.stats.enrolled
        ),
        None => println!("Session ended"),
    }
    Ok(())
}
