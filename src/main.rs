//! multicam: composite several live cameras into one MJPEG stream

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use multicam::capture::{self, SourceId};
use multicam::detect::{EventSink, LogSink, MotionDetector};
use multicam::transport::MjpegWriter;
use multicam::{BackendKind, Config, StreamController};

#[derive(Debug, Parser)]
#[command(name = "multicam", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "MULTICAM_CONFIG")]
    config: Option<PathBuf>,

    /// Camera index or URI; repeat for more cameras
    #[arg(short, long = "source")]
    sources: Vec<SourceId>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Run the built-in motion detector on every source
    #[arg(long)]
    motion: bool,

    /// Write composites to this file as a multipart MJPEG stream
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seconds between status log lines
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if !self.sources.is_empty() {
            config.stream.sources = self.sources.clone();
        }
        if let Some(width) = self.width {
            config.stream.width = width;
        }
        if let Some(height) = self.height {
            config.stream.height = height;
        }
        if let Some(fps) = self.fps {
            config.stream.fps = fps;
        }
        if let Some(backend) = self.backend {
            config.capture.backend = backend;
        }
    }
}

fn event_sink(config: &Config) -> Result<Arc<dyn EventSink>> {
    #[cfg(feature = "mqtt")]
    if let Some(mqtt) = &config.events.mqtt {
        info!("Publishing detections to {}:{} on {}", mqtt.host, mqtt.port, mqtt.topic);
        return Ok(Arc::new(multicam::detect::MqttSink::connect(mqtt)?));
    }

    if config.events.mqtt.is_some() {
        warn!("MQTT publisher configured but not compiled in; logging detections instead");
    }
    Ok(Arc::new(LogSink))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("multicam=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("multicam launching...");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let backend = capture::backend_for(config.capture.backend)?;
    let mut controller = StreamController::new(config.clone(), backend)?;
    if args.motion {
        controller = controller.with_detector(Arc::new(MotionDetector::default()), event_sink(&config)?)?;
    }
    let controller = Arc::new(controller);

    let status = {
        let controller = Arc::clone(&controller);
        tokio::task::spawn_blocking(move || controller.start_stream()).await??
    };
    info!(
        "Streaming {} sources at {}x{} @ {} FPS",
        status.active_sources.len(),
        status.width,
        status.height,
        status.fps
    );

    let writer = args.output.clone().map(|path| {
        let output = controller.output();
        tokio::spawn(async move {
            let mut file = match tokio::fs::File::create(&path).await {
                Ok(file) => file,
                Err(e) => {
                    error!("Cannot create {}: {}", path.display(), e);
                    return;
                }
            };
            info!("Writing MJPEG stream to {}", path.display());

            while let Ok(composite) = output.recv_async().await {
                let mut part = MjpegWriter::new(Vec::with_capacity(composite.jpeg.len() + 96));
                if let Err(e) = part.write_part(&composite.jpeg) {
                    error!("Failed to frame composite: {}", e);
                    continue;
                }
                if let Err(e) = file.write_all(&part.into_inner()).await {
                    error!("Failed to write composite: {}", e);
                    break;
                }
            }
        })
    });

    let ticker = {
        let controller = Arc::clone(&controller);
        let period = Duration::from_secs(args.status_interval.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match serde_json::to_string(&controller.status()) {
                    Ok(status) => info!("Status: {}", status),
                    Err(e) => warn!("Cannot serialize status: {}", e),
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping stream");

    ticker.abort();
    if let Some(writer) = writer {
        writer.abort();
    }
    {
        let controller = Arc::clone(&controller);
        tokio::task::spawn_blocking(move || controller.stop_stream()).await??;
    }

    info!("multicam shutting down");
    Ok(())
}
