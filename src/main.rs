//! CLI Entry Point for aquarium-stream
//!
//! Provides command-line access to the dashboard's camera plumbing:
//! - Listing cameras and backend status
//! - Watching one camera's live stream (with reconnects)
//! - Running a wall of all active cameras
//! - Capturing stills through the pause/capture/resume workflow
//!
//! # Usage
//!
//! ```bash
//! aquarium-stream devices
//! aquarium-stream watch --device 0 --save latest.jpg
//! aquarium-stream watch --device 0 --mock --frames 20
//! aquarium-stream --backend 192.168.1.20:8000 capture
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use aquarium_stream::address::resolve_address;
use aquarium_stream::capture::{CaptureError, CaptureWorkflow};
use aquarium_stream::client::BackendClient;
use aquarium_stream::config::{AppConfig, DEFAULT_CONFIG_PATH};
use aquarium_stream::connection::{ConnectionState, DisplaySurface, Phase, StreamConnection};
use aquarium_stream::logging::{self, LogSettings};
use aquarium_stream::transport::mock::MockTransport;
use aquarium_stream::transport::{build_transport, DeviceId, Frame, FrameTransport, TransportKind};
use aquarium_stream::wall::StreamWall;

#[derive(Parser)]
#[command(name = "aquarium-stream")]
#[command(about = "Live camera streams for the aquarium dashboard", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Backend URL (overrides config file and AQUARIUM_BACKEND_URL)
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cameras known to the backend
    Devices,

    /// Show backend health and the latest status summary
    Status,

    /// Watch one camera's live stream
    Watch(WatchArgs),

    /// Stream every active camera, following the device list
    Streams,

    /// Capture a still from active cameras
    Capture {
        /// Only this device
        #[arg(long)]
        device: Option<u32>,
    },
}

#[derive(Args)]
struct WatchArgs {
    /// Device index
    #[arg(long, default_value_t = 0)]
    device: u32,

    /// Use synthetic frames instead of the backend
    #[arg(long)]
    mock: bool,

    /// Override the configured transport
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    /// Write every received frame to this file
    #[arg(long)]
    save: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Socket,
    Polling,
}

impl From<TransportArg> for TransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Socket => Self::Socket,
            TransportArg::Polling => Self::Polling,
        }
    }
}

/// Prints status changes and optionally saves frames.
struct ConsoleSurface {
    device: DeviceId,
    save: Option<PathBuf>,
    frames: Arc<AtomicU64>,
}

impl ConsoleSurface {
    fn new(device: DeviceId) -> Self {
        Self {
            device,
            save: None,
            frames: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl DisplaySurface for ConsoleSurface {
    fn show_frame(&mut self, frame: &Frame) {
        let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(path) = &self.save {
            if let Err(e) = std::fs::write(path, &frame.data) {
                warn!(path = %path.display(), error = %e, "Failed to save frame");
            }
        }
        tracing::debug!(device = %self.device, count, bytes = frame.data.len(), "Frame");
    }

    fn show_status(&mut self, state: &ConnectionState) {
        println!("cam{}: {}", self.device, state.status_text());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(LogSettings::from_config(&config)?.with_verbosity(cli.verbose))?;

    let address = resolve_address(cli.backend.as_deref(), config.backend.url.as_deref());
    info!(backend = %address, source = address.source().label(), "Using backend");
    let client = BackendClient::new(address, config.backend.request_timeout())?;

    match cli.command {
        Commands::Devices => list_devices(&client).await,
        Commands::Status => show_status(&client).await,
        Commands::Watch(args) => watch(&config, &client, args).await,
        Commands::Streams => streams(&config, &client).await,
        Commands::Capture { device } => capture(&config, &client, device).await,
    }
}

async fn list_devices(client: &BackendClient) -> Result<()> {
    let devices = client.list_devices().await?;
    if devices.is_empty() {
        println!("No cameras found");
    }
    for device in devices {
        let state = if device.active { "active" } else { "inactive" };
        println!("cam{}  {:<16} {}", device.index, device.name, state);
    }
    Ok(())
}

async fn show_status(client: &BackendClient) -> Result<()> {
    let healthy = client.healthcheck().await?;
    println!("Backend: {}", if healthy { "ok" } else { "unhealthy" });

    let status = client.status().await?;
    if let Some(image) = &status.latest_image {
        println!("Latest image: {} ({}x{})", image.filepath, image.width, image.height);
    }
    for alert in &status.alerts {
        println!("Alert: {alert}");
    }
    Ok(())
}

async fn watch(config: &AppConfig, client: &BackendClient, args: WatchArgs) -> Result<()> {
    let transport: Arc<dyn FrameTransport> = if args.mock {
        Arc::new(MockTransport::generating(config.stream.poll_interval()))
    } else {
        let mut stream = config.stream.clone();
        if let Some(kind) = args.transport {
            stream.transport = kind.into();
        }
        build_transport(&stream, client.address(), client.http().clone())
    };

    let device = DeviceId::from(args.device);
    let mut surface = ConsoleSurface::new(device.clone());
    surface.save = args.save;
    let frames = Arc::clone(&surface.frames);

    let mut conn = StreamConnection::new(
        device.clone(),
        transport,
        config.connection(),
        tokio::runtime::Handle::current(),
    )
    .with_backoff(config.retry.backoff.clone())
    .with_surface(surface);
    conn.open(device);

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = conn.process_next() => {
                if conn.phase() == Phase::Failed {
                    bail!("{}", conn.status_text());
                }
                if args.frames.is_some_and(|limit| frames.load(Ordering::Relaxed) >= limit) {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                println!("\nStopping...");
                break;
            }
        }
    }

    conn.close();
    println!("Received {} frames", frames.load(Ordering::Relaxed));
    Ok(())
}

async fn streams(config: &AppConfig, client: &BackendClient) -> Result<()> {
    let transport = build_transport(&config.stream, client.address(), client.http().clone());
    let mut wall = StreamWall::new(
        transport,
        config.connection(),
        tokio::runtime::Handle::current(),
    )
    .with_backoff(Arc::new(config.retry.backoff.clone()))
    .with_surfaces(|info| {
        Box::new(ConsoleSurface::new(DeviceId::from(info.index))) as Box<dyn DisplaySurface>
    });

    let mut refresh = tokio::time::interval(config.stream.device_refresh());
    let mut frame_tick = tokio::time::interval(Duration::from_millis(50));
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = refresh.tick() => match client.list_devices().await {
                Ok(devices) => {
                    wall.sync_devices(&devices);
                }
                Err(e) => warn!(error = %e, "Failed to refresh device list"),
            },
            _ = frame_tick.tick() => {
                wall.poll();
            }
            _ = &mut ctrl_c => {
                println!("\nStopping...");
                break;
            }
        }
    }

    wall.clear();
    Ok(())
}

async fn capture(config: &AppConfig, client: &BackendClient, device: Option<u32>) -> Result<()> {
    let mut devices = client.list_devices().await?;
    if let Some(index) = device {
        devices.retain(|d| d.index == index);
        if devices.is_empty() {
            bail!("Unknown device {index}");
        }
    }

    // Hold the streams the way the dashboard does so the capture has to pause them
    let transport = build_transport(&config.stream, client.address(), client.http().clone());
    let mut wall = StreamWall::new(
        transport,
        config.connection(),
        tokio::runtime::Handle::current(),
    );
    wall.sync_devices(&devices);

    let workflow = CaptureWorkflow::new(client.clone(), config.capture.settle());
    match workflow.capture_active(&devices, &mut wall).await {
        Ok(report) => {
            for (index, record) in report.succeeded() {
                println!("cam{index}: saved {} ({} bytes)", record.filepath, record.file_size);
            }
            for (index, err) in report.failed() {
                println!("cam{index}: failed: {err}");
            }
            Ok(())
        }
        Err(CaptureError::AllFailed { failures }) => {
            for (index, err) in &failures {
                println!("cam{index}: failed: {err}");
            }
            bail!("Failed to capture images from all devices")
        }
        Err(e) => Err(e.into()),
    }
}
