//! relay - annotate a live video source with remote object detections
//!
//! Reads frames from a source, sends one downsampled frame at a time to a
//! DOODS-compatible detector over gRPC, draws the latest detections on every
//! frame, and serves the result as MJPEG on `host:port`.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use detect_relay::config::{ConfigOverrides, RelayConfig};
use detect_relay::pipeline::{Relay, RelaySettings};
use detect_relay::publish::{MjpegPublisher, MjpegServer, MjpegStream};
use detect_relay::{open_source, DetectionClient, GrpcDetectionClient, PayloadFormat, Renderer};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Frame source: stub://name, a file or directory, http(s):// MJPEG/JPEG, or rtsp://.
    source: Option<String>,
    /// Address to serve the annotated stream on, e.g. `:8080` or `127.0.0.1:8080`.
    listen_addr: Option<String>,
    /// Detector address, e.g. `doods:8080`.
    detector_addr: Option<String>,
    /// Detector model name, e.g. `default`.
    detector_name: Option<String>,
    /// JSON config file (also RELAY_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Minimum confidence per label, LABEL=PCT. Repeatable; replaces the defaults.
    #[arg(long = "threshold", value_name = "LABEL=PCT")]
    thresholds: Vec<String>,
    /// Side of the square region cropped for detection.
    #[arg(long)]
    region_size: Option<u32>,
    /// Side of the square image sent to the detector.
    #[arg(long)]
    detect_size: Option<u32>,
    /// Detector payload format: bmp or jpeg.
    #[arg(long)]
    payload_format: Option<PayloadFormat>,
    /// JPEG quality for the published stream (1-100).
    #[arg(long)]
    jpeg_quality: Option<u8>,
    /// TrueType font for captions.
    #[arg(long)]
    font: Option<PathBuf>,
    /// Detector auth key, sent as `session` metadata.
    #[arg(long)]
    auth_key: Option<String>,
    /// Detector dial timeout.
    #[arg(long)]
    connect_timeout_secs: Option<u64>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            source: self.source.clone(),
            listen_addr: self.listen_addr.clone(),
            detector_addr: self.detector_addr.clone(),
            detector_name: self.detector_name.clone(),
            thresholds: self.thresholds.clone(),
            region_size: self.region_size,
            detect_size: self.detect_size,
            payload_format: self.payload_format,
            jpeg_quality: self.jpeg_quality,
            font_path: self.font.clone(),
            auth_key: self.auth_key.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = RelayConfig::load_with(args.config.as_deref(), args.overrides())?;
    let missing = cfg.missing_required();
    if !missing.is_empty() {
        eprintln!("missing: {}\n", missing.join(", "));
        Args::command().print_help()?;
        return Ok(());
    }

    if let Err(err) = run(&cfg) {
        log::error!("relay failed: {:#}", err);
        return Err(err);
    }
    Ok(())
}

fn run(cfg: &RelayConfig) -> Result<()> {
    // missing_required() was empty, so these are all set.
    let (Some(source_location), Some(listen_addr), Some(detector_name)) = (
        cfg.source.as_deref(),
        cfg.listen_addr.as_deref(),
        cfg.detector.name.as_deref(),
    ) else {
        anyhow::bail!("source, listen address and detector name are required");
    };

    let mut source = open_source(source_location)?;
    source
        .connect()
        .with_context(|| format!("error opening frame source {}", source_location))?;

    let renderer = Renderer::from_font_path(cfg.font_path.as_deref())?;
    let client = Arc::new(GrpcDetectionClient::connect(&cfg.grpc_settings()?)?);

    let stream = Arc::new(MjpegStream::new());
    let server = MjpegServer::spawn(listen_addr, stream.clone())?;
    let publisher = MjpegPublisher::new(stream, cfg.jpeg_quality);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("install Ctrl-C handler")?;
    }

    let settings = RelaySettings {
        thresholds: cfg.detector.thresholds.clone(),
        encoder: cfg.encoder(),
        ..RelaySettings::new(detector_name)
    };
    log::info!(
        "detector={} model={} thresholds={:?} payload={} region={} detect_size={}",
        client.endpoint(),
        detector_name,
        settings.thresholds,
        cfg.payload_format,
        cfg.region_size,
        cfg.detect_size
    );
    log::info!("Capturing. Point your browser to {}", server.addr);

    let mut relay = Relay::new(source, client, publisher, renderer, settings);
    let outcome = relay.run(&shutdown);
    server.stop()?;
    outcome.map(|_| ())
}
