use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvm_transcoder::config::PipelineConfig;
use kvm_transcoder::rtp::RtpPayloader;
use kvm_transcoder::video::capture::{CaptureConfig, CaptureSource, V4lCaptureSource};
use kvm_transcoder::video::encoder::{EncoderConfig, H264Encoder, SoftwareH264Encoder};
use kvm_transcoder::video::format::{PixelFormat, Resolution};
use kvm_transcoder::video::pipeline::{PictureOutput, VideoPipeline, VideoPipelineConfig};

/// Log verbosity for the pipeline.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Captures an HDMI input, encodes it to H.264, and payloads it as RTP.
#[derive(Parser, Debug)]
#[command(name = "kvm-transcoder")]
#[command(version, about = "Low-latency capture -> encode -> RTP transcoding pipeline", long_about = None)]
struct CliArgs {
    /// Path to a TOML config file.
    #[arg(short = 'c', long, value_name = "FILE", default_value = "/etc/kvm-transcoder/pipeline.toml")]
    config: PathBuf,

    /// Capture device (overrides config).
    #[arg(long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Capture width (overrides config).
    #[arg(long)]
    width: Option<u32>,

    /// Capture height (overrides config).
    #[arg(long)]
    height: Option<u32>,

    /// Capture framerate (overrides config).
    #[arg(long)]
    fps: Option<u32>,

    /// Target encoder bitrate in kbps (overrides config).
    #[arg(long)]
    bitrate_kbps: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::default())]
    log_level: LogLevel,

    /// Increase log verbosity (stacks; overrides --log-level).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "kvm_transcoder=error",
        LogLevel::Warn => "kvm_transcoder=warn",
        LogLevel::Info => "kvm_transcoder=info",
        LogLevel::Debug => "kvm_transcoder=debug",
        LogLevel::Trace => "kvm_transcoder=trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

fn build_capture_config(config: &PipelineConfig, args: &CliArgs) -> CaptureConfig {
    let mut capture = CaptureConfig {
        device_path: PathBuf::from(&config.capture.device),
        resolution: Resolution::new(config.capture.width, config.capture.height),
        format: PixelFormat::Jpeg,
        fps: config.capture.fps,
        buffer_count: 2,
    };
    if let Some(device) = &args.device {
        capture.device_path = device.clone();
    }
    if let Some(width) = args.width {
        capture.resolution.width = width;
    }
    if let Some(height) = args.height {
        capture.resolution.height = height;
    }
    if let Some(fps) = args.fps {
        capture.fps = fps;
    }
    capture
}

fn build_encoder_config(config: &PipelineConfig, capture: &CaptureConfig, args: &CliArgs) -> EncoderConfig {
    EncoderConfig {
        resolution: capture.resolution,
        bitrate_kbps: args.bitrate_kbps.unwrap_or(config.encoder.target_kbps),
        fps: capture.fps,
        gop_size: config.encoder.gop_size,
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    let config = match PipelineConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, path = %args.config.display(), "failed to load config");
            std::process::exit(1);
        }
    };

    let capture_config = build_capture_config(&config, &args);
    let encoder_config = build_encoder_config(&config, &capture_config, &args);

    tracing::info!(
        device = %capture_config.device_path.display(),
        resolution = %capture_config.resolution,
        fps = capture_config.fps,
        bitrate_kbps = encoder_config.bitrate_kbps,
        "starting pipeline"
    );

    let payloader = std::sync::Arc::new(parking_lot::Mutex::new(RtpPayloader::new(0)));
    let mtu = config.rtp.mtu;

    let capture_factory_config = capture_config.clone();
    let capture_factory: std::sync::Arc<dyn Fn() -> kvm_transcoder::error::Result<Box<dyn CaptureSource>> + Send + Sync> =
        std::sync::Arc::new(move || {
            let source = V4lCaptureSource::open(&capture_factory_config)?;
            Ok(Box::new(source) as Box<dyn CaptureSource>)
        });

    let encoder_factory_config = encoder_config.clone();
    let encoder_factory: std::sync::Arc<dyn Fn() -> kvm_transcoder::error::Result<Box<dyn H264Encoder>> + Send + Sync> =
        std::sync::Arc::new(move || {
            let encoder = SoftwareH264Encoder::new(encoder_factory_config.clone())?;
            Ok(Box::new(encoder) as Box<dyn H264Encoder>)
        });

    let sink_payloader = payloader.clone();
    let sink: std::sync::Arc<dyn Fn(PictureOutput) + Send + Sync> = std::sync::Arc::new(move |picture| {
        let packets = sink_payloader.lock().wrap_h264(picture.shutter_usec, &picture.data);
        tracing::trace!(
            sequence = picture.sequence,
            keyframe = picture.keyframe,
            packets = packets.len(),
            bytes = picture.data.len(),
            "payloaded picture"
        );
        // Packets are handed off here; the transport that puts them on
        // the wire (WebRTC data channel, plain UDP, ...) is out of scope.
        let _ = (mtu, packets);
    });

    let pipeline_config = VideoPipelineConfig {
        encoder: encoder_config,
        decode_queue_len: 2,
        encode_queue_len: 2,
        app_queue_len: config.stage_queue_depth,
        frame_pool_size: 4,
    };

    let pipeline = VideoPipeline::start(pipeline_config, capture_factory, encoder_factory, sink);

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c, shutting down anyway");
    }

    tracing::info!("shutting down");
    pipeline.shutdown();
}
