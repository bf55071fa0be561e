//! SlateCast - stream a Linux desktop to a tablet as a second display
//!
//! The server captures the local screen, encodes it on the GPU and streams
//! it over UDP with a TCP control sideband, while touch, stylus and
//! keyboard events from the tablet are injected back through uinput.

mod session;

use anyhow::{Context, Result};
use clap::Parser;
use session::Session;
use slatecast_core::{CaptureBackend, CodecPreference, PacingMode, QualityMode, ServerConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// SlateCast - use your tablet as an extended display
#[derive(Parser, Debug)]
#[command(name = "slatecast")]
#[command(version, about, long_about = None)]
struct Args {
    /// X11 display to capture
    #[arg(short, long, default_value = ":0")]
    display: String,

    /// Capture backend: auto, x11, portal
    #[arg(short, long, default_value = "auto")]
    capture: CaptureBackend,

    /// Video codec: auto, av1, hevc, h264
    #[arg(short, long, default_value = "auto")]
    encoder: CodecPreference,

    /// Target frame rate, 1-120
    #[arg(short, long, default_value = "60")]
    fps: u32,

    /// Video bitrate in bps (derived from fps and quality when omitted)
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Keyframe interval in frames (default: fps/2)
    #[arg(short, long)]
    gop: Option<u32>,

    /// Quality mode: auto, low, balanced, high
    #[arg(short, long, default_value = "auto")]
    quality: QualityMode,

    /// CQP quality value for auto/high modes, 1-51
    #[arg(short = 'Q', long, default_value = "24")]
    cqp: u8,

    /// Pacing mode: auto, none, light, aggressive, keyframe
    #[arg(short = 'P', long, default_value = "auto")]
    pacing: PacingMode,

    /// Control port; video, input and audio bind the three ports above it
    #[arg(short, long, default_value = "9500")]
    port: u16,

    /// Disable audio streaming
    #[arg(short = 'A', long)]
    no_audio: bool,

    /// Audio bitrate in bps, 16000-510000
    #[arg(short = 'a', long, default_value = "128000")]
    audio_bitrate: u32,

    /// TLS certificate file for the control channel
    #[arg(long, default_value = "server.crt")]
    cert: String,

    /// TLS private key file for the control channel
    #[arg(long, default_value = "server.key")]
    key: String,

    /// CA bundle for client certificate verification
    #[arg(long)]
    ca: Option<String>,

    /// Enable info logging (use -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = build_config(&args);

    // Startup banner, printed regardless of verbosity
    println!("SlateCast Server v{}", env!("CARGO_PKG_VERSION"));
    print!(
        "Codec: {:?} | Quality: {:?}",
        config.codec, config.quality_mode
    );
    if matches!(config.quality_mode, QualityMode::Auto | QualityMode::HighQuality) {
        print!(" (CQP: {})", config.cqp);
    }
    print!(" | {} FPS | Port: {}", config.fps, config.control_port);
    if config.audio_enabled {
        print!(" | Audio: {}kbps", config.audio.bitrate / 1000);
    } else {
        print!(" | Audio: off");
    }
    println!();
    println!("Waiting for connection... (use -v for detailed logs)");

    let running = Arc::new(AtomicBool::new(true));
    install_signal_handler(running.clone())?;

    let mut session = Session::new(config, running).context("initialization failed")?;
    session.run();

    Ok(())
}

fn build_config(args: &Args) -> ServerConfig {
    let mut config = ServerConfig {
        display: args.display.clone(),
        capture: args.capture,
        codec: args.encoder,
        fps: args.fps.clamp(1, 120),
        quality_mode: args.quality,
        cqp: args.cqp.clamp(1, 51),
        audio_enabled: !args.no_audio,
        cert_file: args.cert.clone(),
        key_file: args.key.clone(),
        ca_file: args.ca.clone(),
        ..ServerConfig::default()
    };
    config.set_base_port(args.port);

    config.bitrate = args
        .bitrate
        .unwrap_or_else(|| config.quality_mode.default_bitrate(config.fps));
    config.gop_size = args.gop.unwrap_or(config.fps / 2).max(1);
    config.audio.bitrate = args.audio_bitrate.clamp(16_000, 510_000);

    // Quality auto pairs with keyframe-only pacing unless overridden
    config.pacing = match (args.pacing, config.quality_mode) {
        (PacingMode::Auto, QualityMode::Auto) => PacingMode::Keyframe,
        (pacing, _) => pacing,
    };

    config
}

/// First SIGINT/SIGTERM requests a graceful stop; the second one exits
/// immediately (file descriptors close, which destroys the uinput devices).
fn install_signal_handler(running: Arc<AtomicBool>) -> Result<()> {
    let mut signals_seen = 0u32;
    ctrlc::set_handler(move || {
        signals_seen += 1;
        if signals_seen == 1 {
            eprintln!("Shutting down...");
            running.store(false, Ordering::SeqCst);
        } else {
            eprintln!("Forcing exit");
            std::process::exit(0);
        }
    })
    .context("failed to install signal handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["slatecast"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn port_flag_derives_the_other_three() {
        let config = build_config(&args(&["--port", "8000"]));
        assert_eq!(config.control_port, 8000);
        assert_eq!(config.video_port, 8001);
        assert_eq!(config.input_port, 8002);
        assert_eq!(config.audio_port, 8003);
    }

    #[test]
    fn fps_and_cqp_are_clamped() {
        let config = build_config(&args(&["--fps", "500", "--cqp", "99"]));
        assert_eq!(config.fps, 120);
        assert_eq!(config.cqp, 51);
    }

    #[test]
    fn gop_defaults_to_half_the_frame_rate() {
        let config = build_config(&args(&["--fps", "60"]));
        assert_eq!(config.gop_size, 30);

        let config = build_config(&args(&["--fps", "1"]));
        assert_eq!(config.gop_size, 1);
    }

    #[test]
    fn bitrate_is_derived_unless_given() {
        let config = build_config(&args(&["--quality", "balanced", "--fps", "60"]));
        assert_eq!(config.bitrate, 20_000_000);

        let config = build_config(&args(&["--bitrate", "5000000"]));
        assert_eq!(config.bitrate, 5_000_000);
    }

    #[test]
    fn auto_quality_defaults_to_keyframe_pacing() {
        let config = build_config(&args(&[]));
        assert_eq!(config.pacing, PacingMode::Keyframe);

        let config = build_config(&args(&["--pacing", "light"]));
        assert_eq!(config.pacing, PacingMode::Light);

        let config = build_config(&args(&["--quality", "balanced"]));
        assert_eq!(config.pacing, PacingMode::Auto);
    }

    #[test]
    fn audio_bitrate_is_clamped_to_opus_range() {
        let config = build_config(&args(&["--audio-bitrate", "1000"]));
        assert_eq!(config.audio.bitrate, 16_000);

        let config = build_config(&args(&["--audio-bitrate", "600000"]));
        assert_eq!(config.audio.bitrate, 510_000);
    }

    #[test]
    fn no_audio_flag_disables_audio() {
        assert!(!build_config(&args(&["--no-audio"])).audio_enabled);
        assert!(build_config(&args(&[])).audio_enabled);
    }
}
