//! Configuration types for SlateCast

use serde::{Deserialize, Serialize};

/// Rate-control strategy for the video encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QualityMode {
    /// Constant quantization with a rate cap, preset tuned by fps
    #[default]
    Auto,
    /// Constant bitrate, minimal buffering
    LowLatency,
    /// Constant bitrate, balanced quality/latency
    Balanced,
    /// Constant quantization at the configured QP
    HighQuality,
}

impl QualityMode {
    /// Default bitrate in bps for this mode at the given frame rate
    pub fn default_bitrate(&self, fps: u32) -> u32 {
        let base: u64 = match self {
            QualityMode::Auto | QualityMode::HighQuality => 100_000_000,
            QualityMode::LowLatency => 10_000_000,
            QualityMode::Balanced => 20_000_000,
        };
        ((base * fps as u64) / 60) as u32
    }
}

impl std::str::FromStr for QualityMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(QualityMode::Auto),
            "low" => Ok(QualityMode::LowLatency),
            "balanced" => Ok(QualityMode::Balanced),
            "high" => Ok(QualityMode::HighQuality),
            _ => Err(format!("Invalid quality mode: {}. Use: auto, low, balanced, high", s)),
        }
    }
}

/// A concrete codec family the encoder can open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    Av1,
    Hevc,
    H264,
}

impl Codec {
    /// Codec id as carried in the ConfigResponse payload
    pub fn wire_id(&self) -> u8 {
        match self {
            Codec::Av1 => 0,
            Codec::Hevc => 1,
            Codec::H264 => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Av1 => "AV1",
            Codec::Hevc => "HEVC",
            Codec::H264 => "H.264",
        }
    }
}

/// Codec preference from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CodecPreference {
    /// Probe AV1, then HEVC, then H.264
    #[default]
    Auto,
    Av1,
    Hevc,
    H264,
}

impl CodecPreference {
    /// The codec families to probe, in order of preference
    pub fn candidates(&self) -> &'static [Codec] {
        match self {
            CodecPreference::Auto => &[Codec::Av1, Codec::Hevc, Codec::H264],
            CodecPreference::Av1 => &[Codec::Av1],
            CodecPreference::Hevc => &[Codec::Hevc],
            CodecPreference::H264 => &[Codec::H264],
        }
    }
}

impl std::str::FromStr for CodecPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(CodecPreference::Auto),
            "av1" => Ok(CodecPreference::Av1),
            "hevc" | "h265" => Ok(CodecPreference::Hevc),
            "h264" | "avc" => Ok(CodecPreference::H264),
            _ => Err(format!("Invalid codec: {}. Use: auto, av1, hevc, h264", s)),
        }
    }
}

/// Congestion pacing policy for the video sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PacingMode {
    /// Resolve from the receiver's IP range at connect time
    #[default]
    Auto,
    None,
    Light,
    Aggressive,
    /// Only pace keyframes, with size-adaptive sub-tiers
    Keyframe,
}

impl std::str::FromStr for PacingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(PacingMode::Auto),
            "none" => Ok(PacingMode::None),
            "light" => Ok(PacingMode::Light),
            "aggressive" => Ok(PacingMode::Aggressive),
            "keyframe" => Ok(PacingMode::Keyframe),
            _ => Err(format!("Invalid pacing mode: {}. Use: auto, none, light, aggressive, keyframe", s)),
        }
    }
}

/// Capture backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureBackend {
    /// Wayland session -> portal, otherwise X11
    #[default]
    Auto,
    X11,
    Portal,
}

impl std::str::FromStr for CaptureBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(CaptureBackend::Auto),
            "x11" => Ok(CaptureBackend::X11),
            "portal" | "pipewire" | "pw" => Ok(CaptureBackend::Portal),
            _ => Err(format!("Invalid capture backend: {}. Use: auto, x11, portal", s)),
        }
    }
}

/// How normalized tablet coordinates map onto the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleMode {
    /// Preserve aspect ratio, inactive bands along the shorter axis
    #[default]
    Letterbox,
    /// Crop to fill
    Fill,
    /// Distort to fill
    Stretch,
}

/// Audio stream parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// Opus bitrate in bps
    pub bitrate: u32,
    /// Opus frame duration in milliseconds
    pub frame_ms: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
            frame_ms: 10,
        }
    }
}

impl AudioConfig {
    /// Samples per channel in one Opus frame
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Parameters applied when opening the video encoder
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: u32,
    pub gop_size: u32,
    pub quality_mode: QualityMode,
    /// Quantization parameter for CQP modes, 1-51
    pub cqp: u8,
    pub codec: CodecPreference,
}

/// Main server configuration, immutable once the process starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// X11 display hint
    pub display: String,
    pub capture: CaptureBackend,
    pub codec: CodecPreference,
    /// Target frame rate, 1-120
    pub fps: u32,
    /// Video bitrate in bps
    pub bitrate: u32,
    /// Keyframe interval in frames
    pub gop_size: u32,
    pub quality_mode: QualityMode,
    pub cqp: u8,
    pub pacing: PacingMode,

    pub control_port: u16,
    pub video_port: u16,
    pub input_port: u16,
    pub audio_port: u16,

    pub audio_enabled: bool,
    pub audio: AudioConfig,

    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            display: ":0".to_string(),
            capture: CaptureBackend::Auto,
            codec: CodecPreference::Auto,
            fps: 60,
            bitrate: 15_000_000,
            gop_size: 30,
            quality_mode: QualityMode::Auto,
            cqp: 24,
            pacing: PacingMode::Auto,
            control_port: 9500,
            video_port: 9501,
            input_port: 9502,
            audio_port: 9503,
            audio_enabled: true,
            audio: AudioConfig::default(),
            cert_file: "server.crt".to_string(),
            key_file: "server.key".to_string(),
            ca_file: None,
        }
    }
}

impl ServerConfig {
    /// Set the control port and derive video/input/audio ports from it
    pub fn set_base_port(&mut self, port: u16) {
        self.control_port = port;
        self.video_port = port + 1;
        self.input_port = port + 2;
        self.audio_port = port + 3;
    }

    /// Encoder parameters for a capture surface of the given size
    pub fn encoder_config(&self, width: u32, height: u32) -> EncoderConfig {
        EncoderConfig {
            width,
            height,
            framerate: self.fps,
            bitrate: self.bitrate,
            gop_size: self.gop_size,
            quality_mode: self.quality_mode,
            cqp: self.cqp,
            codec: self.codec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ports_follow_control_port() {
        let mut config = ServerConfig::default();
        config.set_base_port(7000);
        assert_eq!(config.control_port, 7000);
        assert_eq!(config.video_port, 7001);
        assert_eq!(config.input_port, 7002);
        assert_eq!(config.audio_port, 7003);
    }

    #[test]
    fn default_bitrate_scales_with_fps() {
        assert_eq!(QualityMode::Balanced.default_bitrate(60), 20_000_000);
        assert_eq!(QualityMode::Balanced.default_bitrate(30), 10_000_000);
        assert_eq!(QualityMode::LowLatency.default_bitrate(120), 20_000_000);
        assert_eq!(QualityMode::Auto.default_bitrate(60), 100_000_000);
    }

    #[test]
    fn codec_probe_order() {
        assert_eq!(
            CodecPreference::Auto.candidates(),
            &[Codec::Av1, Codec::Hevc, Codec::H264]
        );
        assert_eq!(CodecPreference::Hevc.candidates(), &[Codec::Hevc]);
    }

    #[test]
    fn parse_enums_from_cli_strings() {
        assert_eq!("h265".parse::<CodecPreference>().unwrap(), CodecPreference::Hevc);
        assert_eq!("pw".parse::<CaptureBackend>().unwrap(), CaptureBackend::Portal);
        assert_eq!("keyframe".parse::<PacingMode>().unwrap(), PacingMode::Keyframe);
        assert!("fast".parse::<QualityMode>().is_err());
    }
}
