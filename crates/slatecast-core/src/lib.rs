//! SlateCast Core - shared types and protocol definitions
//!
//! This crate provides the foundational types used across all SlateCast
//! components: configuration, errors, frame buffers and the wire protocol.

pub mod config;
pub mod error;
pub mod frame;
pub mod protocol;

pub use config::{AudioConfig, CaptureBackend, Codec, CodecPreference, EncoderConfig, PacingMode, QualityMode, ScaleMode, ServerConfig};
pub use error::{Error, Result};
pub use frame::{EncodedFrame, RawFrame};
pub use protocol::InputEvent;
