//! Error types for SlateCast

use thiserror::Error;

/// Main error type for SlateCast operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("X11 connection error: {0}")]
    X11Connection(String),

    #[error("X11 extension not available: {0}")]
    X11ExtensionMissing(String),

    #[error("Screen capture failed: {0}")]
    Capture(String),

    #[error("Desktop portal error: {0}")]
    Portal(String),

    #[error("Video encoding error: {0}")]
    Encoder(String),

    #[error("No hardware encoder available on any render device")]
    NoEncoder,

    #[error("Input injection error: {0}")]
    Input(String),

    #[error("Failed to create uinput device: {0}")]
    UinputCreation(String),

    #[error("Control channel error: {0}")]
    Control(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using SlateCast's Error
pub type Result<T> = std::result::Result<T, Error>;
