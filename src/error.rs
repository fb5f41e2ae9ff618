//! Error types for the segue engine
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for the segue engine
#[derive(Error, Debug)]
pub enum Error {
    /// Audio decoding errors (probe, packet read, codec)
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Container or codec not supported by the registered decoder set
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A load was requested while the deck is already loading
    #[error("Deck {deck} is busy loading")]
    Busy { deck: &'static str },

    /// Audio device enumeration, open, or stream errors
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    /// Resampler construction or processing errors
    #[error("Resampling failed: {source_rate}Hz -> {target_rate}Hz: {message}")]
    Resample {
        source_rate: u32,
        target_rate: u32,
        message: String,
    },

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Convenience Result type using the segue Error
pub type Result<T> = std::result::Result<T, Error>;
