//! Error types for artnet2mqtt core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Channel index outside 0..=511
    #[error("invalid channel: {0} (expected 0..=511)")]
    InvalidChannel(u16),

    /// Requested more default channels than a universe holds
    #[error("invalid channel count: {0} (expected at most 512)")]
    InvalidChannelCount(u16),

    /// Payload could not be parsed
    #[error("decode error: {0}")]
    DecodeError(String),

    /// Payload could not be serialized
    #[error("encode error: {0}")]
    EncodeError(String),
}
