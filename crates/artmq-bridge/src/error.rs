//! Bridge error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("send error: {0}")]
    Send(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("payload error: {0}")]
    Payload(#[from] artmq_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge error: {0}")]
    Other(String),
}
