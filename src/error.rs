//! Error types for toolbox-rtc

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid UTF-8 payload: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Frame decode error: {0}")]
    FrameDecode(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
