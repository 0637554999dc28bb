//! Error types for uplink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UplinkError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, UplinkError>;
