//! Error types for the trade-lifecycle manager.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store API error: {message}")]
    StoreApi {
        message: String,
        status: Option<u16>,
    },

    #[error("Broker API error: {message}")]
    BrokerApi {
        message: String,
        status: Option<u16>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
