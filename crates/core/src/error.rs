use thiserror::Error;

use crate::types::ClientOrderId;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("Config error: {0}")]
    Config(String),

    /// Signing material absent or malformed. Fatal at startup.
    #[error("Auth config error: {0}")]
    AuthConfig(String),

    /// Network failure or timeout; the outcome of the request is unknown.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The venue answered and refused the request.
    #[error("Venue rejected request: {0}")]
    VenueRejection(String),

    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    #[error("Duplicate client order id: {0}")]
    DuplicateOrder(ClientOrderId),

    /// Rejected locally before anything was sent to the venue.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Network-level failures that the transport may retry and the
    /// reconciler resolves by polling.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Http(_))
    }

    /// Errors that abort initialization.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Error::Config(_) | Error::AuthConfig(_))
    }
}
