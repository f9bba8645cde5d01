use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("RELAY_PING_INTERVAL_SECS must be shorter than RELAY_PONG_WAIT_SECS")]
    KeepaliveOrder,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay hub is shut down")]
    HubClosed,
    #[error("transport failure: {0}")]
    Transport(#[from] axum::Error),
    #[error("write deadline exceeded")]
    WriteTimeout,
}
