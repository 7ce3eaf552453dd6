use shared::error::ProtocolDecodeError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection to the model server is closed")]
    Closed,
    #[error("event `{key}` got no response within {millis}ms")]
    Timeout { key: String, millis: u64 },
    #[error("websocket failure: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("invalid server message: {0}")]
    Decode(#[from] ProtocolDecodeError),
    #[error("failed to encode client message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}
