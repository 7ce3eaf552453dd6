use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Validation,
    Timeout,
    Internal,
}

/// Serializable error carried in the payload of failed responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolDecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no `$` tag")]
    MissingTag,
    #[error("unrecognized message tag `{0}`")]
    UnknownTag(String),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("unknown node tag `{0}`")]
    UnknownTag(String),
    #[error("node tag must be a string")]
    NonStringTag,
    #[error("invalid `{tag}` node: {source}")]
    Invalid {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}
