use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{Key, Path},
    error::ProtocolDecodeError,
    node::{Node, Response, TAG},
};

const CLIENT_TAGS: [&str; 3] = ["sub", "unsub", "evt"];
const SERVER_TAGS: [&str; 2] = ["up", "evt-res"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$")]
pub enum ClientMessage {
    #[serde(rename = "sub")]
    Subscribe { keys: Vec<Key> },
    #[serde(rename = "unsub")]
    Unsubscribe { keys: Vec<Key> },
    #[serde(rename = "evt")]
    Event {
        /// Correlation id echoed on the matching `evt-res`.
        key: String,
        event: EventEnvelope,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$")]
pub enum ServerMessage {
    #[serde(rename = "up")]
    Update {
        key: Key,
        #[serde(default)]
        val: Node,
    },
    #[serde(rename = "evt-res")]
    EventResponse { key: String, res: Response },
}

/// Interaction fired against a node of the published tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub target: EventTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTarget {
    /// `[storeKey, ...lookupPath]`.
    pub path: Path,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prop_key: Option<String>,
}

impl EventEnvelope {
    pub fn new(path: Path, payload: Value) -> Self {
        Self {
            target: EventTarget {
                path,
                component: None,
                prop_key: None,
            },
            name: None,
            payload,
        }
    }
}

pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolDecodeError> {
    decode_tagged(text, &CLIENT_TAGS)
}

pub fn decode_server_message(text: &str) -> Result<ServerMessage, ProtocolDecodeError> {
    decode_tagged(text, &SERVER_TAGS)
}

pub fn encode_client_message(message: &ClientMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

fn decode_tagged<T: serde::de::DeserializeOwned>(
    text: &str,
    known: &[&str],
) -> Result<T, ProtocolDecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let tag = value
        .get(TAG)
        .and_then(Value::as_str)
        .ok_or(ProtocolDecodeError::MissingTag)?;
    if !known.contains(&tag) {
        return Err(ProtocolDecodeError::UnknownTag(tag.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}
