//! Inbound frame protocol for the `/ws` channel.
//!
//! Every frame is a JSON object with a `type` tag. `ping` is answered with
//! [`PONG`], `flowUpdate` is relayed verbatim, and any other tag is ignored.

use std::sync::Arc;

use serde_json::Value;

pub const TYPE_PING: &str = "ping";
pub const TYPE_FLOW_UPDATE: &str = "flowUpdate";

/// Reply to a `ping`, sent to the originating connection only.
pub const PONG: &str = r#"{"type":"pong"}"#;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no `type` field")]
    MissingType,

    #[error("binary frames are not supported")]
    Binary,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Ping,
    FlowUpdate,
    /// A tag this protocol does not know. Non-string tags land here as their JSON text.
    Unknown(String),
}

impl MessageKind {
    fn from_tag(tag: &Value) -> Self {
        match tag.as_str() {
            Some(TYPE_PING) => Self::Ping,
            Some(TYPE_FLOW_UPDATE) => Self::FlowUpdate,
            Some(other) => Self::Unknown(other.to_owned()),
            None => Self::Unknown(tag.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => TYPE_PING,
            Self::FlowUpdate => TYPE_FLOW_UPDATE,
            Self::Unknown(tag) => tag,
        }
    }
}

/// A decoded frame. Keeps the raw text so relays are byte-for-byte.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub kind: MessageKind,
    raw: Arc<str>,
}

impl InboundMessage {
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(raw)?;
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;
        let tag = object.get("type").ok_or(DecodeError::MissingType)?;

        Ok(Self {
            kind: MessageKind::from_tag(tag),
            raw: Arc::from(raw),
        })
    }

    pub fn into_raw(self) -> Arc<str> {
        self.raw
    }
}
