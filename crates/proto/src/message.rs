//! Control messages sent from the dispatcher to the node.
//!
//! The dispatcher speaks JSON: either a cancel directive `{id, stop:true}`
//! or a full generation request. An empty payload is a keepalive echo.

use serde::{Deserialize, Serialize};

/// One role-tagged turn of the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A generation request as the dispatcher sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Dispatcher-assigned id, unique among this node's active tasks.
    pub id: u32,

    /// System prompt prepended to the dialogue.
    #[serde(default)]
    pub system: String,

    /// Ordered conversation history.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Generation budget in tokens.
    pub max_new_tokens: u32,

    /// Sampling temperature; `0` selects greedy decoding.
    #[serde(default)]
    pub temperature: f32,
}

/// A parsed dispatcher message.
#[derive(Debug, Clone)]
pub enum DispatcherMessage {
    /// Empty payload; nothing to do.
    Keepalive,

    /// Remove the task and release any generation state for it.
    Cancel { id: u32 },

    /// Admit a new generation task.
    Request(Box<GenerationRequest>),
}

/// Shapes a payload can take on the wire. Cancel requires the `stop` field
/// so a generation request never matches it by accident.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireMessage {
    Cancel { id: u32, stop: bool },
    Request(Box<GenerationRequest>),
}

impl DispatcherMessage {
    /// Parse a raw inbound payload.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        if payload.is_empty() {
            return Ok(DispatcherMessage::Keepalive);
        }
        let wire: WireMessage = serde_json::from_slice(payload)?;
        Ok(match wire {
            WireMessage::Cancel { id, stop: _ } => DispatcherMessage::Cancel { id },
            WireMessage::Request(req) => DispatcherMessage::Request(req),
        })
    }
}
