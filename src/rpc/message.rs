//! Wire messages exchanged with a worker.
//!
//! # Outbound
//!
//! | `type`        | Fields                     |
//! |---------------|----------------------------|
//! | `new_session` | optional `parentSession`   |
//! | `get_state`   | —                          |
//! | `prompt`      | `message`                  |
//! | `abort`       | —                          |
//!
//! Every outbound command also carries a string `id` used for correlation.
//!
//! # Inbound
//!
//! Objects with `type: "response"` answer a command. Anything else is an
//! unsolicited event; `extension_ui_request` means the worker is blocked on
//! external input.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{AppError, Result};

/// Inbound `type` tag for command responses.
pub const RESPONSE_TYPE: &str = "response";

/// Inbound `type` tag signalling the worker needs external input.
pub const EXTENSION_UI_REQUEST_TYPE: &str = "extension_ui_request";

/// Commands understood by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcCommand {
    /// Start a fresh conversation inside the worker.
    NewSession {
        /// Optional session to branch from.
        #[serde(rename = "parentSession", skip_serializing_if = "Option::is_none")]
        parent_session: Option<String>,
    },
    /// Query streaming / queue state.
    GetState,
    /// Deliver a user message.
    Prompt {
        /// Prompt text.
        message: String,
    },
    /// Cancel the current turn.
    Abort,
}

impl RpcCommand {
    /// Wire name of the command (`type` field).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewSession { .. } => "new_session",
            Self::GetState => "get_state",
            Self::Prompt { .. } => "prompt",
            Self::Abort => "abort",
        }
    }

    /// Serialise the command into a JSON object without an `id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] if serialisation fails.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self)
            .map_err(|e| AppError::Rpc(format!("failed to serialise {} command: {e}", self.name())))
    }
}

/// A `type: "response"` message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RpcResponse {
    /// Correlation id copied from the request.
    pub id: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Command name the worker believes it answered.
    pub command: String,
    /// Command-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// Convert a failed response into an error, returning `data` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] carrying the worker's error text when
    /// `success` is false.
    pub fn into_data(self) -> Result<Option<Value>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(AppError::Rpc(format!(
                "{} failed: {}",
                self.command,
                self.error.as_deref().unwrap_or("no error message")
            )))
        }
    }
}

/// Closed classification of every inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Well-formed command response.
    Response(RpcResponse),
    /// The worker is waiting on an external UI interaction.
    ExtensionUiRequest(Value),
    /// Any other message, keyed by its `type` (or `"unknown"`).
    Event {
        /// Value of the `type` field.
        kind: String,
        /// Full message body.
        payload: Value,
    },
}

impl InboundMessage {
    /// The message's `type` tag.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Response(_) => RESPONSE_TYPE,
            Self::ExtensionUiRequest(_) => EXTENSION_UI_REQUEST_TYPE,
            Self::Event { kind, .. } => kind,
        }
    }
}

/// Classify a decoded inbound value.
///
/// A `response` missing any of its required fields (`id`, `success`,
/// `command`) is downgraded to a plain event so it can never resolve a
/// pending request.
#[must_use]
pub fn classify(value: Value) -> InboundMessage {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();

    match kind.as_str() {
        RESPONSE_TYPE => match serde_json::from_value::<RpcResponse>(value.clone()) {
            Ok(response) => InboundMessage::Response(response),
            Err(err) => {
                warn!(error = %err, "rpc: response missing required fields, treating as event");
                InboundMessage::Event {
                    kind,
                    payload: value,
                }
            }
        },
        EXTENSION_UI_REQUEST_TYPE => InboundMessage::ExtensionUiRequest(value),
        _ => InboundMessage::Event {
            kind,
            payload: value,
        },
    }
}

/// Worker state reported by `get_state`.
///
/// Both idle-relevant fields are required; a state payload without them is a
/// failed query, never an implicit "idle".
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkerState {
    /// A response is currently being generated.
    #[serde(rename = "isStreaming")]
    pub is_streaming: bool,
    /// Messages queued behind the current turn.
    #[serde(rename = "pendingMessageCount")]
    pub pending_message_count: u64,
    /// Remaining fields, preserved for callers.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkerState {
    /// Parse the `data` payload of a `get_state` response.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] if `data` is absent or lacks the required
    /// fields.
    pub fn from_data(data: Option<Value>) -> Result<Self> {
        let data = data.ok_or_else(|| AppError::Rpc("get_state response has no data".into()))?;
        serde_json::from_value(data)
            .map_err(|e| AppError::Rpc(format!("get_state data malformed: {e}")))
    }

    /// Not streaming and nothing queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.is_streaming && self.pending_message_count == 0
    }
}
