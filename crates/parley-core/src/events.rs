use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, ToolCallId, TurnId};
use crate::tools::ToolOutcome;

/// Why a turn ended without completing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    TransportError,
    TurnTimeout,
    SessionClosed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportError => "transport_error",
            Self::TurnTimeout => "turn_timeout",
            Self::SessionClosed => "session_closed",
        }
    }
}

/// Observer-facing events for one turn.
///
/// Per turn, exactly one terminal event (`Done` or `Error`) is emitted and
/// it is the last event of that turn. Every `ToolResult` follows the
/// `ToolStarted` with the same `call_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_started")]
    ToolStarted { call_id: ToolCallId, name: String },

    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: ToolCallId,
        name: String,
        result: ToolOutcome,
        duration_ms: u64,
    },

    #[serde(rename = "done")]
    TurnComplete {
        rounds: u32,
        bound_exceeded: bool,
        skipped_frames: u32,
    },

    #[serde(rename = "error")]
    TurnFailed {
        reason: FailureReason,
        message: String,
    },
}

/// Wire `type` values understood by this version. Clients skip others.
pub const KNOWN_EVENT_TYPES: &[&str] = &["text", "tool_started", "tool_result", "done", "error"];

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete { .. } | Self::TurnFailed { .. })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolResult { .. } => "tool_result",
            Self::TurnComplete { .. } => "done",
            Self::TurnFailed { .. } => "error",
        }
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Self::TurnFailed {
            reason,
            message: message.into(),
        }
    }
}

/// A sequenced event as delivered to observers.
///
/// `seq` is assigned by the session's hub and increases by one per
/// published event, across turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub session_id: SessionId,
    pub turn_id: TurnId,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl EventEnvelope {
    /// Parse a wire frame. Frames with an unrecognized `type` yield
    /// `Ok(None)` so newer servers can add event kinds.
    pub fn parse(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let known = value
            .get("type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| KNOWN_EVENT_TYPES.contains(&t));
        if !known {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }
}
