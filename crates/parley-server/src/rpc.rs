//! WebSocket control frames. Event envelopes travel on the same socket
//! unchanged; control frames never carry a `seq`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_core::ids::{SessionId, TurnId};
use parley_core::messages::Message;
use parley_engine::EngineError;

pub const INVALID_FRAME: &str = "INVALID_FRAME";
pub const RATE_LIMITED: &str = "RATE_LIMITED";
pub const TURN_IN_PROGRESS: &str = "TURN_IN_PROGRESS";
pub const SESSION_CLOSED: &str = "SESSION_CLOSED";
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
pub const RESUME_FAILED: &str = "RESUME_FAILED";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Submit {
        text: String,
        #[serde(default)]
        model: Option<String>,
        /// Echoed back on the `ack` or `error` for this submit.
        #[serde(default)]
        request_id: Option<Value>,
    },
    History,
    Resume {
        after: u64,
    },
    Ping,
}

/// Control frames the server sends besides event envelopes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack {
        turn_id: TurnId,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
    },
    History {
        session_id: SessionId,
        messages: Vec<Message>,
    },
    Pong,
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: Option<Value>) -> Self {
        match &mut self {
            Self::Ack { request_id, .. } | Self::Error { request_id, .. } => *request_id = id,
            Self::History { .. } | Self::Pong => {}
        }
        self
    }

    pub fn from_engine_error(err: &EngineError) -> Self {
        let code = match err {
            EngineError::TurnInProgress(_) => TURN_IN_PROGRESS,
            EngineError::SessionClosed(_) => SESSION_CLOSED,
            EngineError::SessionNotFound(_) => SESSION_NOT_FOUND,
            EngineError::Store(_) | EngineError::Internal(_) => INTERNAL_ERROR,
        };
        Self::error(code, err.to_string())
    }
}

/// Parse one inbound text frame, or the error frame to answer it with.
pub fn parse_frame(raw: &str) -> Result<ClientFrame, ServerFrame> {
    serde_json::from_str(raw).map_err(|e| ServerFrame::error(INVALID_FRAME, format!("invalid frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_submit() {
        let frame = parse_frame(r#"{"type":"submit","text":"hi","request_id":7}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Submit {
                text: "hi".into(),
                model: None,
                request_id: Some(json!(7)),
            }
        );
    }

    #[test]
    fn parse_simple_frames() {
        assert_eq!(parse_frame(r#"{"type":"ping"}"#).unwrap(), ClientFrame::Ping);
        assert_eq!(parse_frame(r#"{"type":"history"}"#).unwrap(), ClientFrame::History);
        assert_eq!(
            parse_frame(r#"{"type":"resume","after":12}"#).unwrap(),
            ClientFrame::Resume { after: 12 }
        );
    }

    #[test]
    fn bad_frames_yield_error_frames() {
        for raw in ["not json", r#"{"type":"dance"}"#, r#"{"type":"submit"}"#] {
            let ServerFrame::Error { code, .. } = parse_frame(raw).unwrap_err() else {
                panic!("expected error frame for {raw}");
            };
            assert_eq!(code, INVALID_FRAME);
        }
    }

    #[test]
    fn serialize_control_frames() {
        let ack = ServerFrame::Ack {
            turn_id: TurnId::from_raw("turn_1"),
            request_id: None,
        }
        .with_request_id(Some(json!("r1")));
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "ack", "turn_id": "turn_1", "request_id": "r1"})
        );
        assert_eq!(serde_json::to_value(ServerFrame::Pong).unwrap(), json!({"type": "pong"}));

        let err = ServerFrame::from_engine_error(&EngineError::TurnInProgress("s".into()));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], TURN_IN_PROGRESS);
        assert!(value.get("seq").is_none());
    }
}
