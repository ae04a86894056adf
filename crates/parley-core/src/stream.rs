use crate::errors::BackendError;
use crate::messages::ToolCallRequest;

/// Incremental output of one model generation, as decoded from the wire.
///
/// A generation yields `TextDelta | ToolCall` items in arrival order and
/// then exactly one terminal item: `End` or `Error`.
#[derive(Clone, Debug)]
pub enum ModelDelta {
    TextDelta { text: String },
    ToolCall(ToolCallRequest),
    /// Clean end of stream. `skipped_frames` counts malformed frames that
    /// were dropped while decoding.
    End { skipped_frames: u32 },
    Error { error: BackendError },
}

impl ModelDelta {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ToolCallId;

    #[test]
    fn terminal_classification() {
        assert!(ModelDelta::End { skipped_frames: 0 }.is_terminal());
        assert!(ModelDelta::Error {
            error: BackendError::Network("reset".into())
        }
        .is_terminal());
        assert!(!ModelDelta::TextDelta { text: "hi".into() }.is_terminal());
        assert!(!ModelDelta::ToolCall(ToolCallRequest {
            call_id: ToolCallId::new(),
            name: "web_search".into(),
            arguments: serde_json::json!({}),
        })
        .is_terminal());
    }
}
