use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{BlobStore, RecordStore};
use crate::ids::{SessionId, ToolCallId, UserId};

/// Context available to tools during execution. Tools reach collaborators
/// only through this, never through process globals.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub call_id: ToolCallId,
    pub blobs: Arc<dyn BlobStore>,
    pub records: Arc<dyn RecordStore>,
    pub cancel: CancellationToken,
}

/// Tool definition advertised to the model backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Result classification surfaced to observers and to the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidArguments,
    NotFound,
    Timeout,
    InvocationError,
    Cancelled,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArguments => "invalid_arguments",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::InvocationError => "invocation_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one tool call: a JSON payload or a classified error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok { payload: serde_json::Value },
    Error { kind: ToolErrorKind, message: String },
}

impl ToolOutcome {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self::Ok { payload }
    }

    pub fn error(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        match self {
            Self::Error { kind, .. } => Some(*kind),
            Self::Ok { .. } => None,
        }
    }
}

impl From<ToolError> for ToolOutcome {
    fn from(e: ToolError) -> Self {
        Self::error(e.kind(), e.to_string())
    }
}

/// Trait implemented by each tool. Implementations must not share mutable
/// targets with other tools: calls within one round run concurrently.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invocation failed: {0}")]
    InvocationFailed(String),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::InvalidArguments(_) => ToolErrorKind::InvalidArguments,
            Self::NotFound(_) => ToolErrorKind::NotFound,
            Self::Timeout(_) => ToolErrorKind::Timeout,
            Self::InvocationFailed(_) => ToolErrorKind::InvocationError,
            Self::Cancelled => ToolErrorKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_with_status_tag() {
        let ok = ToolOutcome::ok(serde_json::json!({"hits": 3}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["payload"]["hits"], 3);

        let err = ToolOutcome::error(ToolErrorKind::InvalidArguments, "missing query");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "invalid_arguments");
        assert_eq!(json["message"], "missing query");
    }

    #[test]
    fn tool_error_maps_to_kind() {
        assert_eq!(
            ToolError::Timeout(Duration::from_secs(30)).kind(),
            ToolErrorKind::Timeout
        );
        assert_eq!(
            ToolError::InvocationFailed("boom".into()).kind(),
            ToolErrorKind::InvocationError
        );
        let outcome: ToolOutcome = ToolError::NotFound("nope".into()).into();
        assert_eq!(outcome.error_kind(), Some(ToolErrorKind::NotFound));
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::InvalidArguments("query: expected string".into());
        assert_eq!(err.to_string(), "invalid arguments: query: expected string");
        assert!(ToolError::Timeout(Duration::from_secs(30)).to_string().contains("30"));
    }

    #[test]
    fn kind_strings_match_serde() {
        for kind in [
            ToolErrorKind::InvalidArguments,
            ToolErrorKind::NotFound,
            ToolErrorKind::Timeout,
            ToolErrorKind::InvocationError,
            ToolErrorKind::Cancelled,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
    }
}
