use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, ToolCallId, UserId};
use crate::tools::ToolOutcome;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One entry of a session's history.
///
/// `content` is final once appended: streaming deltas never reach history,
/// only the coalesced text of a completed turn does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<ToolCallId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_arguments: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolOutcome>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text.into())
    }

    /// Tool message pairing a request with its outcome. `content` is the
    /// text form the model sees on the next generation.
    pub fn tool(call: &ToolCallRequest, outcome: ToolOutcome, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            timestamp: Utc::now(),
            tool_name: Some(call.name.clone()),
            tool_call_id: Some(call.call_id.clone()),
            tool_arguments: Some(call.arguments.clone()),
            tool_result: Some(outcome),
        }
    }

    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
            tool_name: None,
            tool_call_id: None,
            tool_arguments: None,
            tool_result: None,
        }
    }

    pub fn is_tool(&self) -> bool {
        self.role == Role::Tool
    }
}

/// A tool invocation requested by the model during a turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Persistent conversation metadata. History itself lives with the
/// session's actor and the record store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, user_id: UserId, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            model: model.into(),
            created_at: now,
            updated_at: now,
        }
    }
}
