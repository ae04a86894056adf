use async_trait::async_trait;
use serde_json::{json, Value};

use parley_core::tools::{Tool, ToolContext, ToolError};

const DEFAULT_LIMIT: u64 = 10;
const SNIPPET_CHARS: usize = 300;

/// Searches the caller's own past messages across all their sessions.
pub struct QueryHistoryTool;

#[async_trait]
impl Tool for QueryHistoryTool {
    fn name(&self) -> &str {
        "query_history"
    }

    fn description(&self) -> &str {
        "Search your earlier conversations with this user for messages containing a term"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["term"],
            "additionalProperties": false,
            "properties": {
                "term": {"type": "string", "description": "Text to look for (case-insensitive)"},
                "limit": {"type": "integer", "minimum": 1, "maximum": 50}
            }
        })
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let term = args["term"]
            .as_str()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("term must not be empty".into()))?;
        let limit = args["limit"].as_u64().unwrap_or(DEFAULT_LIMIT).min(50) as usize;

        let hits = ctx
            .records
            .search_messages(&ctx.user_id, term, limit)
            .await
            .map_err(|e| ToolError::InvocationFailed(format!("history unavailable: {e}")))?;

        let matches: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "session_id": hit.session_id,
                    "role": hit.message.role,
                    "timestamp": hit.message.timestamp.to_rfc3339(),
                    "content": snippet(&hit.message.content),
                })
            })
            .collect();

        Ok(json!({"term": term, "count": matches.len(), "matches": matches}))
    }
}

fn snippet(content: &str) -> String {
    match content.char_indices().nth(SNIPPET_CHARS) {
        Some((idx, _)) => format!("{}…", &content[..idx]),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_ctx_for;
    use parley_core::ids::{SessionId, UserId};
    use parley_core::messages::{Message, Session};

    #[test]
    fn snippet_is_char_bounded() {
        assert_eq!(snippet("short"), "short");
        let long = "é".repeat(400);
        let cut = snippet(&long);
        assert_eq!(cut.chars().count(), SNIPPET_CHARS + 1);
    }

    #[tokio::test]
    async fn finds_only_own_messages() {
        let ctx = test_ctx_for("alice");
        let mine = Session::new(SessionId::new(), UserId::from_raw("alice"), "m");
        let theirs = Session::new(SessionId::new(), UserId::from_raw("bob"), "m");
        ctx.records.create_session(&mine).await.unwrap();
        ctx.records.create_session(&theirs).await.unwrap();
        ctx.records
            .append_message(&mine.id, &Message::user("my favourite crate is tokio"))
            .await
            .unwrap();
        ctx.records
            .append_message(&theirs.id, &Message::user("tokio secrets"))
            .await
            .unwrap();

        let out = QueryHistoryTool.invoke(json!({"term": "TOKIO"}), &ctx).await.unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["matches"][0]["session_id"], mine.id.as_str());
        assert_eq!(out["matches"][0]["role"], "user");
    }

    #[tokio::test]
    async fn blank_term_rejected() {
        let err = QueryHistoryTool
            .invoke(json!({"term": "   "}), &test_ctx_for("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
