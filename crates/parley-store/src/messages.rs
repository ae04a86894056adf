use rusqlite::OptionalExtension;
use tracing::instrument;

use parley_core::collaborators::MessageHit;
use parley_core::ids::{SessionId, ToolCallId, UserId};
use parley_core::messages::{Message, Role};
use parley_core::tools::ToolOutcome;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const MESSAGE_COLUMNS: &str =
    "m.role, m.content, m.timestamp, m.tool_name, m.tool_call_id, m.tool_arguments, m.tool_result";

/// Append-only message history, ordered per session by `seq`.
#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message and bump the session's `updated_at`.
    /// Returns the assigned sequence number.
    #[instrument(skip(self, message), fields(session_id = %session_id, role = %message.role))]
    pub fn append(&self, session_id: &SessionId, message: &Message) -> Result<i64, StoreError> {
        let tool_arguments = message
            .tool_arguments
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tool_result = message
            .tool_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db.with_conn(|conn| {
            let max_seq: i64 = conn
                .query_row(
                    "SELECT COALESCE((SELECT MAX(seq) FROM messages WHERE session_id = ?1), -1)
                     FROM sessions WHERE id = ?1",
                    [session_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;

            let seq = max_seq + 1;
            conn.execute(
                "INSERT INTO messages (session_id, seq, role, content, timestamp,
                                       tool_name, tool_call_id, tool_arguments, tool_result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    session_id.as_str(),
                    seq,
                    message.role.as_str(),
                    message.content,
                    row_helpers::format_timestamp(&message.timestamp),
                    message.tool_name,
                    message.tool_call_id.as_ref().map(|id| id.as_str()),
                    tool_arguments,
                    tool_result,
                ],
            )?;
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![
                    row_helpers::format_timestamp(&chrono::Utc::now()),
                    session_id.as_str()
                ],
            )?;
            Ok(seq)
        })
    }

    /// Full history of a session in append order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.session_id = ?1 ORDER BY m.seq ASC"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row, 0)?);
            }
            Ok(results)
        })
    }

    /// Case-insensitive substring search over one user's messages,
    /// newest first.
    #[instrument(skip(self, term), fields(user_id = %user_id, limit))]
    pub fn search(
        &self,
        user_id: &UserId,
        term: &str,
        limit: usize,
    ) -> Result<Vec<MessageHit>, StoreError> {
        let pattern = format!("%{}%", row_helpers::escape_like(term));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT m.session_id, {MESSAGE_COLUMNS}
                 FROM messages m JOIN sessions s ON s.id = m.session_id
                 WHERE s.user_id = ?1 AND m.content LIKE ?2 ESCAPE '\\'
                 ORDER BY m.timestamp DESC, m.seq DESC
                 LIMIT ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![user_id.as_str(), pattern, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let session_id: String = row_helpers::get(row, 0, "messages", "session_id")?;
                results.push(MessageHit {
                    session_id: SessionId::from_raw(session_id),
                    message: row_to_message(row, 1)?,
                });
            }
            Ok(results)
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |r| r.get(0),
            )?)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>, base: usize) -> Result<Message, StoreError> {
    let role: String = row_helpers::get(row, base, "messages", "role")?;
    let timestamp: String = row_helpers::get(row, base + 2, "messages", "timestamp")?;
    let tool_call_id: Option<String> =
        row_helpers::get_opt(row, base + 4, "messages", "tool_call_id")?;
    let tool_arguments: Option<String> =
        row_helpers::get_opt(row, base + 5, "messages", "tool_arguments")?;
    let tool_result: Option<String> =
        row_helpers::get_opt(row, base + 6, "messages", "tool_result")?;

    let tool_result = match tool_result {
        Some(raw) => Some(
            serde_json::from_str::<ToolOutcome>(&raw).map_err(|e| StoreError::CorruptRow {
                table: "messages",
                column: "tool_result",
                detail: e.to_string(),
            })?,
        ),
        None => None,
    };

    Ok(Message {
        role: row_helpers::parse_enum::<Role>(&role, "messages", "role")?,
        content: row_helpers::get(row, base + 1, "messages", "content")?,
        timestamp: row_helpers::parse_timestamp(&timestamp, "messages", "timestamp")?,
        tool_name: row_helpers::get_opt(row, base + 3, "messages", "tool_name")?,
        tool_call_id: tool_call_id.map(ToolCallId::from_raw),
        tool_arguments: tool_arguments
            .map(|raw| row_helpers::parse_json(&raw, "messages", "tool_arguments"))
            .transpose()?,
        tool_result,
    })
}
