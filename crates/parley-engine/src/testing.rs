//! Shared fixtures for unit tests in this crate.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use parley_core::events::StreamEvent;
use parley_core::ids::{SessionId, ToolCallId, UserId};
use parley_core::tools::{Tool, ToolContext, ToolError};
use parley_store::{Database, SqliteBlobStore, SqliteRecordStore};

pub(crate) fn test_ctx() -> ToolContext {
    test_ctx_for("tester")
}

pub(crate) fn test_ctx_for(user: &str) -> ToolContext {
    let db = Database::in_memory().unwrap();
    ToolContext {
        session_id: SessionId::new(),
        user_id: UserId::from_raw(user),
        call_id: ToolCallId::new(),
        blobs: Arc::new(SqliteBlobStore::new(db.clone())),
        records: Arc::new(SqliteRecordStore::new(db)),
        cancel: CancellationToken::new(),
    }
}

pub(crate) fn memory_stores() -> (Arc<SqliteRecordStore>, Arc<SqliteBlobStore>) {
    let db = Database::in_memory().unwrap();
    (
        Arc::new(SqliteRecordStore::new(db.clone())),
        Arc::new(SqliteBlobStore::new(db)),
    )
}

/// Collects emitted events for assertions.
#[derive(Default, Clone)]
pub(crate) struct Recorder {
    pub events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl Recorder {
    pub fn snapshot(&self) -> Vec<StreamEvent> {
        self.events.lock().clone()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event_type()).collect()
    }
}

/// Returns its `text` argument as the payload.
pub(crate) struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the text back"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["text"],
            "properties": {"text": {"type": "string"}}
        })
    }
    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Ok(args["text"].clone())
    }
}
