use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use parley_core::tools::{Tool, ToolContext, ToolError};

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const MAX_KEY_LEN: usize = 200;

/// Text notes kept per user in the blob store. A user can only reach keys
/// under their own namespace.
pub struct StorageTool;

fn namespace(ctx: &ToolContext) -> String {
    format!("users/{}/files/", ctx.user_id)
}

fn validate_key(key: &str) -> Result<(), ToolError> {
    let ok = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/'));
    if ok {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments(format!(
            "invalid key {key:?}: use letters, digits, '-', '_', '.' and '/' separated segments"
        )))
    }
}

fn storage_error(e: impl std::fmt::Display) -> ToolError {
    ToolError::InvocationFailed(format!("storage unavailable: {e}"))
}

#[async_trait]
impl Tool for StorageTool {
    fn name(&self) -> &str {
        "storage"
    }

    fn description(&self) -> &str {
        "Save, read and list short text notes that persist across conversations"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["op"],
            "additionalProperties": false,
            "properties": {
                "op": {"type": "string", "enum": ["put", "get", "list"]},
                "key": {"type": "string", "description": "Note name, required for put and get"},
                "content": {"type": "string", "description": "Note text, required for put"},
                "prefix": {"type": "string", "description": "Filter for list"}
            }
        })
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let ns = namespace(ctx);
        let key_arg = || {
            args["key"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("key is required".into()))
                .and_then(|k| validate_key(k).map(|()| k))
        };

        match args["op"].as_str() {
            Some("put") => {
                let key = key_arg()?;
                let content = args["content"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidArguments("content is required for put".into()))?;
                ctx.blobs
                    .put(
                        &format!("{ns}{key}"),
                        TEXT_CONTENT_TYPE,
                        Bytes::copy_from_slice(content.as_bytes()),
                    )
                    .await
                    .map_err(storage_error)?;
                Ok(json!({"key": key, "bytes": content.len()}))
            }
            Some("get") => {
                let key = key_arg()?;
                let blob = ctx
                    .blobs
                    .get(&format!("{ns}{key}"))
                    .await
                    .map_err(storage_error)?
                    .ok_or_else(|| ToolError::NotFound(format!("no note named {key}")))?;
                let content = String::from_utf8(blob.data.to_vec())
                    .map_err(|_| ToolError::InvocationFailed(format!("{key} is not text")))?;
                Ok(json!({"key": key, "content": content}))
            }
            Some("list") => {
                let prefix = args["prefix"].as_str().unwrap_or("");
                let keys: Vec<String> = ctx
                    .blobs
                    .list(&format!("{ns}{prefix}"))
                    .await
                    .map_err(storage_error)?
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&ns).map(str::to_owned))
                    .collect();
                Ok(json!({"keys": keys}))
            }
            other => Err(ToolError::InvalidArguments(format!("unknown op {other:?}"))),
        }
    }
}
