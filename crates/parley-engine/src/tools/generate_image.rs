use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::debug;

use parley_core::tools::{Tool, ToolContext, ToolError};

const IMAGE_CONTENT_TYPE: &str = "image/png";

/// Generates an image through an OpenAI-compatible images endpoint and
/// stores the PNG in the blob store. The model only ever sees the key.
pub struct GenerateImageTool {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
}

impl GenerateImageTool {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        model: impl Into<String>,
    ) -> Self {
        let client = super::http_client("generate_image", Duration::from_secs(120), "Parley/1.0");
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        }
    }
}

pub fn image_key(ctx: &ToolContext) -> String {
    format!("users/{}/images/{}.png", ctx.user_id, ctx.call_id)
}

#[async_trait]
impl Tool for GenerateImageTool {
    fn name(&self) -> &str {
        "generate_image"
    }

    fn description(&self) -> &str {
        "Generate an image from a text prompt. Returns the storage key of the PNG"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["prompt"],
            "additionalProperties": false,
            "properties": {
                "prompt": {"type": "string", "description": "What to draw"},
                "size": {
                    "type": "string",
                    "enum": ["1024x1024", "1024x1536", "1536x1024"],
                    "description": "Image dimensions (default 1024x1024)"
                }
            }
        })
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let prompt = args["prompt"]
            .as_str()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("prompt must not be empty".into()))?;
        let size = args["size"].as_str().unwrap_or("1024x1024");

        let api_key = self.api_key.as_ref().ok_or_else(|| {
            ToolError::InvocationFailed("image generation is not configured: missing API key".into())
        })?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key.expose_secret())
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "size": size,
                "n": 1,
            }))
            .send()
            .await
            .map_err(|e| ToolError::InvocationFailed(format!("image request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::InvocationFailed(format!(
                "image generation failed: HTTP {status}: {body}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::InvocationFailed(format!("failed to parse response: {e}")))?;
        let encoded = body["data"][0]["b64_json"]
            .as_str()
            .ok_or_else(|| ToolError::InvocationFailed("response carried no image data".into()))?;
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| ToolError::InvocationFailed(format!("invalid image encoding: {e}")))?;

        let key = image_key(ctx);
        let size_bytes = data.len();
        ctx.blobs
            .put(&key, IMAGE_CONTENT_TYPE, Bytes::from(data))
            .await
            .map_err(|e| ToolError::InvocationFailed(format!("failed to store image: {e}")))?;
        debug!(key = %key, bytes = size_bytes, "stored generated image");

        Ok(json!({
            "key": key,
            "content_type": IMAGE_CONTENT_TYPE,
            "bytes": size_bytes,
        }))
    }
}
