use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::BackendError;
use crate::messages::Message;
use crate::tools::ToolSchema;

/// Raw response body of one generation, chunked arbitrarily by the transport.
pub type RawStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

/// How a backend frames its streaming response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Server-sent events: `data:` lines, blank-line delimited.
    #[default]
    Sse,
    /// One JSON object per line.
    Ndjson,
}

#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
}

/// Trait implemented by each model backend. Backends only open the stream;
/// decoding belongs to the caller.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;
    fn framing(&self) -> Framing;

    async fn generate(&self, request: &GenerateRequest) -> Result<RawStream, BackendError>;
}
