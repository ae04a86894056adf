use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};

use parley_core::backend::{Framing, GenerateRequest, ModelBackend, RawStream};
use parley_core::errors::BackendError;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these chunks as the body, verbatim.
    Chunks(Vec<Bytes>),
    /// Yield these chunks, then fail the transport.
    ChunksThenError(Vec<Bytes>, BackendError),
    /// Return an error from the `generate()` call itself.
    Error(BackendError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield these chunks and then never produce another byte.
    Hang(Vec<Bytes>),
}

impl MockResponse {
    /// SSE body of OpenAI chunks streaming `text` word by word.
    pub fn text(text: &str) -> Self {
        let mut frames: Vec<Value> = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let cut = rest
                .char_indices()
                .skip(1)
                .find(|(_, c)| *c == ' ')
                .map_or(rest.len(), |(i, _)| i);
            frames.push(json!({"choices": [{"index": 0, "delta": {"content": &rest[..cut]}}]}));
            rest = &rest[cut..];
        }
        frames.push(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}));
        Self::Chunks(sse_frames(&frames))
    }

    /// SSE body requesting the given tool calls, optionally after some text.
    pub fn tool_calls(text: Option<&str>, calls: &[(&str, &str, Value)]) -> Self {
        let mut frames: Vec<Value> = Vec::new();
        if let Some(text) = text {
            frames.push(json!({"choices": [{"index": 0, "delta": {"content": text}}]}));
        }
        for (index, (id, name, args)) in calls.iter().enumerate() {
            frames.push(json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": index,
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": args.to_string()},
            }]}}]}));
        }
        frames.push(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}));
        Self::Chunks(sse_frames(&frames))
    }

    /// Convenience: a single tool call with no text.
    pub fn tool_call(id: &str, name: &str, args: Value) -> Self {
        Self::tool_calls(None, &[(id, name, args)])
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn sse_frames(frames: &[Value]) -> Vec<Bytes> {
    frames
        .iter()
        .map(|f| Bytes::from(format!("data: {f}\n\n")))
        .chain(std::iter::once(Bytes::from_static(b"data: [DONE]\n\n")))
        .collect()
}

/// Mock backend that returns pre-programmed responses in sequence.
///
/// Once the script is exhausted, the last response repeats if
/// [`repeat_last`](Self::repeat_last) was set; otherwise `generate` fails.
pub struct MockBackend {
    responses: Vec<MockResponse>,
    repeat_last: bool,
    call_count: AtomicUsize,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            repeat_last: false,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A backend that answers every call with `response`.
    pub fn always(response: MockResponse) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(vec![response])
        }
    }

    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn framing(&self) -> Framing {
        Framing::Sse
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<RawStream, BackendError> {
        self.requests.lock().push(request.clone());
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);

        let response = match self.responses.get(idx) {
            Some(r) => r.clone(),
            None if self.repeat_last && !self.responses.is_empty() => {
                self.responses[self.responses.len() - 1].clone()
            }
            None => {
                return Err(BackendError::InvalidRequest(format!(
                    "MockBackend: no response configured for call {idx}"
                )))
            }
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<RawStream, BackendError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Chunks(chunks) => {
                let items = chunks.into_iter().map(Ok::<Bytes, BackendError>);
                return Ok(Box::pin(stream::iter(items)));
            }
            MockResponse::ChunksThenError(chunks, error) => {
                let items = chunks
                    .into_iter()
                    .map(Ok::<Bytes, BackendError>)
                    .chain(std::iter::once(Err(error)));
                return Ok(Box::pin(stream::iter(items)));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Hang(chunks) => {
                let head = stream::iter(chunks.into_iter().map(Ok::<Bytes, BackendError>));
                return Ok(Box::pin(head.chain(stream::pending())));
            }
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::messages::Message;
    use parley_core::stream::ModelDelta;

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "mock-model".into(),
            system_prompt: None,
            messages: vec![Message::user("hi")],
            tools: vec![],
            max_tokens: 16,
        }
    }

    async fn run(backend: &MockBackend) -> Vec<ModelDelta> {
        let raw = backend.generate(&request()).await.unwrap();
        crate::decode(raw, backend.framing()).collect().await
    }

    #[tokio::test]
    async fn text_response_decodes_to_words() {
        let backend = MockBackend::new(vec![MockResponse::text("Hello there world")]);
        let deltas = run(&backend).await;
        let texts: Vec<String> = deltas
            .iter()
            .filter_map(|d| match d {
                ModelDelta::TextDelta { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Hello", " there", " world"]);
        assert!(matches!(deltas.last(), Some(ModelDelta::End { skipped_frames: 0 })));
    }

    #[tokio::test]
    async fn tool_calls_decode_in_order() {
        let backend = MockBackend::new(vec![MockResponse::tool_calls(
            Some("Checking."),
            &[
                ("call_a", "web_search", json!({"query": "a"})),
                ("call_b", "storage", json!({"op": "list"})),
            ],
        )]);
        let deltas = run(&backend).await;
        let names: Vec<&str> = deltas
            .iter()
            .filter_map(|d| match d {
                ModelDelta::ToolCall(c) => Some(c.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["web_search", "storage"]);
        assert!(matches!(&deltas[0], ModelDelta::TextDelta { text } if text == "Checking."));
    }

    #[tokio::test]
    async fn exhausted_script_errors_unless_repeating() {
        let backend = MockBackend::new(vec![MockResponse::text("one")]);
        run(&backend).await;
        assert!(backend.generate(&request()).await.is_err());
        assert_eq!(backend.call_count(), 2);

        let always = MockBackend::always(MockResponse::tool_call("c", "storage", json!({})));
        for _ in 0..5 {
            assert!(always.generate(&request()).await.is_ok());
        }
        assert_eq!(always.requests().len(), 5);
    }

    #[tokio::test]
    async fn chunks_then_error_fails_stream() {
        let backend = MockBackend::new(vec![MockResponse::ChunksThenError(
            vec![Bytes::from_static(b"data: {\"response\":\"par\"}\n\n")],
            BackendError::StreamInterrupted("reset".into()),
        )]);
        let deltas = run(&backend).await;
        assert_eq!(deltas.len(), 2);
        assert!(matches!(deltas[1], ModelDelta::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_honoured() {
        let backend = MockBackend::new(vec![MockResponse::delayed(
            Duration::from_secs(3),
            MockResponse::text("late"),
        )]);
        let start = tokio::time::Instant::now();
        run(&backend).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
