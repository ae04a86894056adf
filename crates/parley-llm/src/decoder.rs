//! Wire decoding for streamed model output.
//!
//! [`ModelStreamDecoder`] is a push parser: feed it transport chunks in
//! order, then call [`finish`](ModelStreamDecoder::finish) or
//! [`fail`](ModelStreamDecoder::fail). Lines are split on raw bytes before
//! any UTF-8 decoding, so a chunk boundary may fall anywhere, including
//! inside a multi-byte character.
//!
//! Three payload dialects are recognised by shape:
//! - OpenAI chat-completion chunks (`choices[].delta`, `data: [DONE]`)
//! - Anthropic message events (`content_block_*`, `message_stop`)
//! - Workers-AI style objects (`response` text, complete `tool_calls`)

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use parley_core::backend::Framing;
use parley_core::errors::BackendError;
use parley_core::ids::ToolCallId;
use parley_core::messages::ToolCallRequest;
use parley_core::stream::ModelDelta;

const ANTHROPIC_EVENT_TYPES: &[&str] = &[
    "message_start",
    "message_delta",
    "message_stop",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "ping",
    "error",
];

/// A tool call whose arguments are still arriving.
#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

pub struct ModelStreamDecoder {
    framing: Framing,
    buffer: Vec<u8>,
    // SSE event under construction
    sse_data: Option<String>,
    sse_event: Option<String>,
    sse_corrupt: bool,
    // Tool calls keyed by the dialect's block/choice index
    openai_calls: BTreeMap<u64, PartialCall>,
    anthropic_blocks: BTreeMap<u64, PartialCall>,
    skipped: u32,
    finished: bool,
}

impl ModelStreamDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            sse_data: None,
            sse_event: None,
            sse_corrupt: false,
            openai_calls: BTreeMap::new(),
            anthropic_blocks: BTreeMap::new(),
            skipped: 0,
            finished: false,
        }
    }

    /// Malformed frames dropped so far.
    pub fn skipped_frames(&self) -> u32 {
        self.skipped
    }

    /// Whether a terminal delta has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume one transport chunk. Bytes after the terminal frame are ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ModelDelta> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = self.buffer[start..end].to_vec();
            start = end + 1;
            self.handle_line(&line, &mut out);
            if self.finished {
                self.buffer.clear();
                return out;
            }
        }
        self.buffer.drain(..start);
        out
    }

    /// The transport ended cleanly. Flushes any trailing frame and yields
    /// the terminal `End`.
    pub fn finish(&mut self) -> Vec<ModelDelta> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.handle_line(&line, &mut out);
        }
        if !self.finished && self.framing == Framing::Sse {
            self.dispatch_sse_event(&mut out);
        }
        if !self.finished {
            self.finish_into(&mut out);
        }
        out
    }

    /// The transport failed. Incomplete tool calls are discarded.
    pub fn fail(&mut self, error: BackendError) -> Vec<ModelDelta> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        self.openai_calls.clear();
        self.anthropic_blocks.clear();
        vec![ModelDelta::Error { error }]
    }

    fn handle_line(&mut self, raw: &[u8], out: &mut Vec<ModelDelta>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        match self.framing {
            Framing::Ndjson => {
                if raw.iter().all(u8::is_ascii_whitespace) {
                    return;
                }
                match std::str::from_utf8(raw) {
                    Ok(line) => self.handle_payload(line, None, out),
                    Err(_) => self.skipped += 1,
                }
            }
            Framing::Sse => self.handle_sse_line(raw, out),
        }
    }

    fn handle_sse_line(&mut self, raw: &[u8], out: &mut Vec<ModelDelta>) {
        if raw.is_empty() {
            self.dispatch_sse_event(out);
            return;
        }
        if raw[0] == b':' {
            return;
        }
        let Ok(line) = std::str::from_utf8(raw) else {
            self.sse_corrupt = true;
            return;
        };
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => match &mut self.sse_data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.sse_data = Some(value.to_string()),
            },
            "event" => self.sse_event = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch_sse_event(&mut self, out: &mut Vec<ModelDelta>) {
        let event = self.sse_event.take();
        let data = self.sse_data.take();
        if std::mem::take(&mut self.sse_corrupt) {
            self.skipped += 1;
            return;
        }
        if let Some(data) = data {
            self.handle_payload(&data, event.as_deref(), out);
        }
    }

    fn handle_payload(&mut self, data: &str, event: Option<&str>, out: &mut Vec<ModelDelta>) {
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.finish_into(out);
            return;
        }
        let map = match serde_json::from_str::<Value>(data) {
            Ok(Value::Object(map)) => map,
            // Valid JSON of another shape carries nothing for us.
            Ok(_) => return,
            Err(_) => {
                self.skipped += 1;
                return;
            }
        };

        let anthropic_type = map
            .get("type")
            .and_then(Value::as_str)
            .or(event)
            .filter(|t| ANTHROPIC_EVENT_TYPES.contains(t))
            .map(str::to_owned);

        if map.contains_key("choices") {
            self.decode_openai(&map, out);
        } else if let Some(kind) = anthropic_type {
            self.decode_anthropic(&kind, &map, out);
        } else if map.contains_key("response") || map.contains_key("tool_calls") {
            self.decode_workers(&map, out);
        } else if let Some(err) = map.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| err.to_string());
            out.extend(self.fail(BackendError::ServerError {
                status: 500,
                body: message,
            }));
        }
    }

    fn decode_openai(&mut self, map: &Map<String, Value>, out: &mut Vec<ModelDelta>) {
        let Some(choices) = map.get("choices").and_then(Value::as_array) else {
            self.skipped += 1;
            return;
        };
        for choice in choices {
            let delta = choice.get("delta");
            if let Some(text) = delta.and_then(|d| d.get("content")).and_then(Value::as_str) {
                push_text(out, text);
            }
            if let Some(calls) = delta.and_then(|d| d.get("tool_calls")).and_then(Value::as_array) {
                for tc in calls {
                    let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
                    let entry = self.openai_calls.entry(index).or_default();
                    if let Some(id) = tc.get("id").and_then(Value::as_str) {
                        entry.id = Some(id.to_string());
                    }
                    let function = tc.get("function");
                    if let Some(name) = function.and_then(|f| f.get("name")).and_then(Value::as_str) {
                        entry.name.push_str(name);
                    }
                    if let Some(args) = function
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                    {
                        entry.arguments.push_str(args);
                    }
                }
            }
            if choice.get("finish_reason").is_some_and(Value::is_string) {
                let calls = std::mem::take(&mut self.openai_calls);
                self.flush_calls(calls, out);
            }
        }
    }

    fn decode_anthropic(&mut self, kind: &str, map: &Map<String, Value>, out: &mut Vec<ModelDelta>) {
        let index = map.get("index").and_then(Value::as_u64).unwrap_or(0);
        match kind {
            "content_block_start" => {
                let Some(block) = map.get("content_block") else {
                    self.skipped += 1;
                    return;
                };
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let call = PartialCall {
                            id: block.get("id").and_then(Value::as_str).map(str::to_owned),
                            name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            arguments: String::new(),
                        };
                        self.anthropic_blocks.insert(index, call);
                    }
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            push_text(out, text);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let Some(delta) = map.get("delta") else {
                    self.skipped += 1;
                    return;
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            push_text(out, text);
                        }
                    }
                    Some("input_json_delta") => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        match self.anthropic_blocks.get_mut(&index) {
                            Some(block) => block.arguments.push_str(partial),
                            None => self.skipped += 1,
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(call) = self.anthropic_blocks.remove(&index) {
                    self.flush_calls(BTreeMap::from([(index, call)]), out);
                }
            }
            "message_stop" => self.finish_into(out),
            "error" => {
                let error = classify_anthropic_error(map.get("error"));
                out.extend(self.fail(error));
            }
            _ => {}
        }
    }

    fn decode_workers(&mut self, map: &Map<String, Value>, out: &mut Vec<ModelDelta>) {
        if let Some(text) = map.get("response").and_then(Value::as_str) {
            push_text(out, text);
        }
        let Some(calls) = map.get("tool_calls").and_then(Value::as_array) else {
            return;
        };
        for tc in calls {
            let function = tc.get("function");
            let name = tc
                .get("name")
                .or_else(|| function.and_then(|f| f.get("name")))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let arguments = tc
                .get("arguments")
                .or_else(|| function.and_then(|f| f.get("arguments")))
                .cloned()
                .unwrap_or(Value::Null);
            if name.is_empty() {
                self.skipped += 1;
                continue;
            }
            out.push(ModelDelta::ToolCall(ToolCallRequest {
                call_id: tc
                    .get("id")
                    .and_then(Value::as_str)
                    .map(ToolCallId::from_raw)
                    .unwrap_or_default(),
                name: name.to_string(),
                arguments: match arguments {
                    Value::String(raw) => parse_arguments(&raw),
                    Value::Null => Value::Object(Map::new()),
                    other => other,
                },
            }));
        }
    }

    fn flush_calls(&mut self, calls: BTreeMap<u64, PartialCall>, out: &mut Vec<ModelDelta>) {
        for call in calls.into_values() {
            if call.name.is_empty() {
                self.skipped += 1;
                continue;
            }
            out.push(ModelDelta::ToolCall(ToolCallRequest {
                call_id: call.id.map(ToolCallId::from_raw).unwrap_or_default(),
                name: call.name,
                arguments: parse_arguments(&call.arguments),
            }));
        }
    }

    fn finish_into(&mut self, out: &mut Vec<ModelDelta>) {
        let openai = std::mem::take(&mut self.openai_calls);
        self.flush_calls(openai, out);
        let anthropic = std::mem::take(&mut self.anthropic_blocks);
        self.flush_calls(anthropic, out);
        out.push(ModelDelta::End {
            skipped_frames: self.skipped,
        });
        self.finished = true;
    }
}

fn push_text(out: &mut Vec<ModelDelta>, text: &str) {
    if !text.is_empty() {
        out.push(ModelDelta::TextDelta {
            text: text.to_string(),
        });
    }
}

/// Arguments that are not valid JSON are passed through as a string so
/// schema validation reports them to the model instead of dropping the call.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn classify_anthropic_error(error: Option<&Value>) -> BackendError {
    let kind = error
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("stream error")
        .to_string();
    match kind {
        "rate_limit_error" => BackendError::RateLimited { retry_after: None },
        "authentication_error" => BackendError::AuthenticationFailed(message),
        "invalid_request_error" => BackendError::InvalidRequest(message),
        "overloaded_error" => BackendError::ServerError {
            status: 529,
            body: message,
        },
        _ => BackendError::ServerError {
            status: 500,
            body: message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode a whole body delivered in chunks of `size` bytes.
    fn decode_chunked(framing: Framing, body: &[u8], size: usize) -> Vec<ModelDelta> {
        let mut decoder = ModelStreamDecoder::new(framing);
        let mut out = Vec::new();
        for chunk in body.chunks(size) {
            out.extend(decoder.feed(chunk));
        }
        out.extend(decoder.finish());
        out
    }

    fn decode_all(framing: Framing, body: &str) -> Vec<ModelDelta> {
        decode_chunked(framing, body.as_bytes(), body.len().max(1))
    }

    fn render(deltas: &[ModelDelta]) -> Vec<String> {
        deltas
            .iter()
            .map(|d| match d {
                ModelDelta::TextDelta { text } => format!("text:{text}"),
                ModelDelta::ToolCall(call) => {
                    format!("tool:{}:{}:{}", call.call_id, call.name, call.arguments)
                }
                ModelDelta::End { skipped_frames } => format!("end:{skipped_frames}"),
                ModelDelta::Error { error } => format!("error:{}", error.error_kind()),
            })
            .collect()
    }

    fn text_of(deltas: &[ModelDelta]) -> String {
        deltas
            .iter()
            .filter_map(|d| match d {
                ModelDelta::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    const OPENAI_BODY: &str = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hé\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo 🌍\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"type\":\"function\",\"function\":{\"name\":\"web_search\",\"arguments\":\"\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"query\\\":\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"rust\\\"}\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    #[test]
    fn openai_text_and_tool_call() {
        let deltas = decode_all(Framing::Sse, OPENAI_BODY);
        assert_eq!(
            render(&deltas),
            vec![
                "text:Hé".to_string(),
                "text:llo 🌍".to_string(),
                r#"tool:call_a:web_search:{"query":"rust"}"#.to_string(),
                "end:0".to_string(),
            ]
        );
    }

    #[test]
    fn one_byte_chunks_match_contiguous_decode() {
        let anthropic = concat!(
            "event: message_start\r\ndata: {\"type\":\"message_start\",\"message\":{}}\r\n\r\n",
            "event: content_block_delta\r\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"naïve ☕\"}}\r\n\r\n",
            "event: message_stop\r\ndata: {\"type\":\"message_stop\"}\r\n\r\n",
        );
        let workers = concat!(
            "{\"response\":\"日本\"}\n",
            "{\"response\":\"語\"}\n",
            "{\"tool_calls\":[{\"id\":\"call_w\",\"name\":\"storage\",\"arguments\":{\"op\":\"list\"}}]}\n",
        );
        for (framing, body) in [
            (Framing::Sse, OPENAI_BODY),
            (Framing::Sse, anthropic),
            (Framing::Ndjson, workers),
        ] {
            let whole = render(&decode_all(framing, body));
            for size in [1, 2, 3, 7] {
                let split = render(&decode_chunked(framing, body.as_bytes(), size));
                assert_eq!(whole, split, "chunk size {size} diverged");
            }
        }
    }

    #[test]
    fn malformed_frames_are_skipped_and_counted() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {not json\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let deltas = decode_all(Framing::Sse, body);
        assert_eq!(text_of(&deltas), "ab");
        assert!(matches!(deltas.last(), Some(ModelDelta::End { skipped_frames: 1 })));
    }

    #[test]
    fn invalid_utf8_frame_is_skipped() {
        let mut body = b"data: {\"response\":\"ok\"}\n\ndata: ".to_vec();
        body.extend_from_slice(&[0xff, 0xfe]);
        body.extend_from_slice(b"\n\n");
        let deltas = decode_chunked(Framing::Sse, &body, 4);
        assert_eq!(text_of(&deltas), "ok");
        assert!(matches!(deltas.last(), Some(ModelDelta::End { skipped_frames: 1 })));
    }

    #[test]
    fn pings_are_ignored_not_counted() {
        let body = concat!(
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let deltas = decode_all(Framing::Sse, body);
        assert_eq!(render(&deltas), vec!["text:hi", "end:0"]);
    }

    #[test]
    fn anthropic_tool_use_block() {
        let body = concat!(
            "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"analyze_code\",\"input\":{}}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"code\\\":\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"fn main() {}\\\"}\"}}\n\n",
            "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let deltas = decode_all(Framing::Sse, body);
        match &deltas[0] {
            ModelDelta::ToolCall(call) => {
                assert_eq!(call.call_id.as_str(), "toolu_1");
                assert_eq!(call.name, "analyze_code");
                assert_eq!(call.arguments["code"], "fn main() {}");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert!(matches!(deltas[1], ModelDelta::End { .. }));
    }

    #[test]
    fn anthropic_error_event_is_terminal() {
        let body = concat!(
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"par\"}}\n\n",
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"busy\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"tial\"}}\n\n",
        );
        let deltas = decode_all(Framing::Sse, body);
        assert_eq!(render(&deltas), vec!["text:par", "error:server_error"]);
    }

    #[test]
    fn workers_tool_calls_with_string_arguments() {
        let body = "{\"tool_calls\":[{\"name\":\"web_search\",\"arguments\":\"{\\\"query\\\":\\\"tokio\\\"}\"}]}";
        let deltas = decode_all(Framing::Ndjson, body);
        match &deltas[0] {
            ModelDelta::ToolCall(call) => {
                assert!(call.call_id.as_str().starts_with("call_"));
                assert_eq!(call.arguments["query"], "tokio");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert!(matches!(deltas[1], ModelDelta::End { skipped_frames: 0 }));
    }

    #[test]
    fn unparseable_arguments_pass_through_as_string() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"storage\",\"arguments\":\"{oops\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let deltas = decode_all(Framing::Sse, body);
        match &deltas[0] {
            ModelDelta::ToolCall(call) => assert_eq!(call.arguments, Value::String("{oops".into())),
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn eof_without_done_flushes_pending_calls() {
        let body = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"storage\",\"arguments\":\"{}\"}}]}}]}";
        let deltas = decode_all(Framing::Sse, body);
        assert_eq!(render(&deltas), vec!["tool:c1:storage:{}", "end:0"]);
    }

    #[test]
    fn failure_discards_incomplete_calls() {
        let mut decoder = ModelStreamDecoder::new(Framing::Sse);
        let partial = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"storage\",\"arguments\":\"{\"}}]}}]}\n\n";
        assert!(decoder.feed(partial.as_bytes()).is_empty());
        let out = decoder.fail(BackendError::StreamInterrupted("reset".into()));
        assert_eq!(render(&out), vec!["error:stream_interrupted"]);
        assert!(decoder.finish().is_empty());
        assert!(decoder.is_finished());
    }

    #[test]
    fn bytes_after_done_are_ignored() {
        let mut decoder = ModelStreamDecoder::new(Framing::Sse);
        let out = decoder.feed(b"data: [DONE]\n\ndata: {\"response\":\"late\"}\n\n");
        assert_eq!(render(&out), vec!["end:0"]);
        assert!(decoder.feed(b"data: {\"response\":\"later\"}\n\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn multi_line_data_is_joined() {
        let body = "data: {\"response\":\ndata: \"joined\"}\n\n";
        let deltas = decode_all(Framing::Sse, body);
        assert_eq!(text_of(&deltas), "joined");
    }

    #[test]
    fn inline_error_object_fails_stream() {
        let deltas = decode_all(Framing::Ndjson, "{\"error\":{\"message\":\"model overloaded\"}}\n");
        assert_eq!(render(&deltas), vec!["error:server_error"]);
    }
}
