use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_core::backend::{GenerateRequest, ModelBackend};
use parley_core::collaborators::{BlobStore, RecordStore};
use parley_core::events::{FailureReason, StreamEvent};
use parley_core::ids::{SessionId, ToolCallId, TurnId, UserId};
use parley_core::messages::{Message, ToolCallRequest};
use parley_core::stream::ModelDelta;
use parley_core::tools::{ToolContext, ToolOutcome};
use parley_llm::ModelStream;

use crate::registry::{self, ToolRegistry};

pub const DEFAULT_MAX_ROUNDS: u32 = 3;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

/// Receives the non-terminal events of a turn as they happen.
pub trait TurnSink: Send + Sync {
    fn emit(&self, event: StreamEvent);
}

#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub system_prompt: Option<String>,
    /// Tool round trips allowed per turn.
    pub max_rounds: u32,
    pub max_output_tokens: u32,
    pub stream_idle_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            stream_idle_timeout: parley_llm::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Everything one turn needs besides the loop itself.
pub struct TurnInput {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub turn_id: TurnId,
    pub model: String,
    /// History up to and including the user message that started the turn.
    pub history: Vec<Message>,
    pub blobs: Arc<dyn BlobStore>,
    pub records: Arc<dyn RecordStore>,
    pub cancel: CancellationToken,
    pub rounds: RoundLog,
}

/// Tool messages of the rounds a turn has finished, shared with the caller
/// so they survive the turn future being dropped on timeout or close.
#[derive(Clone, Default)]
pub struct RoundLog {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl RoundLog {
    fn record(&self, messages: &[Message]) {
        self.messages.lock().extend_from_slice(messages);
    }

    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }
}

/// Result of a turn: messages to commit, in order, and the terminal event.
#[derive(Debug)]
pub struct TurnOutcome {
    pub messages: Vec<Message>,
    pub terminal: StreamEvent,
}

impl TurnOutcome {
    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            terminal: StreamEvent::failed(reason, message),
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }
}

enum LoopState {
    Generating,
    AwaitingTools(Vec<ToolCallRequest>),
    Complete { bound_exceeded: bool },
    Failed { reason: FailureReason, message: String },
}

/// What one model call produced.
struct Generation {
    text: String,
    calls: Vec<ToolCallRequest>,
    skipped_frames: u32,
}

/// Drives the model and the tools for a single turn:
/// `Generating -> AwaitingTools -> Generating -> ... -> Complete | Failed`.
pub struct ToolCallLoop {
    backend: Arc<dyn ModelBackend>,
    registry: Arc<ToolRegistry>,
    config: LoopConfig,
}

impl ToolCallLoop {
    pub fn new(backend: Arc<dyn ModelBackend>, registry: Arc<ToolRegistry>, config: LoopConfig) -> Self {
        Self {
            backend,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run one turn to its terminal state. Text and tool events go to
    /// `sink` as they happen; the terminal event is returned, not emitted,
    /// so the caller can publish it together with the history commit.
    #[instrument(skip_all, fields(session_id = %input.session_id, turn_id = %input.turn_id, model = %input.model))]
    pub async fn run(&self, input: TurnInput, sink: &dyn TurnSink) -> TurnOutcome {
        let mut committed: Vec<Message> = Vec::new();
        // What the model sees within this turn: committed messages plus the
        // text it produced alongside each round's tool calls.
        let mut context: Vec<Message> = Vec::new();
        let mut text = String::new();
        let mut rounds = 0u32;
        let mut skipped_frames = 0u32;
        let mut seen_ids: HashSet<ToolCallId> = HashSet::new();
        let mut state = LoopState::Generating;

        loop {
            state = match state {
                LoopState::Generating => match self.generate(&input, &context, sink).await {
                    Ok(generation) => {
                        text.push_str(&generation.text);
                        skipped_frames += generation.skipped_frames;
                        let calls: Vec<ToolCallRequest> = generation
                            .calls
                            .into_iter()
                            .map(|c| unique_call_id(c, &mut seen_ids))
                            .collect();
                        if calls.is_empty() {
                            LoopState::Complete {
                                bound_exceeded: false,
                            }
                        } else if rounds >= self.config.max_rounds {
                            warn!(rounds, dropped_calls = calls.len(), "tool round bound reached");
                            LoopState::Complete {
                                bound_exceeded: true,
                            }
                        } else {
                            if !generation.text.is_empty() {
                                context.push(Message::assistant(generation.text));
                            }
                            LoopState::AwaitingTools(calls)
                        }
                    }
                    Err(message) => LoopState::Failed {
                        reason: FailureReason::TransportError,
                        message,
                    },
                },
                LoopState::AwaitingTools(calls) => {
                    rounds += 1;
                    let messages = self.run_tools(&input, calls, sink).await;
                    input.rounds.record(&messages);
                    context.extend_from_slice(&messages);
                    committed.extend(messages);
                    LoopState::Generating
                }
                LoopState::Complete { bound_exceeded } => {
                    info!(rounds, bound_exceeded, skipped_frames, "turn complete");
                    committed.push(Message::assistant(text));
                    return TurnOutcome {
                        messages: committed,
                        terminal: StreamEvent::TurnComplete {
                            rounds,
                            bound_exceeded,
                            skipped_frames,
                        },
                    };
                }
                LoopState::Failed { reason, message } => {
                    warn!(reason = reason.as_str(), error = %message, rounds, "turn failed");
                    // Completed tool rounds are self-contained pairs and stay;
                    // partial assistant text does not.
                    return TurnOutcome {
                        messages: committed,
                        terminal: StreamEvent::failed(reason, message),
                    };
                }
            };
        }
    }

    async fn generate(
        &self,
        input: &TurnInput,
        context: &[Message],
        sink: &dyn TurnSink,
    ) -> Result<Generation, String> {
        let mut messages = input.history.clone();
        messages.extend_from_slice(context);
        let request = GenerateRequest {
            model: input.model.clone(),
            system_prompt: self.config.system_prompt.clone(),
            messages,
            tools: self.registry.list_schemas(),
            max_tokens: self.config.max_output_tokens,
        };

        let raw = self
            .backend
            .generate(&request)
            .await
            .map_err(|e| format!("{}: {e}", e.error_kind()))?;
        let mut stream = ModelStream::new(raw, self.backend.framing(), self.config.stream_idle_timeout);

        let mut generation = Generation {
            text: String::new(),
            calls: Vec::new(),
            skipped_frames: 0,
        };
        while let Some(delta) = stream.next().await {
            match delta {
                ModelDelta::TextDelta { text } => {
                    generation.text.push_str(&text);
                    sink.emit(StreamEvent::Text { text });
                }
                ModelDelta::ToolCall(call) => {
                    debug!(tool = %call.name, call_id = %call.call_id, "tool requested");
                    generation.calls.push(call);
                }
                ModelDelta::End { skipped_frames } => {
                    if skipped_frames > 0 {
                        warn!(skipped_frames, "malformed frames skipped");
                    }
                    generation.skipped_frames = skipped_frames;
                    return Ok(generation);
                }
                ModelDelta::Error { error } => {
                    return Err(format!("{}: {error}", error.error_kind()));
                }
            }
        }
        Err("model stream ended without a terminal frame".into())
    }

    /// Run every call of a round concurrently. `ToolStarted` goes out for
    /// all calls first, `ToolResult` in completion order. The returned tool
    /// messages are in request order.
    async fn run_tools(
        &self,
        input: &TurnInput,
        calls: Vec<ToolCallRequest>,
        sink: &dyn TurnSink,
    ) -> Vec<Message> {
        for call in &calls {
            sink.emit(StreamEvent::ToolStarted {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
            });
        }

        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .enumerate()
            .map(|(idx, call)| {
                let ctx = ToolContext {
                    session_id: input.session_id.clone(),
                    user_id: input.user_id.clone(),
                    call_id: call.call_id.clone(),
                    blobs: Arc::clone(&input.blobs),
                    records: Arc::clone(&input.records),
                    cancel: input.cancel.child_token(),
                };
                async move {
                    let start = Instant::now();
                    let outcome = self.registry.invoke(call, &ctx).await;
                    (idx, outcome, start.elapsed())
                }
            })
            .collect();

        let mut outcomes: Vec<Option<ToolOutcome>> = vec![None; calls.len()];
        while let Some((idx, outcome, elapsed)) = pending.next().await {
            let call = &calls[idx];
            if let Some(kind) = outcome.error_kind() {
                debug!(tool = %call.name, call_id = %call.call_id, kind = kind.as_str(), "tool returned error");
            }
            sink.emit(StreamEvent::ToolResult {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
                result: outcome.clone(),
                duration_ms: elapsed.as_millis() as u64,
            });
            outcomes[idx] = Some(outcome);
        }
        drop(pending);

        calls
            .iter()
            .zip(outcomes)
            .map(|(call, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    ToolOutcome::error(
                        parley_core::tools::ToolErrorKind::InvocationError,
                        "tool produced no result",
                    )
                });
                let content = registry::outcome_text(&outcome);
                Message::tool(call, outcome, content)
            })
            .collect()
    }
}

/// Call ids must be unique within a turn; backends occasionally reuse or
/// omit them.
fn unique_call_id(mut call: ToolCallRequest, seen: &mut HashSet<ToolCallId>) -> ToolCallRequest {
    if call.call_id.as_str().is_empty() || seen.contains(&call.call_id) {
        call.call_id = ToolCallId::new();
    }
    seen.insert(call.call_id.clone());
    call
}
