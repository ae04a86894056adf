use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parley_core::collaborators::{BlobStore, RecordStore};
use parley_core::events::{FailureReason, StreamEvent};
use parley_core::ids::{SessionId, TurnId, UserId};
use parley_core::messages::{Message, Session};

use crate::error::EngineError;
use crate::hub::{BroadcastHub, EventSubscription};
use crate::tool_loop::{RoundLog, ToolCallLoop, TurnInput, TurnOutcome, TurnSink};

pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct ActorConfig {
    pub turn_timeout: Duration,
    pub client_queue_capacity: usize,
}

struct ActiveTurn {
    turn_id: TurnId,
    cancel: CancellationToken,
}

struct ActorState {
    history: Vec<Message>,
    current: Option<ActiveTurn>,
    closed: bool,
    last_active: Instant,
}

/// A turn accepted by [`SessionActor::submit`]. The subscription was joined
/// before the turn started, so it sees every event of the turn.
pub struct TurnHandle {
    pub turn_id: TurnId,
    pub events: EventSubscription,
}

/// Owner of one conversation: its history, its hub and at most one
/// in-flight turn.
///
/// History is only written under the state lock, by `submit` (the user
/// message) and by the turn task when it commits. Persistence is fed
/// through an ordered queue drained by a per-session writer task.
pub struct SessionActor {
    session: Session,
    hub: Arc<BroadcastHub>,
    tool_loop: Arc<ToolCallLoop>,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    config: ActorConfig,
    state: Mutex<ActorState>,
    persist_tx: mpsc::UnboundedSender<Message>,
}

impl SessionActor {
    pub fn new(
        session: Session,
        history: Vec<Message>,
        hub: Arc<BroadcastHub>,
        tool_loop: Arc<ToolCallLoop>,
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        config: ActorConfig,
    ) -> Arc<Self> {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_messages(
            session.id.clone(),
            Arc::clone(&records),
            persist_rx,
        ));
        Arc::new(Self {
            session,
            hub,
            tool_loop,
            records,
            blobs,
            config,
            state: Mutex::new(ActorState {
                history,
                current: None,
                closed: false,
                last_active: Instant::now(),
            }),
            persist_tx,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.session.user_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Start a turn for `text`. Rejected with `TurnInProgress` while another
    /// turn runs; the history is left untouched in that case.
    pub fn submit(
        self: &Arc<Self>,
        text: impl Into<String>,
        model: Option<String>,
    ) -> Result<TurnHandle, EngineError> {
        let mut state = self.state.lock();
        self.check_accepting(&state)?;
        let events = self
            .hub
            .subscribe(self.config.client_queue_capacity, None)
            .map_err(|e| EngineError::Internal(format!("subscribe failed: {e}")))?;
        let turn_id = self.begin_turn(&mut state, text.into(), model);
        Ok(TurnHandle { turn_id, events })
    }

    /// Start a turn without a dedicated subscription, for callers already
    /// joined to the hub.
    pub fn submit_detached(
        self: &Arc<Self>,
        text: impl Into<String>,
        model: Option<String>,
    ) -> Result<TurnId, EngineError> {
        let mut state = self.state.lock();
        self.check_accepting(&state)?;
        Ok(self.begin_turn(&mut state, text.into(), model))
    }

    fn check_accepting(&self, state: &ActorState) -> Result<(), EngineError> {
        if state.closed {
            return Err(EngineError::SessionClosed(self.session.id.to_string()));
        }
        if let Some(turn) = &state.current {
            debug!(session_id = %self.session.id, turn_id = %turn.turn_id, "rejecting concurrent submit");
            return Err(EngineError::TurnInProgress(self.session.id.to_string()));
        }
        Ok(())
    }

    fn begin_turn(self: &Arc<Self>, state: &mut ActorState, text: String, model: Option<String>) -> TurnId {
        let turn_id = TurnId::new();
        let cancel = CancellationToken::new();

        let user_message = Message::user(text);
        state.history.push(user_message.clone());
        self.persist(user_message);
        state.current = Some(ActiveTurn {
            turn_id: turn_id.clone(),
            cancel: cancel.clone(),
        });
        state.last_active = Instant::now();

        let input = TurnInput {
            session_id: self.session.id.clone(),
            user_id: self.session.user_id.clone(),
            turn_id: turn_id.clone(),
            model: model.unwrap_or_else(|| self.session.model.clone()),
            history: state.history.clone(),
            blobs: Arc::clone(&self.blobs),
            records: Arc::clone(&self.records),
            cancel: cancel.clone(),
            rounds: RoundLog::default(),
        };
        info!(session_id = %self.session.id, turn_id = %turn_id, model = %input.model, "turn started");

        let actor = Arc::clone(self);
        tokio::spawn(async move { actor.drive_turn(input, cancel).await });
        turn_id
    }

    async fn drive_turn(self: Arc<Self>, input: TurnInput, cancel: CancellationToken) {
        let turn_id = input.turn_id.clone();
        let sink = HubSink {
            hub: Arc::clone(&self.hub),
            turn_id: turn_id.clone(),
        };
        let timeout = self.config.turn_timeout;
        // Rounds that finished before an interruption stay committed; their
        // results were already published.
        let rounds = input.rounds.clone();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                TurnOutcome::failed(FailureReason::SessionClosed, "session closed").with_messages(rounds.take())
            }
            result = tokio::time::timeout(timeout, self.tool_loop.run(input, &sink)) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(session_id = %self.session.id, turn_id = %turn_id, timeout_secs = timeout.as_secs(), "turn timed out");
                    TurnOutcome::failed(
                        FailureReason::TurnTimeout,
                        format!("turn exceeded {}s", timeout.as_secs()),
                    )
                    .with_messages(rounds.take())
                }
            },
        };
        // In-flight tools observe this through their child tokens.
        cancel.cancel();
        self.finish_turn(&turn_id, outcome);
    }

    /// Publish the terminal event, commit the turn's messages and free the
    /// turn slot as one step.
    fn finish_turn(&self, turn_id: &TurnId, outcome: TurnOutcome) {
        let mut state = self.state.lock();
        if state.current.as_ref().map(|t| &t.turn_id) != Some(turn_id) {
            error!(session_id = %self.session.id, turn_id = %turn_id, "finishing a turn that is not current");
            return;
        }
        self.hub.publish(turn_id, outcome.terminal);
        for message in outcome.messages {
            state.history.push(message.clone());
            self.persist(message);
        }
        state.current = None;
        state.last_active = Instant::now();
    }

    fn persist(&self, message: Message) {
        if self.persist_tx.send(message).is_err() {
            error!(session_id = %self.session.id, "persistence queue closed, message not stored");
        }
    }

    pub fn history(&self) -> Vec<Message> {
        self.state.lock().history.clone()
    }

    pub fn current_turn(&self) -> Option<TurnId> {
        self.state.lock().current.as_ref().map(|t| t.turn_id.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Cancel any in-flight turn and refuse further submits. The running
    /// turn ends with `TurnFailed(SessionClosed)`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(turn) = &state.current {
            turn.cancel.cancel();
        }
        info!(session_id = %self.session.id, "session closed");
    }

    /// No turn running, nobody listening, and nothing happened since
    /// `idle_for` ago.
    pub fn is_idle(&self, now: Instant, idle_for: Duration) -> bool {
        let state = self.state.lock();
        state.current.is_none()
            && self.hub.connection_count() == 0
            && now.saturating_duration_since(state.last_active) >= idle_for
    }
}

struct HubSink {
    hub: Arc<BroadcastHub>,
    turn_id: TurnId,
}

impl TurnSink for HubSink {
    fn emit(&self, event: StreamEvent) {
        self.hub.publish(&self.turn_id, event);
    }
}

async fn persist_messages(
    session_id: SessionId,
    records: Arc<dyn RecordStore>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = records.append_message(&session_id, &message).await {
            error!(session_id = %session_id, role = %message.role, error = %e, "failed to persist message");
        }
    }
    debug!(session_id = %session_id, "persistence writer stopped");
}
