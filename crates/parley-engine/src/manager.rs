use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use parley_core::backend::ModelBackend;
use parley_core::collaborators::{BlobStore, RecordStore};
use parley_core::errors::StorageError;
use parley_core::ids::{SessionId, UserId};
use parley_core::messages::{Message, Session};
use parley_settings::Settings;

use crate::error::EngineError;
use crate::hub::{BroadcastHub, DEFAULT_BACKLOG_CAPACITY, DEFAULT_CLIENT_QUEUE_CAPACITY};
use crate::registry::ToolRegistry;
use crate::session::{ActorConfig, SessionActor, DEFAULT_TURN_TIMEOUT};
use crate::tool_loop::{LoopConfig, ToolCallLoop};

/// Engine-wide knobs, usually derived from [`Settings`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub default_model: String,
    pub loop_config: LoopConfig,
    pub turn_timeout: Duration,
    pub client_queue_capacity: usize,
    pub backlog_capacity: usize,
    pub idle_eviction: Duration,
    pub session_ttl: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: "default".into(),
            loop_config: LoopConfig::default(),
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            idle_eviction: Duration::from_secs(15 * 60),
            session_ttl: None,
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let engine = &settings.engine;
        Self {
            default_model: settings.model.default_model.clone(),
            loop_config: LoopConfig {
                system_prompt: engine.system_prompt.clone(),
                max_rounds: engine.max_rounds,
                max_output_tokens: engine.max_output_tokens,
                stream_idle_timeout: settings.model.idle_timeout(),
            },
            turn_timeout: engine.turn_timeout(),
            client_queue_capacity: settings.server.client_queue_capacity,
            backlog_capacity: engine.backlog_capacity,
            idle_eviction: engine.idle_eviction(),
            session_ttl: engine.session_ttl(),
        }
    }

    fn actor_config(&self) -> ActorConfig {
        ActorConfig {
            turn_timeout: self.turn_timeout,
            client_queue_capacity: self.client_queue_capacity,
        }
    }
}

/// Live session actors keyed by id. Actors are created on first use,
/// reloaded from the record store after eviction, and scoped to the user
/// that created them: another user's session looks exactly like a missing
/// one.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<SessionActor>>,
    tool_loop: Arc<ToolCallLoop>,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    config: EngineConfig,
}

impl SessionManager {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        registry: Arc<ToolRegistry>,
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        config: EngineConfig,
    ) -> Self {
        let tool_loop = Arc::new(ToolCallLoop::new(backend, registry, config.loop_config.clone()));
        Self {
            sessions: DashMap::new(),
            tool_loop,
            records,
            blobs,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.tool_loop.registry()
    }

    /// Sessions currently held in memory.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Return the caller's session `id`, creating it when absent. Without an
    /// id a new session is always created.
    #[instrument(skip(self, model), fields(user_id = %user_id))]
    pub async fn get_or_create(
        &self,
        id: Option<SessionId>,
        user_id: &UserId,
        model: Option<String>,
    ) -> Result<Arc<SessionActor>, EngineError> {
        let Some(id) = id else {
            return self.create(SessionId::new(), user_id, model).await;
        };
        match self.lookup(&id, user_id).await {
            Err(EngineError::SessionNotFound(_)) => {
                if self.exists(&id).await? {
                    Err(EngineError::SessionNotFound(id.to_string()))
                } else {
                    self.create(id, user_id, model).await
                }
            }
            other => other,
        }
    }

    /// The caller's existing session, loading it from the record store if
    /// it is not in memory.
    pub async fn get(&self, id: &SessionId, user_id: &UserId) -> Result<Arc<SessionActor>, EngineError> {
        self.lookup(id, user_id).await
    }

    pub async fn list(&self, user_id: &UserId) -> Result<Vec<Session>, EngineError> {
        Ok(self.records.list_sessions(user_id).await?)
    }

    /// Close the session's actor and delete its records.
    #[instrument(skip(self), fields(session_id = %id, user_id = %user_id))]
    pub async fn delete(&self, id: &SessionId, user_id: &UserId) -> Result<(), EngineError> {
        match self.sessions.get(id).map(|a| Arc::clone(a.value())) {
            Some(actor) if actor.user_id() == user_id => {}
            Some(_) => return Err(EngineError::SessionNotFound(id.to_string())),
            None => match self.records.get_session(id).await? {
                Some(session) if &session.user_id == user_id => {}
                _ => return Err(EngineError::SessionNotFound(id.to_string())),
            },
        }
        if let Some((_, actor)) = self.sessions.remove(id) {
            actor.close();
        }
        self.records.delete_session(id).await?;
        info!("session deleted");
        Ok(())
    }

    /// Drop actors with no turn, no connections and no activity for the
    /// configured idle period. Returns how many were evicted.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let idle_for = self.config.idle_eviction;
        let before = self.sessions.len();
        self.sessions.retain(|id, actor| {
            let idle = actor.is_idle(now, idle_for);
            if idle {
                debug!(session_id = %id, "evicting idle session");
            }
            !idle
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Delete session records older than the configured TTL and drop their
    /// actors. A no-op without a TTL.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let Some(ttl) = self.config.session_ttl else {
            return Ok(0);
        };
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| EngineError::Internal(format!("session ttl out of range: {e}")))?;
        let purged = self.records.purge_inactive(now - ttl).await?;
        for id in &purged {
            if let Some((_, actor)) = self.sessions.remove(id) {
                actor.close();
            }
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "purged expired sessions");
        }
        Ok(purged.len())
    }

    /// Close every live actor. In-flight turns end with `SessionClosed`.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
        self.sessions.clear();
    }

    async fn lookup(&self, id: &SessionId, user_id: &UserId) -> Result<Arc<SessionActor>, EngineError> {
        if let Some(actor) = self.sessions.get(id).map(|a| Arc::clone(a.value())) {
            return owned_by(actor, user_id);
        }
        let session = self
            .records
            .get_session(id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        if &session.user_id != user_id {
            return Err(EngineError::SessionNotFound(id.to_string()));
        }
        let history = self.records.load_history(id).await?;
        debug!(session_id = %id, messages = history.len(), "session loaded");
        let actor = self.install(session, history);
        owned_by(actor, user_id)
    }

    async fn exists(&self, id: &SessionId) -> Result<bool, EngineError> {
        Ok(self.sessions.contains_key(id) || self.records.get_session(id).await?.is_some())
    }

    async fn create(
        &self,
        id: SessionId,
        user_id: &UserId,
        model: Option<String>,
    ) -> Result<Arc<SessionActor>, EngineError> {
        let model = model.unwrap_or_else(|| self.config.default_model.clone());
        let session = Session::new(id, user_id.clone(), model);
        match self.records.create_session(&session).await {
            Ok(()) => {
                info!(session_id = %session.id, model = %session.model, "session created");
                Ok(self.install(session, Vec::new()))
            }
            // Lost a creation race; use whichever session won.
            Err(StorageError::Conflict(_)) => self.lookup(&session.id, user_id).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Insert an actor for `session` unless another task already did.
    fn install(&self, session: Session, history: Vec<Message>) -> Arc<SessionActor> {
        let entry = self.sessions.entry(session.id.clone()).or_insert_with(|| {
            let hub = BroadcastHub::new(session.id.clone(), self.config.backlog_capacity);
            SessionActor::new(
                session,
                history,
                hub,
                Arc::clone(&self.tool_loop),
                Arc::clone(&self.records),
                Arc::clone(&self.blobs),
                self.config.actor_config(),
            )
        });
        Arc::clone(entry.value())
    }
}

fn owned_by(actor: Arc<SessionActor>, user_id: &UserId) -> Result<Arc<SessionActor>, EngineError> {
    if actor.user_id() == user_id {
        Ok(actor)
    } else {
        Err(EngineError::SessionNotFound(actor.id().to_string()))
    }
}
