use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use parley_core::collaborators::AuthProvider;
use parley_core::events::EventEnvelope;
use parley_core::ids::{SessionId, TurnId, UserId};
use parley_core::messages::{Message, Session};
use parley_engine::{EngineError, EventSubscription, SessionManager};
use parley_settings::{EngineSettings, ServerSettings};

use crate::auth::bearer_token;
use crate::client::{self, SocketConfig, SocketContext};
use crate::error::ApiError;
use crate::rate_limit::{Admission, RateLimiter};

const TURN_ID_HEADER: HeaderName = HeaderName::from_static("x-turn-id");

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub client_queue_capacity: usize,
    /// Backlog events a resuming client may need replayed at once.
    pub backlog_capacity: usize,
    /// Applies to producing response headers, not to streamed bodies.
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            client_queue_capacity: 256,
            backlog_capacity: 1024,
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(server: &ServerSettings, engine: &EngineSettings) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(server.heartbeat_timeout_secs),
            client_queue_capacity: server.client_queue_capacity,
            backlog_capacity: engine.backlog_capacity,
            sweep_interval: engine.sweep_interval(),
            ..Self::default()
        }
    }

    fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            queue_capacity: self.resume_capacity(),
        }
    }

    /// Queue depth for connections that may start with a backlog replay.
    fn resume_capacity(&self) -> usize {
        self.client_queue_capacity + self.backlog_capacity
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub auth: Arc<dyn AuthProvider>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<ServerConfig>,
    /// Cancelled on shutdown; ends long-lived streams and sockets.
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let timeout = state.config.request_timeout;
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/messages", axum::routing::post(post_message))
        .route("/sessions/{id}/events", get(observe_events))
        .route("/sessions/{id}/ws", get(ws_handler))
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    manager: Arc<SessionManager>,
    auth: Arc<dyn AuthProvider>,
    limiter: Arc<RateLimiter>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let maintenance = start_maintenance_task(
        Arc::clone(&manager),
        Arc::clone(&limiter),
        config.sweep_interval,
        shutdown.clone(),
    );

    let state = AppState {
        manager,
        auth,
        limiter,
        config: Arc::new(config),
        shutdown: shutdown.clone(),
    };
    let router = build_router(state);

    info!(addr = %local_addr, "parley server started");

    let graceful = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await
        {
            warn!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        maintenance,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections, end open streams and wait for the
    /// listener to close.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.maintenance.await;
        let _ = self.server.await;
        info!("parley server stopped");
    }
}

/// Periodically sweep rate-limit windows, idle actors and expired sessions.
pub fn start_maintenance_task(
    manager: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let windows = limiter.sweep(Instant::now());
            let evicted = manager.evict_idle(tokio::time::Instant::now());
            let purged = match manager.purge_expired(chrono::Utc::now()).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "session purge failed");
                    0
                }
            };
            if windows + evicted + purged > 0 {
                debug!(windows, evicted, purged, "maintenance sweep");
            }
        }
    })
}

/// The authenticated, admitted caller of a request.
///
/// Credentials come from `Authorization: Bearer`, or `?token=` on
/// WebSocket upgrades where browsers cannot set headers.
pub struct Caller(pub UserId);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .map(str::to_owned)
            .or_else(|| {
                is_websocket_upgrade(&parts.headers)
                    .then(|| Query::<TokenQuery>::try_from_uri(&parts.uri).ok())
                    .flatten()
                    .and_then(|q| q.0.token)
            })
            .ok_or(ApiError::Unauthenticated)?;

        let user_id = state
            .auth
            .verify(&token)
            .await
            .map_err(|_| ApiError::Unauthenticated)?;

        match state.limiter.admit(user_id.as_str(), Instant::now()) {
            Admission::Allowed { .. } => Ok(Caller(user_id)),
            Admission::Denied { retry_after } => {
                debug!(user_id = %user_id, "request rate limited");
                Err(ApiError::RateLimited { retry_after })
            }
        }
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    SessionId::parse_external(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid session id: {raw:?}")))
}

/// Decode a JSON body; an empty body decodes as `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}

#[derive(Serialize)]
struct SessionSummary {
    id: SessionId,
    model: String,
    created_at: String,
    updated_at: String,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            model: s.model.clone(),
            created_at: s.created_at.to_rfc3339(),
            updated_at: s.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CreateSessionBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PostMessageBody {
    #[serde(default)]
    text: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    after: Option<u64>,
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "sessions": state.manager.session_count(),
        "tools": state.manager.registry().count(),
    }))
}

async fn create_session(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: CreateSessionBody = parse_body(&body)?;
    let id = body.id.as_deref().map(parse_session_id).transpose()?;
    let actor = state.manager.get_or_create(id, &user_id, body.model).await?;
    Ok((StatusCode::CREATED, Json(SessionSummary::from(actor.session()))))
}

async fn list_sessions(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.manager.list(&user_id).await?;
    let summaries: Vec<SessionSummary> = sessions.iter().map(SessionSummary::from).collect();
    Ok(Json(json!({ "sessions": summaries })))
}

async fn get_session(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    let actor = state.manager.get(&id, &user_id).await?;
    let messages: Vec<Message> = actor.history();
    Ok(Json(json!({
        "session": SessionSummary::from(actor.session()),
        "messages": messages,
        "last_seq": actor.hub().last_seq(),
        "turn_in_progress": actor.current_turn().is_some(),
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    state.manager.delete(&id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Submit a user message and stream the turn's events until its terminal
/// event. The session is created on first use.
async fn post_message(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    let body: PostMessageBody = parse_body(&body)?;
    if body.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".into()));
    }

    let actor = state
        .manager
        .get_or_create(Some(id), &user_id, body.model.clone())
        .await?;
    let handle = actor.submit(body.text, body.model)?;
    let turn_id = handle.turn_id.clone();
    debug!(session_id = %actor.id(), turn_id = %turn_id, "streaming turn over sse");

    let turn_header = HeaderValue::from_str(turn_id.as_str())
        .map_err(|e| EngineError::Internal(format!("turn id not a header value: {e}")))?;
    let stream = until_turn_ends(handle.events, turn_id)
        .map(|envelope| Ok::<_, Infallible>(sse_event(&envelope)))
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok((
        [(TURN_ID_HEADER, turn_header)],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    ))
}

/// Observe a session's events. Resumes after `?after=` or `Last-Event-ID`.
async fn observe_events(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_session_id(&id)?;
    let resume_after = match query.after {
        Some(after) => Some(after),
        None => last_event_id(&headers)?,
    };
    let actor = state.manager.get(&id, &user_id).await?;
    let events = actor
        .hub()
        .subscribe(state.config.resume_capacity(), resume_after)?;
    debug!(session_id = %id, resume_after, "observer joined over sse");

    let stream = events
        .map(|envelope| Ok::<_, Infallible>(sse_event(&envelope)))
        .take_until(state.shutdown.clone().cancelled_owned());
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    let actor = state.manager.get_or_create(Some(id), &user_id, None).await?;
    let config = state.config.socket_config();
    // Joined before the upgrade so no event published meanwhile is missed.
    let events = actor
        .hub()
        .subscribe(config.queue_capacity, query.after)?;

    let ctx = SocketContext {
        actor,
        user_id,
        limiter: Arc::clone(&state.limiter),
        config,
        shutdown: state.shutdown.clone(),
    };
    Ok(ws.on_upgrade(move |socket| client::serve_socket(socket, ctx, events)))
}

fn last_event_id(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    headers
        .get("last-event-id")
        .map(|v| {
            v.to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| ApiError::BadRequest("Last-Event-ID must be a sequence number".into()))
        })
        .transpose()
}

/// Yield envelopes up to and including the terminal event of `turn_id`.
fn until_turn_ends(
    events: EventSubscription,
    turn_id: TurnId,
) -> impl Stream<Item = EventEnvelope> {
    futures::stream::unfold((events, false), move |(mut events, done)| {
        let turn_id = turn_id.clone();
        async move {
            if done {
                return None;
            }
            let envelope = events.recv().await?;
            let last = envelope.turn_id == turn_id && envelope.event.is_terminal();
            Some((envelope, (events, last)))
        }
    })
}

fn sse_event(envelope: &EventEnvelope) -> Event {
    let event = Event::default().id(envelope.seq.to_string());
    match event.json_data(envelope) {
        Ok(event) => event,
        Err(e) => {
            warn!(seq = envelope.seq, error = %e, "failed to encode sse event");
            Event::default().comment("encode error")
        }
    }
}
