use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_core::ids::UserId;
use parley_engine::{EventSubscription, SessionActor};

use crate::rate_limit::{Admission, RateLimiter};
use crate::rpc::{self, ClientFrame, ServerFrame};

/// Per-socket settings.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub queue_capacity: usize,
}

/// Everything a socket needs besides the socket itself.
pub struct SocketContext {
    pub actor: Arc<SessionActor>,
    pub user_id: UserId,
    pub limiter: Arc<RateLimiter>,
    pub config: SocketConfig,
    pub shutdown: CancellationToken,
}

/// Reader to writer instructions.
#[derive(Debug)]
enum Control {
    Send(ServerFrame),
    Resume(u64),
}

/// Time since `origin` of the last pong, in milliseconds.
struct Liveness {
    origin: Instant,
    last_pong_ms: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    fn record_pong(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_pong_ms.store(now, Ordering::Relaxed);
    }

    fn silent_for(&self) -> Duration {
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Serve one WebSocket until either side goes away. `events` is the
/// connection's hub subscription, joined before the upgrade completed; a
/// `resume` frame swaps it for one replaying from the requested seq.
pub async fn serve_socket(socket: WebSocket, ctx: SocketContext, events: EventSubscription) {
    let session_id = ctx.actor.id().clone();
    let connection_id = events.id().clone();
    info!(session_id = %session_id, connection_id = %connection_id, user_id = %ctx.user_id, "websocket connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let (control_tx, control_rx) = mpsc::channel::<Control>(ctx.config.queue_capacity.max(1));
    let liveness = Arc::new(Liveness::new());
    let ctx = Arc::new(ctx);

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        Arc::clone(&ctx),
        events,
        control_rx,
        Arc::clone(&liveness),
    ));

    let reader_ctx = Arc::clone(&ctx);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if let Some(control) = handle_frame(&reader_ctx, text.as_str()) {
                        if control_tx.send(control).await.is_err() {
                            break;
                        }
                    }
                }
                WsMessage::Pong(_) => liveness.record_pong(),
                WsMessage::Close(_) => break,
                // axum answers pings itself
                WsMessage::Ping(_) | WsMessage::Binary(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    info!(session_id = %session_id, connection_id = %connection_id, "websocket disconnected");
}

/// Turn one inbound frame into an instruction for the writer.
fn handle_frame(ctx: &SocketContext, raw: &str) -> Option<Control> {
    let frame = match rpc::parse_frame(raw) {
        Ok(frame) => frame,
        Err(reply) => return Some(Control::Send(reply)),
    };
    let reply = match frame {
        ClientFrame::Submit {
            text,
            model,
            request_id,
        } => {
            let reply = submit(ctx, text, model);
            reply.with_request_id(request_id)
        }
        ClientFrame::History => ServerFrame::History {
            session_id: ctx.actor.id().clone(),
            messages: ctx.actor.history(),
        },
        ClientFrame::Resume { after } => return Some(Control::Resume(after)),
        ClientFrame::Ping => ServerFrame::Pong,
    };
    Some(Control::Send(reply))
}

fn submit(ctx: &SocketContext, text: String, model: Option<String>) -> ServerFrame {
    if text.trim().is_empty() {
        return ServerFrame::error(rpc::INVALID_FRAME, "text must not be empty");
    }
    if let Admission::Denied { retry_after } = ctx.limiter.admit(ctx.user_id.as_str(), Instant::now()) {
        return ServerFrame::error(
            rpc::RATE_LIMITED,
            format!("rate limited, retry in {}s", retry_after.as_secs().max(1)),
        );
    }
    match ctx.actor.submit_detached(text, model) {
        Ok(turn_id) => ServerFrame::Ack {
            turn_id,
            request_id: None,
        },
        Err(e) => {
            debug!(session_id = %ctx.actor.id(), error = %e, "websocket submit rejected");
            ServerFrame::from_engine_error(&e)
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    ctx: Arc<SocketContext>,
    mut events: EventSubscription,
    mut control_rx: mpsc::Receiver<Control>,
    liveness: Arc<Liveness>,
) {
    let mut ping = tokio::time::interval(ctx.config.heartbeat_interval);
    ping.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                break;
            }
            control = control_rx.recv() => match control {
                Some(Control::Send(frame)) => {
                    if send_json(&mut ws_tx, &frame).await.is_err() {
                        break;
                    }
                }
                Some(Control::Resume(after)) => {
                    match ctx.actor.hub().subscribe(ctx.config.queue_capacity, Some(after)) {
                        Ok(resumed) => {
                            debug!(session_id = %ctx.actor.id(), after, "websocket resumed");
                            events = resumed;
                        }
                        Err(e) => {
                            let frame = ServerFrame::error(rpc::RESUME_FAILED, e.to_string());
                            if send_json(&mut ws_tx, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                None => break,
            },
            envelope = events.recv() => match envelope {
                Some(envelope) => {
                    if send_json(&mut ws_tx, &envelope).await.is_err() {
                        break;
                    }
                }
                None => {
                    warn!(session_id = %ctx.actor.id(), "websocket dropped by hub");
                    break;
                }
            },
            _ = ping.tick() => {
                if liveness.silent_for() > ctx.config.heartbeat_timeout {
                    info!(session_id = %ctx.actor.id(), "websocket heartbeat timed out");
                    break;
                }
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
                trace!(session_id = %ctx.actor.id(), "sent ping");
            }
        }
    }
}

async fn send_json<T: Serialize>(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    value: &T,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode websocket frame");
            return Ok(());
        }
    };
    ws_tx.send(WsMessage::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_starts_fresh() {
        let liveness = Liveness::new();
        assert!(liveness.silent_for() < Duration::from_secs(1));
        liveness.record_pong();
        assert!(liveness.silent_for() < Duration::from_secs(1));
    }
}
