use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use parley_core::events::{EventEnvelope, StreamEvent};
use parley_core::ids::{ConnectionId, SessionId, TurnId};

pub const DEFAULT_BACKLOG_CAPACITY: usize = 1024;
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("client queue full")]
    Full,
    #[error("client disconnected")]
    Closed,
    #[error("events after {requested} are no longer retained (oldest is {oldest}); reload history")]
    ResumeGap { requested: u64, oldest: u64 },
}

/// Destination for one connection's events. `deliver` must not block:
/// a sink that cannot take an event right now returns an error and is
/// dropped from the hub.
pub trait EventSink: Send + Sync {
    fn deliver(&self, envelope: &EventEnvelope) -> Result<(), SinkError>;
}

/// Bounded channel drained by a transport writer task.
pub struct ChannelSink {
    tx: mpsc::Sender<EventEnvelope>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<EventEnvelope>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        self.tx.try_send(envelope.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

struct HubState {
    connections: Vec<(ConnectionId, Arc<dyn EventSink>)>,
    backlog: VecDeque<EventEnvelope>,
    next_seq: u64,
}

/// Fan-out of one session's event sequence to its live connections.
///
/// Publishing assigns the next sequence number, records the envelope in a
/// bounded backlog and hands it to every sink in join order. A failing
/// sink is removed without affecting the publisher or the other sinks.
pub struct BroadcastHub {
    session_id: SessionId,
    backlog_capacity: usize,
    state: Mutex<HubState>,
}

impl BroadcastHub {
    pub fn new(session_id: SessionId, backlog_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            backlog_capacity: backlog_capacity.max(1),
            state: Mutex::new(HubState {
                connections: Vec::new(),
                backlog: VecDeque::new(),
                next_seq: 1,
            }),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Stamp and deliver one event. Returns the envelope as published.
    pub fn publish(&self, turn_id: &TurnId, event: StreamEvent) -> EventEnvelope {
        let mut state = self.state.lock();
        let envelope = EventEnvelope {
            seq: state.next_seq,
            session_id: self.session_id.clone(),
            turn_id: turn_id.clone(),
            event,
        };
        state.next_seq += 1;

        if state.backlog.len() == self.backlog_capacity {
            state.backlog.pop_front();
        }
        state.backlog.push_back(envelope.clone());

        state.connections.retain(|(id, sink)| match sink.deliver(&envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    connection_id = %id,
                    seq = envelope.seq,
                    reason = %e,
                    "dropping connection"
                );
                false
            }
        });
        envelope
    }

    /// Register a sink. With `resume_after`, backlog events newer than that
    /// sequence number are replayed first, under the same lock as the
    /// registration, so the sink sees neither a gap nor a duplicate. A
    /// resume point the backlog no longer covers fails with `ResumeGap`
    /// and replays nothing.
    pub fn join(
        self: &Arc<Self>,
        sink: Arc<dyn EventSink>,
        resume_after: Option<u64>,
    ) -> Result<Subscription, SinkError> {
        let mut state = self.state.lock();
        if let Some(after) = resume_after {
            if let Some(oldest) = state.backlog.front().map(|e| e.seq) {
                if after.saturating_add(1) < oldest {
                    return Err(SinkError::ResumeGap {
                        requested: after,
                        oldest,
                    });
                }
            }
            for envelope in state.backlog.iter().filter(|e| e.seq > after) {
                sink.deliver(envelope)?;
            }
        }
        let id = ConnectionId::new();
        state.connections.push((id.clone(), sink));
        debug!(session_id = %self.session_id, connection_id = %id, resume_after, "connection joined");
        Ok(Subscription {
            id,
            hub: Arc::clone(self),
        })
    }

    /// Join with a fresh bounded channel.
    pub fn subscribe(
        self: &Arc<Self>,
        capacity: usize,
        resume_after: Option<u64>,
    ) -> Result<EventSubscription, SinkError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscription = self.join(Arc::new(ChannelSink::new(tx)), resume_after)?;
        Ok(EventSubscription { subscription, rx })
    }

    pub fn leave(&self, id: &ConnectionId) -> bool {
        let mut state = self.state.lock();
        let before = state.connections.len();
        state.connections.retain(|(cid, _)| cid != id);
        let removed = state.connections.len() != before;
        if removed {
            debug!(session_id = %self.session_id, connection_id = %id, "connection left");
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Sequence number of the most recent event, 0 before the first.
    pub fn last_seq(&self) -> u64 {
        self.state.lock().next_seq - 1
    }
}

/// Membership of one connection. Dropping it leaves the hub.
pub struct Subscription {
    id: ConnectionId,
    hub: Arc<BroadcastHub>,
}

impl Subscription {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.leave(&self.id);
    }
}

/// A channel-backed subscription. Ends when the hub drops the connection.
pub struct EventSubscription {
    subscription: Subscription,
    rx: mpsc::Receiver<EventEnvelope>,
}

impl EventSubscription {
    pub fn id(&self) -> &ConnectionId {
        self.subscription.id()
    }

    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }
}

impl Stream for EventSubscription {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hub() -> Arc<BroadcastHub> {
        BroadcastHub::new(SessionId::from_raw("s1"), 4)
    }

    fn text(t: &str) -> StreamEvent {
        StreamEvent::Text { text: t.into() }
    }

    struct FailingSink {
        attempts: AtomicUsize,
    }

    impl EventSink for FailingSink {
        fn deliver(&self, _: &EventEnvelope) -> Result<(), SinkError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            Err(SinkError::Closed)
        }
    }

    fn drain(sub: &mut EventSubscription) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Ok(env) = sub.rx.try_recv() {
            seqs.push(env.seq);
        }
        seqs
    }

    #[test]
    fn publish_assigns_increasing_seq() {
        let hub = hub();
        let turn = TurnId::new();
        assert_eq!(hub.last_seq(), 0);
        assert_eq!(hub.publish(&turn, text("a")).seq, 1);
        assert_eq!(hub.publish(&turn, text("b")).seq, 2);
        assert_eq!(hub.last_seq(), 2);
    }

    #[test]
    fn failing_connection_does_not_affect_others() {
        let hub = hub();
        let mut a = hub.subscribe(8, None).unwrap();
        let failing = Arc::new(FailingSink {
            attempts: AtomicUsize::new(0),
        });
        let _f = hub.join(failing.clone(), None).unwrap();
        let mut b = hub.subscribe(8, None).unwrap();
        assert_eq!(hub.connection_count(), 3);

        let turn = TurnId::new();
        hub.publish(&turn, text("x"));
        hub.publish(&turn, text("y"));

        assert_eq!(drain(&mut a), vec![1, 2]);
        assert_eq!(drain(&mut b), vec![1, 2]);
        assert_eq!(failing.attempts.load(Ordering::Relaxed), 1);
        assert_eq!(hub.connection_count(), 2);
    }

    #[test]
    fn slow_connection_is_dropped() {
        let hub = hub();
        let mut slow = hub.subscribe(1, None).unwrap();
        let mut fast = hub.subscribe(8, None).unwrap();
        let turn = TurnId::new();
        for t in ["a", "b", "c"] {
            hub.publish(&turn, text(t));
        }
        assert_eq!(drain(&mut fast), vec![1, 2, 3]);
        assert_eq!(drain(&mut slow), vec![1]);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn dropped_connection_stream_ends() {
        let hub = hub();
        let mut slow = hub.subscribe(1, None).unwrap();
        let turn = TurnId::new();
        hub.publish(&turn, text("a"));
        hub.publish(&turn, text("b"));
        assert_eq!(slow.recv().await.map(|e| e.seq), Some(1));
        assert!(slow.recv().await.is_none());
    }

    #[test]
    fn resume_replays_only_newer_backlog() {
        let hub = hub();
        let turn = TurnId::new();
        for t in ["a", "b", "c"] {
            hub.publish(&turn, text(t));
        }
        let mut sub = hub.subscribe(8, Some(1)).unwrap();
        hub.publish(&turn, text("d"));
        assert_eq!(drain(&mut sub), vec![2, 3, 4]);
    }

    #[test]
    fn backlog_is_bounded() {
        let hub = hub();
        let turn = TurnId::new();
        for i in 0..10 {
            hub.publish(&turn, text(&i.to_string()));
        }
        let mut sub = hub.subscribe(16, Some(6)).unwrap();
        assert_eq!(drain(&mut sub), vec![7, 8, 9, 10]);
    }

    #[test]
    fn resume_older_than_backlog_fails_without_joining() {
        let hub = hub();
        let turn = TurnId::new();
        for i in 0..10 {
            hub.publish(&turn, text(&i.to_string()));
        }
        assert!(matches!(
            hub.subscribe(16, Some(0)),
            Err(SinkError::ResumeGap { requested: 0, oldest: 7 })
        ));
        assert!(matches!(
            hub.subscribe(16, Some(5)),
            Err(SinkError::ResumeGap { requested: 5, oldest: 7 })
        ));
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn resume_into_small_queue_fails_without_joining() {
        let hub = hub();
        let turn = TurnId::new();
        for t in ["a", "b", "c"] {
            hub.publish(&turn, text(t));
        }
        assert!(matches!(hub.subscribe(1, Some(0)), Err(SinkError::Full)));
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn dropping_subscription_leaves() {
        let hub = hub();
        let sub = hub.subscribe(4, None).unwrap();
        let id = sub.id().clone();
        assert_eq!(hub.connection_count(), 1);
        drop(sub);
        assert_eq!(hub.connection_count(), 0);
        assert!(!hub.leave(&id));
    }
}
