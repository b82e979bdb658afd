//! Per-session progress fan-out.
//!
//! One bounded broadcast channel per session, capacity 128. Publishers
//! never block: when a subscriber falls behind, the oldest buffered events
//! are dropped and the subscription's lagged counter records how many.
//! Events for one session are totally ordered (single writer per session);
//! `workflow_complete` closes the session server-side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use super::events::{ProgressEvent, ProgressPayload};

/// Channel capacity per subscription.
pub const CHANNEL_CAPACITY: usize = 128;
/// Keepalive ping interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub struct ProgressBus {
    sessions: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to a session's event stream. The channel is created on
    /// first use, so subscribing before the pipeline starts is safe.
    pub fn subscribe(&self, session_id: &str) -> ProgressSubscription {
        let mut sessions = self.sessions.lock().expect("bus lock poisoned");
        let sender = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        ProgressSubscription {
            receiver: sender.subscribe(),
            lagged: AtomicU64::new(0),
        }
    }

    /// Publish an event. Non-blocking; a session with no subscribers and no
    /// channel is a no-op. Terminal events close the session afterwards.
    pub fn publish(&self, session_id: &str, payload: ProgressPayload) {
        let terminal = payload.is_terminal();
        let event = ProgressEvent {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            payload,
        };

        let mut sessions = self.sessions.lock().expect("bus lock poisoned");
        if let Some(sender) = sessions.get(session_id) {
            // Err means no live receivers; the event is still buffered for
            // nobody, which is fine — publishers never block or fail.
            let _ = sender.send(event);
        }
        if terminal {
            sessions.remove(session_id);
        }
    }

    /// Number of sessions with an open channel.
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().expect("bus lock poisoned").len()
    }

    /// Periodic keepalive: ping every open session so idle subscribers can
    /// tell a quiet pipeline from a dead connection. Run on the runtime:
    /// `tokio::spawn(bus.clone().keepalive_loop())`.
    pub async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let ids: Vec<String> = {
                let sessions = self.sessions.lock().expect("bus lock poisoned");
                sessions.keys().cloned().collect()
            };
            for id in ids {
                self.publish(&id, ProgressPayload::Ping {});
            }
        }
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct ProgressSubscription {
    receiver: broadcast::Receiver<ProgressEvent>,
    lagged: AtomicU64,
}

impl ProgressSubscription {
    /// Receive the next event. Returns `None` once the session is closed
    /// server-side and the buffer is drained. Falling behind drops the
    /// oldest events and bumps the lagged counter instead of blocking the
    /// publisher.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged.fetch_add(n, Ordering::Relaxed);
                    tracing::debug!(dropped = n, "subscriber lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Total events dropped for this subscriber so far.
    pub fn lagged(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::{SessionStatus, Stage};

    fn started(stage: Stage) -> ProgressPayload {
        ProgressPayload::AgentStarted {
            stage,
            message: format!("{stage} started"),
        }
    }

    fn completed(stage: Stage) -> ProgressPayload {
        ProgressPayload::AgentCompleted {
            stage,
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("s-1");

        bus.publish("s-1", started(Stage::Extraction));
        bus.publish("s-1", completed(Stage::Extraction));
        bus.publish("s-1", started(Stage::Quantitative));

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        let third = sub.recv().await.unwrap();

        assert!(matches!(
            first.payload,
            ProgressPayload::AgentStarted { stage: Stage::Extraction, .. }
        ));
        assert!(matches!(
            second.payload,
            ProgressPayload::AgentCompleted { stage: Stage::Extraction, .. }
        ));
        assert!(matches!(
            third.payload,
            ProgressPayload::AgentStarted { stage: Stage::Quantitative, .. }
        ));
    }

    #[tokio::test]
    async fn all_subscribers_see_every_event() {
        let bus = ProgressBus::new();
        let mut sub_a = bus.subscribe("s-1");
        let mut sub_b = bus.subscribe("s-1");

        bus.publish("s-1", started(Stage::Extraction));

        assert!(sub_a.recv().await.is_some());
        assert!(sub_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let bus = ProgressBus::new();
        let mut sub_other = bus.subscribe("s-2");

        bus.publish("s-1", started(Stage::Extraction));
        bus.publish("s-2", started(Stage::Drafting));

        let event = sub_other.recv().await.unwrap();
        assert_eq!(event.session_id, "s-2");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts_lag() {
        let bus = ProgressBus::with_capacity(4);
        let mut sub = bus.subscribe("s-1");

        for i in 0..10 {
            bus.publish(
                "s-1",
                ProgressPayload::AgentProgress {
                    stage: Stage::Extraction,
                    message: format!("chunk {i}"),
                },
            );
        }

        // The first received event is not the first published one.
        let first = sub.recv().await.unwrap();
        match first.payload {
            ProgressPayload::AgentProgress { message, .. } => {
                assert_ne!(message, "chunk 0");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(sub.lagged() >= 6, "lagged = {}", sub.lagged());
    }

    #[tokio::test]
    async fn workflow_complete_closes_session() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("s-1");

        bus.publish("s-1", started(Stage::Drafting));
        bus.publish(
            "s-1",
            ProgressPayload::WorkflowComplete {
                status: SessionStatus::Matched,
                verdict_summary: "full_match".into(),
            },
        );
        assert_eq!(bus.active_sessions(), 0);

        // Buffered events drain, then the stream ends.
        assert!(sub.recv().await.is_some());
        let last = sub.recv().await.unwrap();
        assert!(last.payload.is_terminal());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = ProgressBus::new();
        bus.publish("ghost", started(Stage::Extraction));
        assert_eq!(bus.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_active_sessions() {
        let bus = Arc::new(ProgressBus::new());
        let mut sub = bus.subscribe("s-1");
        let handle = tokio::spawn(Arc::clone(&bus).keepalive_loop());

        tokio::time::advance(KEEPALIVE_INTERVAL + Duration::from_millis(10)).await;

        let event = sub.recv().await.unwrap();
        assert!(matches!(event.payload, ProgressPayload::Ping {}));
        handle.abort();
    }
}
