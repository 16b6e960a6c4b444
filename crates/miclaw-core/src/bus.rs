// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Fan-out event bus with per-subscriber back-pressure.
//!
//! Every subscriber gets its own bounded queue; a slow subscriber never
//! blocks the agent.  On overflow the *newest* event is dropped for that
//! subscriber (and logged), so the already-queued prefix keeps per-session
//! delivery order intact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::AgentEvent;

/// Per-subscriber queue depth.
const SUBSCRIBER_QUEUE: usize = 64;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<AgentEvent>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber.  Dropping the subscription (or calling
    /// [`Subscription::unsubscribe`], which is idempotent) deregisters it.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("bus mutex poisoned")
            .push(Subscriber { id, tx });
        debug!(subscriber = id, "event bus subscriber added");
        Subscription {
            rx,
            bus: self.clone(),
            id,
            active: true,
        }
    }

    /// Deliver `event` to every subscriber.  Never blocks.
    pub fn publish(&self, event: AgentEvent) {
        let mut subs = self.subscribers.lock().expect("bus mutex poisoned");
        subs.retain(|sub| {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    warn!(
                        subscriber = sub.id,
                        session_id = %dropped.session_id,
                        "subscriber queue full, dropping newest event"
                    );
                    true
                }
                // Receiver gone without unsubscribe; prune it.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus mutex poisoned").len()
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("bus mutex poisoned")
            .retain(|s| s.id != id);
    }
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    pub rx: mpsc::Receiver<AgentEvent>,
    bus: EventBus,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Receive the next event; `None` after unsubscribe once the queue
    /// drains.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.rx.try_recv().ok()
    }

    /// Idempotent deregistration.
    pub fn unsubscribe(&mut self) {
        if self.active {
            self.active = false;
            self.bus.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn event(session: &str, n: usize) -> AgentEvent {
        AgentEvent::delta(session, format!("d{n}"))
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(event("s1", 0));
        for sub in [&mut a, &mut b] {
            let ev = sub.recv().await.unwrap();
            assert_eq!(ev.session_id, "s1");
        }
    }

    #[tokio::test]
    async fn per_session_order_is_preserved() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for n in 0..10 {
            bus.publish(event("s1", n));
        }
        for n in 0..10 {
            match sub.recv().await.unwrap().kind {
                crate::EventKind::Delta(text) => assert_eq!(text, format!("d{n}")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_keeps_prefix() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        // Fill well past the queue depth without draining.
        for n in 0..(SUBSCRIBER_QUEUE + 20) {
            bus.publish(event("s1", n));
        }
        // The received subsequence must be exactly the first
        // SUBSCRIBER_QUEUE events, in order (a prefix, per the ordering
        // contract).
        for n in 0..SUBSCRIBER_QUEUE {
            match sub.try_recv().unwrap().kind {
                crate::EventKind::Delta(text) => assert_eq!(text, format!("d{n}")),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::new();
        let _stuck = bus.subscribe(); // never drained
        let start = std::time::Instant::now();
        for n in 0..1000 {
            bus.publish(event("s1", n));
        }
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_subscription_deregisters() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned_on_publish() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        // Kill the receiver half while the registration stays behind, as if
        // the subscriber task died without unsubscribing.
        let (_tx, dummy_rx) = mpsc::channel(1);
        drop(std::mem::replace(&mut sub.rx, dummy_rx));
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(event("s1", 0));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
