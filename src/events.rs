// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event Bus: a bounded, multi-consumer, drop-oldest stream of session lifecycle
//! events.
//!
//! `tokio::sync::broadcast` already implements exactly the semantics wanted here:
//! a slow subscriber that falls behind gets `RecvError::Lagged` rather than
//! blocking the producer. Grounded the same way the protocol crate's own test
//! helper (`metl/mqtt_hub.rs`) uses `broadcast` as a fan-out hub for recorded
//! traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::mode::{ConfiguredMode, HybridSubState};

/// A session lifecycle event, published for observers.
#[derive(Debug, Clone)]
pub enum Event {
    SessionOpened {
        session_id: u64,
        peer: String,
    },
    SessionClosed {
        session_id: u64,
        frames_in: u64,
        duration_ms: u64,
    },
    FrameReceived {
        session_id: u64,
        table_name: String,
        device_id: Option<String>,
        reason: Option<String>,
        crc_ok: bool,
    },
    FrameHandled {
        session_id: u64,
        table_name: String,
        outcome: FrameOutcome,
        rtt_ms: u64,
    },
    ModeTransition {
        session_id: u64,
        configured: ConfiguredMode,
        from: HybridSubState,
        to: HybridSubState,
        fail_count: u32,
    },
}

/// How a single frame was ultimately answered, for [`Event::FrameHandled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The cloud's own reply bytes were written back to the BOX.
    CloudAck,
    /// A locally synthesized `ACK` was written back, whether because the proxy
    /// is offline or because the cloud attempt failed and was rescued.
    LocalAck,
    /// A locally synthesized `END` was written back.
    LocalEnd,
    /// Nothing was written back (the frame's class expects no response).
    NoResponse,
}

const CHANNEL_CAPACITY: usize = 1024;

/// Counts events a subscriber missed because it fell behind: a slow observer
/// drops the oldest events rather than blocking the proxy.
#[derive(Debug, Default)]
pub struct ObserverBackpressure(AtomicU64);

impl ObserverBackpressure {
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn record(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

/// Shared publish side of the bus, held by the listener and handed to every
/// [`crate::engine::BoxSession`].
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is not an error; the bus is useful even when nothing is
        // currently observing.
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream. The returned backpressure counter is shared
    /// so callers can report it alongside connection metrics.
    #[must_use]
    pub fn subscribe(&self) -> (EventSubscription, Arc<ObserverBackpressure>) {
        let backpressure = Arc::new(ObserverBackpressure::default());
        (
            EventSubscription {
                receiver: self.sender.subscribe(),
                backpressure: backpressure.clone(),
            },
            backpressure,
        )
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A single observer's handle to the bus.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
    backpressure: Arc<ObserverBackpressure>,
}

impl EventSubscription {
    /// Wait for the next event, skipping over (and counting) any events dropped
    /// due to lag.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("event subscriber lagged, dropped {skipped} event(s)");
                    self.backpressure.record(skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let (mut sub, _backpressure) = bus.subscribe();
        bus.publish(Event::SessionOpened {
            session_id: 1,
            peer: "127.0.0.1:1234".to_string(),
        });
        match sub.recv().await {
            Some(Event::SessionOpened { session_id, .. }) => assert_eq!(session_id, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_backpressure_counted() {
        let bus = EventBus::new();
        let (mut sub, backpressure) = bus.subscribe();
        for i in 0..(CHANNEL_CAPACITY as u64 + 5) {
            bus.publish(Event::SessionClosed {
                session_id: i,
                frames_in: 0,
                duration_ms: 0,
            });
        }
        // Dropping the bus closes the channel once the backlog is drained, so the
        // loop below terminates instead of waiting forever for a new publish.
        drop(bus);
        while sub.recv().await.is_some() {}
        assert!(backpressure.dropped() > 0);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::SessionClosed {
            session_id: 1,
            frames_in: 0,
            duration_ms: 0,
        });
    }
}
