//! Segment-state fan-out to live subscribers.
//!
//! Each content id has its own subscriber set and a cached last state that
//! is replayed to late joiners. Publishing and subscribing share one lock,
//! so a subscriber never misses a state published between its replay and
//! its registration, and states for one content id arrive in publish order.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Where the derived stream for a content id currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    Preparing,
    Transcoding,
    Ready,
    Failed,
}

/// State pushed to players watching a content id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentState {
    pub content_id: i64,
    pub phase: StreamPhase,
    pub latest_segment: Option<String>,
    pub segment_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl SegmentState {
    pub fn new(content_id: i64, phase: StreamPhase) -> Self {
        Self {
            content_id,
            phase,
            latest_segment: None,
            segment_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_segment(mut self, segment: impl Into<String>, segment_count: u32) -> Self {
        self.latest_segment = Some(segment.into());
        self.segment_count = segment_count;
        self
    }
}

/// Payloads queued per in-process subscription before it counts as stuck.
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// Why a sink refused a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscriber connection closed")]
    Closed,

    #[error("subscriber is not keeping up")]
    Full,
}

/// A live connection that accepts serialized state payloads.
///
/// `deliver` must not block; socket writers queue the payload and write it
/// from their own task.
pub trait StateSink: Send + Sync {
    fn deliver(&self, payload: &str) -> Result<(), DeliveryError>;
}

/// Sink that forwards payloads into a bounded channel.
///
/// A full channel fails the delivery, so a reader that stops draining is
/// dropped instead of buffering without limit.
pub struct ChannelSink {
    sender: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl StateSink for ChannelSink {
    fn deliver(&self, payload: &str) -> Result<(), DeliveryError> {
        self.sender
            .try_send(payload.to_string())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }
}

/// Identifier handed out for each registered sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Default)]
struct Channels {
    subscribers: HashMap<i64, Vec<(SubscriberId, Arc<dyn StateSink>)>>,
    last_state: HashMap<i64, Arc<str>>,
}

struct BroadcasterInner {
    channels: Mutex<Channels>,
    next_id: AtomicU64,
}

/// Pushes [`SegmentState`] updates to every subscriber of a content id.
#[derive(Clone)]
pub struct SegmentStateBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Default for SegmentStateBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentStateBroadcaster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                channels: Mutex::new(Channels::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `sink` for `content_id`, replaying the cached state first.
    ///
    /// A sink that fails the replay is not registered.
    ///
    /// # Errors
    ///
    /// - `DeliveryError` - The sink rejected the replayed state
    pub fn subscribe_sink(
        &self,
        content_id: i64,
        sink: Arc<dyn StateSink>,
    ) -> Result<SubscriberId, DeliveryError> {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.inner.channels.lock();

        if let Some(last) = channels.last_state.get(&content_id) {
            sink.deliver(last)?;
        }

        channels
            .subscribers
            .entry(content_id)
            .or_default()
            .push((id, sink));

        debug!(content_id, subscriber = id.0, "Subscriber added");
        Ok(id)
    }

    /// Subscribes an in-process receiver that unsubscribes when dropped.
    pub fn subscribe(&self, content_id: i64) -> StateSubscription {
        let (sink, receiver) = ChannelSink::new(SUBSCRIPTION_BUFFER);
        // The receiver is alive and empty, so the replay cannot fail
        let id = self.subscribe_sink(content_id, Arc::new(sink)).ok();

        StateSubscription {
            content_id,
            id,
            receiver,
            broadcaster: Arc::downgrade(&self.inner),
        }
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, content_id: i64, id: SubscriberId) -> bool {
        let mut channels = self.inner.channels.lock();
        remove_subscriber(&mut channels, content_id, id)
    }

    /// Caches `state` and pushes it to every current subscriber.
    ///
    /// Subscribers that fail delivery are dropped; the rest still receive
    /// the state. Returns the number of successful deliveries.
    ///
    /// # Errors
    ///
    /// - `serde_json::Error` - The state could not be serialized
    pub fn publish(&self, state: &SegmentState) -> Result<usize, serde_json::Error> {
        let payload: Arc<str> = serde_json::to_string(state)?.into();
        let content_id = state.content_id;

        let mut channels = self.inner.channels.lock();
        channels.last_state.insert(content_id, payload.clone());

        let Some(sinks) = channels.subscribers.get_mut(&content_id) else {
            return Ok(0);
        };

        let before = sinks.len();
        sinks.retain(|(id, sink)| match sink.deliver(&payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(content_id, subscriber = id.0, "Dropping subscriber: {e}");
                false
            }
        });
        let delivered = sinks.len();

        if sinks.is_empty() {
            channels.subscribers.remove(&content_id);
        }

        debug!(content_id, delivered, dropped = before - delivered, "State published");
        Ok(delivered)
    }

    /// Cached serialized state for `content_id`.
    pub fn last_state(&self, content_id: i64) -> Option<String> {
        self.inner
            .channels
            .lock()
            .last_state
            .get(&content_id)
            .map(|payload| payload.to_string())
    }

    pub fn subscriber_count(&self, content_id: i64) -> usize {
        self.inner
            .channels
            .lock()
            .subscribers
            .get(&content_id)
            .map_or(0, Vec::len)
    }
}

fn remove_subscriber(channels: &mut Channels, content_id: i64, id: SubscriberId) -> bool {
    let Some(sinks) = channels.subscribers.get_mut(&content_id) else {
        return false;
    };

    let before = sinks.len();
    sinks.retain(|(existing, _)| *existing != id);
    let removed = sinks.len() != before;

    if sinks.is_empty() {
        channels.subscribers.remove(&content_id);
    }
    removed
}

/// Live stream of serialized states for one content id.
pub struct StateSubscription {
    content_id: i64,
    id: Option<SubscriberId>,
    receiver: mpsc::Receiver<String>,
    broadcaster: Weak<BroadcasterInner>,
}

impl StateSubscription {
    pub fn content_id(&self) -> i64 {
        self.content_id
    }

    /// Next state, or `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Next state if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

impl futures::Stream for StateSubscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        let (Some(id), Some(inner)) = (self.id, self.broadcaster.upgrade()) else {
            return;
        };
        remove_subscriber(&mut inner.channels.lock(), self.content_id, id);
    }
}
