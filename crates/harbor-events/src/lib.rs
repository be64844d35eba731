#![forbid(unsafe_code)]

//! Core event bus for the Harbor daemon.
//!
//! Publishing fans each event out directly to per-subscriber queues. The
//! queues are unbounded: the daemon models no backpressure between the
//! supervisor and its subscribers, and a publish must never block the event
//! loop. A subscriber that went away is pruned on the next publish, when its
//! queue reports the receiving side closed.
//!
//! Separately from live delivery, the bus keeps a bounded journal of recent
//! envelopes so reconnecting subscribers can catch up from a known event id;
//! entries older than the journal window are gone for good.
//!
//! Every payload is a point-in-time snapshot. Subscribers must not assume a
//! torrent still exists in the session by the time they observe an event.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use harbor_engine::{InfoHash, TorrentStatus};
use tokio::sync::mpsc;

/// Identifier assigned to each event emitted by the daemon.
pub type EventId = u64;

/// Default size of the catch-up journal.
const DEFAULT_JOURNAL_CAPACITY: usize = 1_024;

/// Typed domain events surfaced by the session supervisor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A torrent was admitted into the session.
    TorrentAdded {
        status: TorrentStatus,
    },
    /// A torrent was paused.
    TorrentPaused {
        status: TorrentStatus,
    },
    /// A torrent was resumed.
    TorrentResumed {
        status: TorrentStatus,
    },
    /// A torrent finished downloading real payload data.
    TorrentFinished {
        status: TorrentStatus,
    },
    /// A torrent was removed from the session and the store.
    TorrentRemoved {
        info_hash: InfoHash,
    },
    /// A torrent's payload moved to a new directory.
    StorageMoved {
        info_hash: InfoHash,
        storage_path: String,
    },
    /// Periodic status snapshots for torrents that changed.
    StateUpdate {
        statuses: Vec<TorrentStatus>,
    },
    /// Session-wide counters keyed by metric name.
    SessionStats {
        metrics: BTreeMap<String, i64>,
    },
    /// Media-info extraction completed for a torrent.
    TorrentMediaInfo {
        info_hash: InfoHash,
    },
}

impl Event {
    /// Machine-friendly discriminator; also the workflow trigger name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TorrentAdded { .. } => "torrent-added",
            Event::TorrentPaused { .. } => "torrent-paused",
            Event::TorrentResumed { .. } => "torrent-resumed",
            Event::TorrentFinished { .. } => "torrent-finished",
            Event::TorrentRemoved { .. } => "torrent-removed",
            Event::StorageMoved { .. } => "storage-moved",
            Event::StateUpdate { .. } => "state-update",
            Event::SessionStats { .. } => "session-stats",
            Event::TorrentMediaInfo { .. } => "torrent-mediainfo",
        }
    }
}

/// Metadata wrapper around events tracking the event id and emission time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

struct BusState {
    next_id: EventId,
    journal: VecDeque<Arc<EventEnvelope>>,
    subscribers: Vec<mpsc::UnboundedSender<Arc<EventEnvelope>>>,
}

/// Shared event bus fanning published events out to subscriber queues.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
    journal_capacity: usize,
}

impl EventBus {
    /// Construct a new bus whose catch-up journal holds `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus journal capacity must be positive");
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_id: 1,
                journal: VecDeque::with_capacity(capacity),
                subscribers: Vec::new(),
            })),
            journal_capacity: capacity,
        }
    }

    /// Construct a bus with the default journal size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_JOURNAL_CAPACITY)
    }

    /// Publish a new event, assigning it a sequential identifier and handing
    /// it to every live subscriber. Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if the bus mutex has been poisoned.
    pub fn publish(&self, event: Event) -> EventId {
        let mut state = self.state.lock().expect("event bus mutex poisoned");

        let id = state.next_id;
        state.next_id += 1;
        let envelope = Arc::new(EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        });

        if state.journal.len() == self.journal_capacity {
            state.journal.pop_front();
        }
        state.journal.push_back(Arc::clone(&envelope));

        // A failed send means the stream was dropped; forget the subscriber.
        state
            .subscribers
            .retain(|subscriber| subscriber.send(Arc::clone(&envelope)).is_ok());

        id
    }

    /// Subscribe to the bus. When `since_id` is given, journal entries newer
    /// than it are queued ahead of live events; entries already evicted from
    /// the journal cannot be recovered.
    ///
    /// # Panics
    ///
    /// Panics if the bus mutex has been poisoned.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock().expect("event bus mutex poisoned");

        if let Some(since) = since_id {
            for envelope in state.journal.iter().filter(|envelope| envelope.id > since) {
                let _ = sender.send(Arc::clone(envelope));
            }
        }

        state.subscribers.push(sender);
        EventStream { receiver }
    }

    /// Returns the last assigned identifier, if any events have been
    /// published.
    ///
    /// # Panics
    ///
    /// Panics if the bus mutex has been poisoned.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let state = self.state.lock().expect("event bus mutex poisoned");
        if state.next_id > 1 {
            Some(state.next_id - 1)
        } else {
            None
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a subscription: catch-up entries first, then live
/// events in publish order.
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Arc<EventEnvelope>>,
}

impl EventStream {
    /// Receive the next event, waiting for one to be published. Returns
    /// `None` once the bus has been dropped.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        self.receiver
            .recv()
            .await
            .map(|envelope| (*envelope).clone())
    }

    /// Receive the next event without waiting, when one is already queued.
    pub fn try_next(&mut self) -> Option<EventEnvelope> {
        self.receiver
            .try_recv()
            .ok()
            .map(|envelope| (*envelope).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(name: &str) -> Event {
        Event::TorrentAdded {
            status: TorrentStatus {
                name: name.to_string(),
                ..TorrentStatus::default()
            },
        }
    }

    #[tokio::test]
    async fn sequential_ids_and_catch_up() {
        let bus = EventBus::with_capacity(16);
        assert_eq!(bus.last_event_id(), None);

        let mut last_id = 0;
        for i in 0..5 {
            last_id = bus.publish(sample_event(&format!("t{i}")));
        }
        assert_eq!(last_id, 5);
        assert_eq!(bus.last_event_id(), Some(5));

        let mut stream = bus.subscribe(Some(2));
        let mut received = Vec::new();
        for _ in 0..3 {
            if let Some(event) = stream.next().await {
                received.push(event);
            }
        }

        assert_eq!(received.len(), 3);
        assert_eq!(received.first().map(|event| event.id), Some(3));
        assert_eq!(received.last().map(|event| event.id), Some(5));
    }

    #[tokio::test]
    async fn kind_matches_workflow_trigger_names() {
        assert_eq!(sample_event("t").kind(), "torrent-added");
        assert_eq!(
            Event::SessionStats {
                metrics: BTreeMap::new()
            }
            .kind(),
            "session-stats"
        );
        assert_eq!(
            Event::TorrentMediaInfo {
                info_hash: InfoHash::default()
            }
            .kind(),
            "torrent-mediainfo"
        );
    }

    #[tokio::test]
    async fn every_live_subscriber_receives_each_event() {
        let bus = EventBus::with_capacity(8);
        let mut first = bus.subscribe(None);
        let mut second = bus.subscribe(None);

        bus.publish(sample_event("t1"));

        assert_eq!(first.next().await.map(|event| event.id), Some(1));
        assert_eq!(second.next().await.map(|event| event.id), Some(1));
    }

    #[tokio::test]
    async fn journal_evicts_oldest_entries() {
        let bus = EventBus::with_capacity(4);
        for i in 0..6 {
            bus.publish(sample_event(&format!("t{i}")));
        }
        let mut stream = bus.subscribe(Some(0));
        let first = stream.next().await.expect("first catch-up event");
        assert_eq!(first.id, 3, "events 1 and 2 fell out of the journal");
    }

    #[tokio::test]
    async fn dropped_streams_are_pruned_without_blocking_publishers() {
        let bus = EventBus::with_capacity(8);
        let stream = bus.subscribe(None);
        drop(stream);

        // The dead queue is discarded on the next publish; a live subscriber
        // still sees everything after it.
        bus.publish(sample_event("t1"));
        let mut live = bus.subscribe(None);
        bus.publish(sample_event("t2"));
        assert_eq!(live.next().await.map(|event| event.id), Some(2));
    }
}
