//! In-process event hub.
//!
//! `publish` appends to the durable log first, then fans out to subscribers
//! with non-blocking sends. A subscriber whose queue stays full past the
//! slow-consumer timeout is dropped; because the log is durable, a dropped
//! subscriber reconnects with its last-seen sequence and misses nothing.

use coven_core::events::{EventPayload, EventType};
use coven_core::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::storage::{Storage, StorageError};

/// Queue depth per subscriber before sends start failing.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, BusError>;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
    /// Set when the first send fails; cleared when a send succeeds.
    full_since: Option<Instant>,
}

/// Process-wide publish/subscribe hub backed by the event log.
pub struct EventBus {
    storage: Arc<Storage>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
    slow_consumer_timeout: Duration,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(storage: Arc<Storage>, slow_consumer_timeout: Duration) -> Self {
        Self {
            storage,
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            slow_consumer_timeout,
        }
    }

    /// Durably append an event, then fan it out to live subscribers.
    pub async fn publish(
        &self,
        event_type: EventType,
        entity_kind: &str,
        entity_id: &str,
        payload: EventPayload,
    ) -> Result<Event> {
        let event = self
            .storage
            .append_event(event_type, entity_kind, entity_id, &payload)
            .await?;
        self.fan_out(&event).await;
        Ok(event)
    }

    /// Register a subscriber; returns its id and the receiving end.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().await.push(Subscriber {
            id,
            tx,
            full_since: None,
        });
        (id, rx)
    }

    /// Remove a subscriber explicitly (on client disconnect).
    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().await.retain(|s| s.id != id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    async fn fan_out(&self, event: &Event) {
        let mut subscribers = self.subscribers.lock().await;
        let timeout = self.slow_consumer_timeout;
        subscribers.retain_mut(|sub| {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    sub.full_since = None;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = sub.id, "dropping closed subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let since = *sub.full_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > timeout {
                        warn!(
                            subscriber = sub.id,
                            timeout_ms = timeout.as_millis() as u64,
                            "dropping slow consumer"
                        );
                        false
                    } else {
                        true
                    }
                }
            }
        });
    }
}
