//! Commit notification decorator.
//!
//! Wraps any [`AggregateEventStore`] and, after a commit has succeeded,
//! publishes each committed event on a broadcast channel and walks the
//! registered listeners in order. The commit is already durable by then, so
//! a failing listener is logged and skipped, never propagated.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use common::AggregateId;

use crate::{EventEnvelope, Result, store::AggregateEventStore};

/// Capacity of the broadcast channel. Slow subscribers that fall further
/// behind than this lose events (`RecvError::Lagged`).
const BROADCAST_CAPACITY: usize = 256;

/// A callback invoked for every durably committed event.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(
        &self,
        event: &EventEnvelope,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Decorator that notifies listeners and broadcast subscribers after commits.
pub struct NotifyingEventStore {
    inner: Arc<dyn AggregateEventStore>,
    sender: broadcast::Sender<EventEnvelope>,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl NotifyingEventStore {
    /// Wraps an existing store.
    pub fn new(inner: Arc<dyn AggregateEventStore>) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner,
            sender,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to the stream of committed events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Registers a listener invoked sequentially after each commit.
    pub async fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().await.push(listener);
    }

    async fn notify(&self, events: &[EventEnvelope]) {
        let listeners = self.listeners.read().await.clone();
        for event in events {
            // A send only fails when nobody is subscribed.
            let _ = self.sender.send(event.clone());
            for listener in &listeners {
                if let Err(e) = listener.on_event(event).await {
                    tracing::warn!(
                        event_id = %event.event_id,
                        event_type = %event.type_tag,
                        error = %e,
                        "event listener failed; commit is already durable, continuing"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl AggregateEventStore for NotifyingEventStore {
    async fn get_events_of(&self, aggregate_id: AggregateId) -> Result<Vec<EventEnvelope>> {
        self.inner.get_events_of(aggregate_id).await
    }

    async fn commit_event(&self, event: EventEnvelope) -> Result<()> {
        self.inner.commit_event(event.clone()).await?;
        self.notify(std::slice::from_ref(&event)).await;
        Ok(())
    }

    async fn commit_all_events(&self, events: Vec<EventEnvelope>) -> Result<()> {
        self.inner.commit_all_events(events.clone()).await?;
        self.notify(&events).await;
        Ok(())
    }
}
