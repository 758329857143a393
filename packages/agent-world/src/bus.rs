//! Per-world event bus.
//!
//! The bus serves observers (CLI, SSE transport, recorders). Agent pipelines
//! get their messages through their own unbounded inboxes, filled by the
//! world's dispatch, and never read from here.
//!
//! # Guarantees
//!
//! - **Ordered**: every subscriber observes messages in publish order
//! - **Enqueued on publish**: a message is in every current subscriber's
//!   queue before `publish_message` returns
//! - **In-memory only**: nothing is persisted, late subscribers see nothing
//!   published before they subscribed
//! - **Isolated**: a bus only carries values tagged with its own world id
//!
//! Slow observers can lag (`RecvError::Lagged`); handler subscriptions log
//! the gap and keep going.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::WorldId;
use crate::events::{WorldEvent, WorldMessage};

/// Default channel capacity for a world bus.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast bus owned by one world.
///
/// Cloning shares the underlying channels.
#[derive(Clone)]
pub struct EventBus {
    world_id: WorldId,
    messages: broadcast::Sender<WorldMessage>,
    events: broadcast::Sender<WorldEvent>,
}

impl EventBus {
    /// Create a bus for `world_id` with default capacity.
    pub fn new(world_id: impl Into<WorldId>) -> Self {
        Self::with_capacity(world_id, DEFAULT_CAPACITY)
    }

    /// Create a bus with the given capacity per channel.
    pub fn with_capacity(world_id: impl Into<WorldId>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (messages, _) = broadcast::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        Self {
            world_id: world_id.into(),
            messages,
            events,
        }
    }

    pub fn world_id(&self) -> &str {
        &self.world_id
    }

    /// Publish a message to every message subscriber.
    ///
    /// Returns the number of receivers, or 0 when the message belongs to
    /// another world (it is dropped).
    pub fn publish_message(&self, message: WorldMessage) -> usize {
        if message.world_id != self.world_id {
            warn!(
                world_id = %self.world_id,
                foreign_world = %message.world_id,
                "dropping message from another world"
            );
            return 0;
        }
        self.messages.send(message).unwrap_or(0)
    }

    /// Publish a stream event or notice to every event subscriber.
    pub fn publish_event(&self, event: impl Into<WorldEvent>) -> usize {
        let event = event.into();
        if event.world_id() != self.world_id {
            warn!(
                world_id = %self.world_id,
                foreign_world = %event.world_id(),
                "dropping event from another world"
            );
            return 0;
        }
        self.events.send(event).unwrap_or(0)
    }

    /// Raw receiver for messages published after this call.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<WorldMessage> {
        self.messages.subscribe()
    }

    /// Raw receiver for events published after this call.
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorldEvent> {
        self.events.subscribe()
    }

    /// Run `handler` for every message until the subscription is released.
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(WorldMessage) + Send + Sync + 'static,
    {
        Subscription::spawn(self.world_id.clone(), self.subscribe_messages(), handler)
    }

    /// Run `handler` for every stream event and notice until released.
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(WorldEvent) + Send + Sync + 'static,
    {
        Subscription::spawn(self.world_id.clone(), self.subscribe_events(), handler)
    }

    /// Current number of message observers.
    pub fn message_subscriber_count(&self) -> usize {
        self.messages.receiver_count()
    }

    pub fn event_subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("world_id", &self.world_id)
            .field("message_subscribers", &self.message_subscriber_count())
            .field("event_subscribers", &self.event_subscriber_count())
            .finish()
    }
}

/// Handle to a handler task registered on a bus.
///
/// `unsubscribe` consumes the handle, so a subscription can only be released
/// once. Dropping the handle releases it too.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    fn spawn<T, F>(world_id: WorldId, mut receiver: broadcast::Receiver<T>, handler: F) -> Self
    where
        T: Clone + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(value) => handler(value),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(world_id = %world_id, skipped, "subscriber lagged, values skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(world_id = %world_id, "bus closed, subscription ending");
                        break;
                    }
                }
            }
        });
        Self { handle }
    }

    /// Stop delivering to this handler.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    /// True while the handler task is still running.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
