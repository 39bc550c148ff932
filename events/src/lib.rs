//! Event system infrastructure for the feed hub.
//!
//! Collaborators that change application state (post creation, editing,
//! removal) publish a [`DomainEvent`] once the change has succeeded. Handlers
//! registered on the [`EventPublisher`] turn those events into side effects,
//! the main one being a WebSocket fan-out through the hub.
//!
//! # Architecture
//!
//! - **DomainEvent**: Enum representing all business events in the system
//! - **EventHandler**: Trait for implementing event handlers
//! - **EventPublisher**: Publishes events to registered handlers
//!
//! This crate has no dependencies on internal crates, so the web layer and the
//! hub can both depend on it without cycles. Entity data travels as
//! serialized JSON values.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier type shared by entities and live connections.
pub type Id = Uuid;

/// Domain events that represent business-level changes in the system.
/// These events are emitted after the underlying operation has succeeded.
///
/// `exclude_connection` names a live connection that should not be notified,
/// typically the one whose client originated the change and already has the
/// new state.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// A post was created.
    PostCreated {
        /// Complete serialized post entity.
        post: Value,
        exclude_connection: Option<Id>,
    },
    /// An existing post was modified.
    PostUpdated {
        /// Complete updated post entity with all current field values.
        post: Value,
        exclude_connection: Option<Id>,
    },
    /// A post was permanently removed. Only the id is carried since the
    /// entity no longer exists.
    PostDeleted {
        post_id: String,
        exclude_connection: Option<Id>,
    },
}

impl DomainEvent {
    /// The connection, if any, that should be skipped when notifying clients.
    pub fn exclude_connection(&self) -> Option<Id> {
        match self {
            DomainEvent::PostCreated {
                exclude_connection, ..
            }
            | DomainEvent::PostUpdated {
                exclude_connection, ..
            }
            | DomainEvent::PostDeleted {
                exclude_connection, ..
            } => *exclude_connection,
        }
    }
}

/// Trait for handling domain events.
/// Implementations can perform side effects like sending notifications,
/// updating caches, logging, etc.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent);
}

/// Publishes domain events to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    /// Note: This creates a new publisher instance with the additional handler.
    /// Store the returned publisher in your application state.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Publish an event to all registered handlers, one after another.
    pub async fn publish(&self, event: DomainEvent) {
        for handler in self.handlers.iter() {
            handler.handle(&event).await;
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
