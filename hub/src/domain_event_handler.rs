use crate::connection::ConnectionId;
use crate::message::{Event, EventType};
use crate::Hub;
use async_trait::async_trait;
use events::{DomainEvent, EventHandler};
use log::*;
use std::sync::Arc;

/// Handles domain events by converting them to WebSocket messages and
/// broadcasting them to every connected client.
///
/// The collaborator that emitted the event decides which connection, if any,
/// to leave out; this handler only translates and routes.
pub struct WsDomainEventHandler {
    hub: Arc<Hub>,
}

impl WsDomainEventHandler {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    fn to_ws_event(event: &DomainEvent) -> Event {
        match event {
            DomainEvent::PostCreated { post, .. } => Event::PostCreated(post.clone()),
            DomainEvent::PostUpdated { post, .. } => Event::PostUpdated(post.clone()),
            DomainEvent::PostDeleted { post_id, .. } => Event::PostDeleted {
                id: post_id.clone(),
            },
        }
    }
}

#[async_trait]
impl EventHandler for WsDomainEventHandler {
    async fn handle(&self, event: &DomainEvent) {
        let ws_event = Self::to_ws_event(event);
        let exclude = event.exclude_connection().map(ConnectionId::from);

        let delivered = self.hub.broadcast(&ws_event, exclude.as_ref());
        debug!(
            "Handled {} domain event, queued for {delivered} connection(s)",
            ws_event.event_type()
        );
    }
}
