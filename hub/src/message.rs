use serde::Serialize;
use serde_json::Value;

/// Trait for getting the wire `type` discriminator of a message
pub trait EventType {
    fn event_type(&self) -> &'static str;
}

/// Notifications the platform itself sends to connected clients.
///
/// Serializes as `{"type": "...", "payload": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "Post_created")]
    PostCreated(Value),
    #[serde(rename = "Post_updated")]
    PostUpdated(Value),
    #[serde(rename = "Post_deleted")]
    PostDeleted { id: String },
}

impl EventType for Event {
    fn event_type(&self) -> &'static str {
        match self {
            Event::PostCreated(_) => "Post_created",
            Event::PostUpdated(_) => "Post_updated",
            Event::PostDeleted { .. } => "Post_deleted",
        }
    }
}
