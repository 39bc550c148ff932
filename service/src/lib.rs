use config::Config;
use events::EventPublisher;
use hub::Hub;
use std::sync::Arc;

pub mod config;
pub mod logging;

// Service-level state shared by every request handler.
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub hub: Arc<Hub>,
    pub event_publisher: EventPublisher,
}

impl AppState {
    pub fn new(app_config: Config, hub: &Arc<Hub>, event_publisher: EventPublisher) -> Self {
        Self {
            config: app_config,
            hub: Arc::clone(hub),
            event_publisher,
        }
    }
}
