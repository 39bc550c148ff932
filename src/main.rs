use events::EventPublisher;
use hub::domain_event_handler::WsDomainEventHandler;
use hub::Hub;
use log::{error, info};
use service::{config::Config, logging::Logger, AppState};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to initialize logger: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting feed hub [{}] with outbound queue capacity {}",
        config.runtime_env(),
        config.outbound_queue_capacity
    );

    let (hub, coordinator) = Hub::new();
    let hub = Arc::new(hub);
    tokio::spawn(coordinator.run());

    // Domain events flow to every connected WebSocket client.
    let event_publisher =
        EventPublisher::new().with_handler(Arc::new(WsDomainEventHandler::new(hub.clone())));

    let app_state = AppState::new(config, &hub, event_publisher);

    if let Err(e) = web::init_server(app_state).await {
        error!("Server failed: {e}");
        std::process::exit(1);
    }
}
