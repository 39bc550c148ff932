use crate::{AppState, Error};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures::StreamExt;
use hub::error::Error as HubError;
use hub::{run_send_pump, Connection, Hub};
use log::*;
use std::net::SocketAddr;
use std::sync::Arc;

/// GET upgrade to a WebSocket that receives every broadcast notification.
#[utoipa::path(
    get,
    path = "/ws",
    responses(
        (status = 101, description = "Switched to the WebSocket protocol"),
        (status = 400, description = "Request is not a valid WebSocket upgrade"),
        (status = 426, description = "Upgrade Required"),
        (status = 503, description = "Connection hub is not running")
    )
)]
pub(crate) async fn ws_handler(
    State(app_state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Result<Response, Error> {
    if !app_state.hub.is_running() {
        warn!("Refusing WebSocket upgrade from {remote_addr}: hub is not running");
        return Err(HubError::coordinator_unavailable().into());
    }

    debug!("Upgrading WebSocket connection from {remote_addr}");

    let hub = app_state.hub.clone();
    let capacity = app_state.config.outbound_queue_capacity;

    Ok(ws
        .on_failed_upgrade(move |e| warn!("WebSocket upgrade from {remote_addr} failed: {e}"))
        .on_upgrade(move |socket| serve_connection(socket, remote_addr, hub, capacity)))
}

/// Register the upgraded socket with the hub and run it until either side
/// goes away.
async fn serve_connection(
    socket: WebSocket,
    remote_addr: SocketAddr,
    hub: Arc<Hub>,
    capacity: usize,
) {
    let (sink, mut stream) = socket.split();
    let (connection, outbound) = Connection::new(remote_addr, capacity);

    if let Err(e) = hub.register(connection.clone()) {
        warn!("Dropping WebSocket connection from {remote_addr}: {e}");
        return;
    }

    let pump = tokio::spawn({
        let connection = connection.clone();
        let hub = hub.clone();
        async move { run_send_pump(connection, outbound, sink, &hub).await }
    });

    // Clients have nothing to say to the hub; read only to notice when they leave.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(reason)) => {
                debug!("Client {connection} sent close: {reason:?}");
                break;
            }
            Ok(Message::Text(text)) => {
                trace!("Ignoring {} byte text frame from {connection}", text.as_str().len());
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Read from {connection} failed: {e}");
                break;
            }
        }
    }

    connection.close();
    if let Err(e) = pump.await {
        error!("Send pump for {connection} panicked: {e}");
    }
}
