use crate::error::Error;
use crate::hub::Hub;
use axum::extract::ws::{Message, Utf8Bytes};
use futures::{Sink, SinkExt};
use log::*;
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;

/// A serialized message ready to be written to a client as a text frame.
/// Cloning shares the underlying buffer.
pub type Payload = Utf8Bytes;

/// Unique identifier for a connection, generated by the hub at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live client session.
///
/// Owns the producer side of a bounded outbound queue. When the queue is full
/// the oldest pending message is evicted to make room, so producers never
/// wait on a slow client. The consumer side ([`Outbound`]) belongs to the
/// connection's send pump.
pub struct Connection {
    id: OnceLock<ConnectionId>,
    remote_addr: SocketAddr,
    // `None` once the connection has been closed
    sender: Mutex<Option<broadcast::Sender<Payload>>>,
    connected_at: Instant,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection for a freshly upgraded socket.
    ///
    /// `capacity` is the number of messages the outbound queue holds before
    /// it starts evicting the oldest ones, and must be at least 1.
    pub fn new(remote_addr: SocketAddr, capacity: usize) -> (Arc<Self>, Outbound) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        let connection = Arc::new(Self {
            id: OnceLock::new(),
            remote_addr,
            sender: Mutex::new(Some(tx)),
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        });
        let outbound = Outbound {
            rx,
            connection: connection.clone(),
        };
        (connection, outbound)
    }

    /// Identity assigned by the hub, `None` until registration is applied.
    pub fn id(&self) -> Option<ConnectionId> {
        self.id.get().copied()
    }

    // Registering the same connection twice keeps the first identity.
    pub(crate) fn assign_id(&self) -> ConnectionId {
        *self.id.get_or_init(ConnectionId::new)
    }

    /// Peer address captured at upgrade time, for log output only.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Append a message to the outbound queue without waiting.
    ///
    /// Returns `false` if the connection is closed.
    pub fn enqueue(&self, payload: Payload) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Close the outbound queue. The send pump writes whatever is still
    /// queued and then terminates. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Total messages evicted from the queue because it was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    fn record_dropped(&self, count: u64) {
        let _ = self.dropped_messages.fetch_add(count, Ordering::Relaxed);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{id} ({})", self.remote_addr()),
            None => write!(f, "unregistered ({})", self.remote_addr()),
        }
    }
}

/// Consumer side of a connection's outbound queue, in FIFO order.
pub struct Outbound {
    rx: broadcast::Receiver<Payload>,
    connection: Arc<Connection>,
}

impl Outbound {
    /// Wait for the next queued message. Returns `None` once the connection
    /// is closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next queued message if one is ready.
    pub fn try_recv(&mut self) -> Option<Payload> {
        loop {
            match self.rx.try_recv() {
                Ok(payload) => return Some(payload),
                Err(TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn lagged(&self, skipped: u64) {
        self.connection.record_dropped(skipped);
        warn!(
            "Outbound queue full for connection {}, dropped {skipped} oldest message(s)",
            self.connection
        );
    }
}

/// Drain `outbound` onto `sink`, one text frame per message, until the queue
/// is closed or a write fails. Either way the connection is closed and
/// submitted to `hub` for deregistration before returning.
pub async fn run_send_pump<S>(
    connection: Arc<Connection>,
    mut outbound: Outbound,
    mut sink: S,
    hub: &Hub,
) -> Result<(), Error>
where
    S: Sink<Message> + Unpin,
    S::Error: StdError + Send + Sync + 'static,
{
    debug!("Send pump started for connection {connection}");

    let mut result = Ok(());
    while let Some(payload) = outbound.recv().await {
        trace!("Writing {} byte(s) to connection {connection}", payload.as_str().len());
        if let Err(e) = sink.send(Message::Text(payload)).await {
            warn!("Write to connection {connection} failed: {e}");
            result = Err(Error::transport(e));
            break;
        }
    }

    connection.close();
    if let Err(e) = hub.unregister(connection.clone()) {
        debug!("Connection {connection} not deregistered: {e}");
    }

    debug!("Send pump stopped for connection {connection}");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubErrorKind;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn text(frame: Message) -> String {
        match frame {
            Message::Text(text) => text.as_str().to_owned(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[test]
    fn new_connection_has_no_identity() {
        let (conn, _outbound) = Connection::new(addr(), 8);
        assert!(conn.id().is_none());
        assert!(!conn.is_closed());
        assert_eq!(conn.to_string(), "unregistered (127.0.0.1:40000)");
    }

    #[test]
    fn assign_id_is_stable() {
        let (conn, _outbound) = Connection::new(addr(), 8);
        let first = conn.assign_id();
        let second = conn.assign_id();
        assert_eq!(first, second);
        assert_eq!(conn.id(), Some(first));
        assert_eq!(conn.remote_addr(), addr());
        assert_eq!(conn.to_string(), format!("{first} (127.0.0.1:40000)"));
    }

    #[test]
    fn enqueue_is_fifo() {
        let (conn, mut outbound) = Connection::new(addr(), 8);
        for msg in ["m1", "m2", "m3"] {
            assert!(conn.enqueue(msg.into()));
        }
        assert_eq!(outbound.try_recv().unwrap().as_str(), "m1");
        assert_eq!(outbound.try_recv().unwrap().as_str(), "m2");
        assert_eq!(outbound.try_recv().unwrap().as_str(), "m3");
        assert!(outbound.try_recv().is_none());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let (conn, mut outbound) = Connection::new(addr(), 2);
        for msg in ["m1", "m2", "m3", "m4"] {
            assert!(conn.enqueue(msg.into()));
        }
        assert_eq!(outbound.try_recv().unwrap().as_str(), "m3");
        assert_eq!(outbound.try_recv().unwrap().as_str(), "m4");
        assert!(outbound.try_recv().is_none());
        assert_eq!(conn.drop_count(), 2);
    }

    #[test]
    fn closed_connection_rejects_enqueue() {
        let (conn, _outbound) = Connection::new(addr(), 8);
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert!(!conn.enqueue("late".into()));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let (conn, mut outbound) = Connection::new(addr(), 0);
        assert!(conn.enqueue("only".into()));
        assert_eq!(outbound.try_recv().unwrap().as_str(), "only");
    }

    #[tokio::test]
    async fn pump_writes_in_enqueue_order() {
        let (hub, _coordinator) = Hub::new();
        let (conn, outbound) = Connection::new(addr(), 8);
        let (sink, mut wire) = fmpsc::unbounded::<Message>();

        for msg in ["m1", "m2", "m3"] {
            assert!(conn.enqueue(msg.into()));
        }
        conn.close();

        run_send_pump(conn.clone(), outbound, sink, &hub)
            .await
            .unwrap();

        let written: Vec<String> = wire.by_ref().map(text).collect().await;
        assert_eq!(written, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn pump_waits_for_messages_while_queue_is_empty() {
        let (hub, _coordinator) = Hub::new();
        let hub = Arc::new(hub);
        let (conn, outbound) = Connection::new(addr(), 8);
        let (sink, mut wire) = fmpsc::unbounded::<Message>();

        let pump = tokio::spawn({
            let conn = conn.clone();
            let hub = hub.clone();
            async move { run_send_pump(conn, outbound, sink, &hub).await }
        });

        assert!(conn.enqueue("later".into()));
        assert_eq!(text(wire.next().await.unwrap()), "later");
        assert!(!pump.is_finished());

        conn.close();
        pump.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pump_stops_and_closes_on_write_failure() {
        let (hub, _coordinator) = Hub::new();
        let (conn, outbound) = Connection::new(addr(), 8);
        let (sink, wire) = fmpsc::unbounded::<Message>();
        drop(wire);

        assert!(conn.enqueue("lost".into()));
        let err = run_send_pump(conn.clone(), outbound, sink, &hub)
            .await
            .unwrap_err();

        assert_eq!(err.error_kind, HubErrorKind::Transport);
        assert!(conn.is_closed());
        assert!(!conn.enqueue("after".into()));
    }
}
