use crate::connection::{Connection, ConnectionId, Payload};
use crate::error::Error;
use log::*;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

type ClientSet = Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>;

/// Snapshot of the client set published by the coordinator after every
/// registration or deregistration event it processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Membership {
    /// Number of intake events processed so far, no-ops included.
    pub generation: u64,
    /// Registered connections after the latest event.
    pub clients: usize,
}

/// Registry of live connections and the fan-out engine.
///
/// Any task may submit connections for registration or deregistration and
/// broadcast messages. Structural changes to the client set are applied only
/// by the paired [`Coordinator`], one event at a time.
pub struct Hub {
    clients: ClientSet,
    register_tx: mpsc::UnboundedSender<Arc<Connection>>,
    unregister_tx: mpsc::UnboundedSender<Arc<Connection>>,
    membership: watch::Receiver<Membership>,
}

/// The single task allowed to mutate the hub's client set.
pub struct Coordinator {
    clients: ClientSet,
    register_rx: mpsc::UnboundedReceiver<Arc<Connection>>,
    unregister_rx: mpsc::UnboundedReceiver<Arc<Connection>>,
    membership: watch::Sender<Membership>,
    generation: u64,
}

impl Hub {
    /// Create a hub and its coordinator. The coordinator must be driven with
    /// [`Coordinator::run`] for submissions to take effect.
    pub fn new() -> (Self, Coordinator) {
        let clients: ClientSet = Arc::new(RwLock::new(HashMap::new()));
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (membership_tx, membership_rx) = watch::channel(Membership::default());

        let hub = Self {
            clients: clients.clone(),
            register_tx,
            unregister_tx,
            membership: membership_rx,
        };
        let coordinator = Coordinator {
            clients,
            register_rx,
            unregister_rx,
            membership: membership_tx,
            generation: 0,
        };
        (hub, coordinator)
    }

    /// Hand a connection to the coordinator for registration.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), Error> {
        self.register_tx
            .send(connection)
            .map_err(|_| Error::coordinator_unavailable())
    }

    /// Hand a connection to the coordinator for removal. Submitting the same
    /// connection more than once is harmless.
    pub fn unregister(&self, connection: Arc<Connection>) -> Result<(), Error> {
        self.unregister_tx
            .send(connection)
            .map_err(|_| Error::coordinator_unavailable())
    }

    /// Serialize `message` once and enqueue it on every registered connection
    /// except `exclude`.
    ///
    /// Returns the number of connections that accepted the message. A message
    /// that fails to serialize is logged and sent to nobody.
    pub fn broadcast<T>(&self, message: &T, exclude: Option<&ConnectionId>) -> usize
    where
        T: Serialize + ?Sized,
    {
        let payload = match encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize broadcast message: {e}");
                return 0;
            }
        };

        let clients = self.clients.read();
        let mut delivered = 0;
        for (id, connection) in clients.iter() {
            if exclude == Some(id) {
                continue;
            }
            if connection.enqueue(payload.clone()) {
                delivered += 1;
            } else {
                debug!("Skipping closed connection {connection} during broadcast");
            }
        }

        debug!(
            "Broadcast {} byte(s) to {delivered} of {} connection(s)",
            payload.as_str().len(),
            clients.len()
        );
        delivered
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether a registered connection with this identity exists.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.read().contains_key(id)
    }

    /// Watch the membership snapshots published by the coordinator.
    pub fn subscribe_membership(&self) -> watch::Receiver<Membership> {
        self.membership.clone()
    }

    /// `false` once the coordinator has been dropped.
    pub fn is_running(&self) -> bool {
        !self.register_tx.is_closed()
    }
}

impl Coordinator {
    /// Apply intake events until every [`Hub`] handle has been dropped.
    pub async fn run(mut self) {
        info!("Hub coordinator started");

        loop {
            tokio::select! {
                Some(connection) = self.register_rx.recv() => self.on_connect(connection),
                Some(connection) = self.unregister_rx.recv() => self.on_disconnect(connection),
                else => break,
            }
            self.publish_membership();
        }

        info!("Hub coordinator stopped");
    }

    fn on_connect(&mut self, connection: Arc<Connection>) {
        let id = connection.assign_id();

        // The pump may already have finished; its deregistration found no
        // identity, so inserting now would leave a dead entry behind.
        if connection.is_closed() {
            debug!("Connection {connection} closed before registration, not adding");
            return;
        }

        info!("Client connected {connection}");
        let _ = self.clients.write().insert(id, connection);
    }

    fn on_disconnect(&mut self, connection: Arc<Connection>) {
        let Some(id) = connection.id() else {
            debug!("Ignoring deregistration of {connection}");
            return;
        };

        match self.clients.write().remove(&id) {
            Some(_) => info!(
                "Client disconnected {connection} after {:?}, {} message(s) dropped",
                connection.age(),
                connection.drop_count()
            ),
            None => debug!("Connection {connection} already deregistered"),
        }
    }

    fn publish_membership(&mut self) {
        self.generation += 1;
        let clients = self.clients.read().len();
        let _ = self.membership.send_replace(Membership {
            generation: self.generation,
            clients,
        });
    }
}

fn encode<T>(message: &T) -> Result<Payload, Error>
where
    T: Serialize + ?Sized,
{
    Ok(Payload::from(serde_json::to_string(message)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{run_send_pump, Outbound};
    use crate::message::Event;
    use axum::extract::ws::Message;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use serde::ser::Error as _;
    use serde::Serializer;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn spawn_hub() -> Arc<Hub> {
        let (hub, coordinator) = Hub::new();
        tokio::spawn(coordinator.run());
        Arc::new(hub)
    }

    fn connection(port: u16) -> (Arc<Connection>, Outbound) {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        Connection::new(addr, 16)
    }

    async fn settle(hub: &Hub, generation: u64) -> Membership {
        let mut membership = hub.subscribe_membership();
        let snapshot = *membership
            .wait_for(|m| m.generation >= generation)
            .await
            .unwrap();
        snapshot
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refusing to serialize"))
        }
    }

    #[tokio::test]
    async fn registered_connection_receives_broadcast() {
        let hub = spawn_hub();
        let (conn, mut outbound) = connection(1);

        hub.register(conn.clone()).unwrap();
        let membership = settle(&hub, 1).await;
        assert_eq!(membership.clients, 1);

        let id = conn.id().expect("identity assigned at registration");
        assert!(hub.contains(&id));

        assert_eq!(hub.broadcast(&json!({"type": "Ping", "payload": {}}), None), 1);
        let received = outbound.try_recv().unwrap();
        assert_eq!(received.as_str(), r#"{"payload":{},"type":"Ping"}"#);
    }

    #[tokio::test]
    async fn identity_is_not_assigned_until_registration() {
        let (hub, coordinator) = Hub::new();
        let hub = Arc::new(hub);
        let (conn, _outbound) = connection(1);

        hub.register(conn.clone()).unwrap();
        assert!(conn.id().is_none());
        assert_eq!(hub.connection_count(), 0);

        tokio::spawn(coordinator.run());
        settle(&hub, 1).await;
        assert!(conn.id().is_some());
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn excluded_connection_receives_nothing() {
        let hub = spawn_hub();
        let (a, mut a_out) = connection(1);
        let (b, mut b_out) = connection(2);
        let (c, mut c_out) = connection(3);
        for conn in [&a, &b, &c] {
            hub.register(conn.clone()).unwrap();
        }
        settle(&hub, 3).await;

        let delivered = hub.broadcast(
            &Event::PostCreated(json!({"id": "p1"})),
            b.id().as_ref(),
        );
        assert_eq!(delivered, 2);

        let from_a = a_out.try_recv().unwrap();
        let from_c = c_out.try_recv().unwrap();
        assert_eq!(from_a.as_str(), from_c.as_str());
        assert!(a_out.try_recv().is_none());
        assert!(c_out.try_recv().is_none());
        assert!(b_out.try_recv().is_none());
    }

    #[tokio::test]
    async fn duplicate_deregistration_is_a_no_op() {
        let hub = spawn_hub();
        let (a, _a_out) = connection(1);
        let (b, _b_out) = connection(2);
        hub.register(a.clone()).unwrap();
        hub.register(b.clone()).unwrap();
        settle(&hub, 2).await;

        hub.unregister(a.clone()).unwrap();
        let once = settle(&hub, 3).await;
        hub.unregister(a.clone()).unwrap();
        let twice = settle(&hub, 4).await;

        assert_eq!(once.clients, 1);
        assert_eq!(twice.clients, 1);
        assert!(hub.contains(&b.id().unwrap()));
        assert!(!hub.contains(&a.id().unwrap()));
    }

    #[tokio::test]
    async fn deregistering_an_unregistered_connection_is_a_no_op() {
        let hub = spawn_hub();
        let (stray, _out) = connection(1);

        hub.unregister(stray.clone()).unwrap();
        let membership = settle(&hub, 1).await;

        assert_eq!(membership.clients, 0);
        assert!(stray.id().is_none());
    }

    #[tokio::test]
    async fn connection_closed_before_registration_is_not_added() {
        let hub = spawn_hub();
        let (conn, _out) = connection(1);
        conn.close();

        hub.register(conn.clone()).unwrap();
        let membership = settle(&hub, 1).await;

        assert_eq!(membership.clients, 0);
        assert_eq!(hub.broadcast(&json!({"type": "Ping"}), None), 0);
    }

    #[tokio::test]
    async fn serialization_failure_sends_nothing() {
        let hub = spawn_hub();
        let (conn, mut outbound) = connection(1);
        hub.register(conn).unwrap();
        settle(&hub, 1).await;

        assert_eq!(hub.broadcast(&Unserializable, None), 0);
        assert!(outbound.try_recv().is_none());
    }

    #[tokio::test]
    async fn broadcast_with_no_clients_is_fine() {
        let hub = spawn_hub();
        assert_eq!(hub.broadcast(&json!({"type": "Ping"}), None), 0);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn three_clients_exclusion_then_disconnect() {
        let hub = spawn_hub();
        let (a, mut a_out) = connection(1);
        let (b, mut b_out) = connection(2);
        let (c, mut c_out) = connection(3);
        for conn in [&a, &b, &c] {
            hub.register(conn.clone()).unwrap();
        }
        settle(&hub, 3).await;

        let ids = [a.id().unwrap(), b.id().unwrap(), c.id().unwrap()];
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);

        let created = Event::PostCreated(json!({"id": "p1", "post_content": "hi"}));
        hub.broadcast(&created, Some(&ids[1]));

        let a_msg = a_out.try_recv().unwrap();
        let c_msg = c_out.try_recv().unwrap();
        assert_eq!(a_msg.as_str(), c_msg.as_str());
        assert!(a_out.try_recv().is_none());
        assert!(c_out.try_recv().is_none());
        assert!(b_out.try_recv().is_none());

        hub.unregister(a.clone()).unwrap();
        settle(&hub, 4).await;

        let second = Event::PostDeleted { id: "p1".into() };
        assert_eq!(hub.broadcast(&second, None), 2);
        assert!(a_out.try_recv().is_none());
        assert!(b_out.try_recv().is_some());
        assert!(c_out.try_recv().is_some());
    }

    #[tokio::test]
    async fn failed_write_on_one_client_does_not_affect_another() {
        let hub = spawn_hub();

        let (a, a_out) = connection(1);
        let (a_sink, a_wire) = fmpsc::unbounded::<Message>();
        drop(a_wire);

        let (b, b_out) = connection(2);
        let (b_sink, mut b_wire) = fmpsc::unbounded::<Message>();

        hub.register(a.clone()).unwrap();
        hub.register(b.clone()).unwrap();
        settle(&hub, 2).await;

        let a_pump = tokio::spawn({
            let (a, hub) = (a.clone(), hub.clone());
            async move { run_send_pump(a, a_out, a_sink, &hub).await }
        });
        let b_pump = tokio::spawn({
            let (b, hub) = (b.clone(), hub.clone());
            async move { run_send_pump(b, b_out, b_sink, &hub).await }
        });

        assert_eq!(hub.broadcast(&json!({"type": "Ping", "payload": 1}), None), 2);

        match b_wire.next().await {
            Some(Message::Text(text)) => {
                assert_eq!(text.as_str(), r#"{"payload":1,"type":"Ping"}"#)
            }
            other => panic!("unexpected frame {other:?}"),
        }

        assert!(a_pump.await.unwrap().is_err());
        let mut membership = hub.subscribe_membership();
        let clients = membership.wait_for(|m| m.clients == 1).await.unwrap().clients;
        assert_eq!(clients, 1);
        assert!(hub.contains(&b.id().unwrap()));

        assert_eq!(hub.broadcast(&json!({"type": "Again"}), None), 1);
        assert!(b_wire.next().await.is_some());

        b.close();
        assert!(b_pump.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deregistration_is_applied_during_a_registration_flood() {
        let hub = spawn_hub();
        let (target, _target_out) = connection(1);
        hub.register(target.clone()).unwrap();
        settle(&hub, 1).await;
        let id = target.id().unwrap();

        let flood = tokio::spawn({
            let hub = hub.clone();
            async move {
                for port in (2..=u16::MAX).cycle() {
                    let (conn, _out) = connection(port);
                    if hub.register(conn).is_err() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        });

        target.close();
        hub.unregister(target).unwrap();

        let mut membership = hub.subscribe_membership();
        let removed = tokio::time::timeout(Duration::from_secs(5), async {
            while hub.contains(&id) {
                if membership.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        flood.abort();

        assert!(removed.is_ok());
        assert!(!hub.contains(&id));
    }

    #[tokio::test]
    async fn coordinator_stops_when_hub_is_dropped() {
        let (hub, coordinator) = Hub::new();
        let task = tokio::spawn(coordinator.run());
        assert!(hub.is_running());
        drop(hub);
        task.await.unwrap();
    }

    #[test]
    fn submissions_fail_once_coordinator_is_gone() {
        let (hub, coordinator) = Hub::new();
        drop(coordinator);
        let (conn, _out) = connection(1);

        assert!(!hub.is_running());
        assert!(hub.register(conn.clone()).is_err());
        assert!(hub.unregister(conn).is_err());
    }
}
