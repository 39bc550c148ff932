//! WebSocket connection hub for real-time post notifications.
//!
//! Keeps the set of live client connections and fans each broadcast out to
//! all of them. Payloads are opaque to the hub: a message is serialized to
//! JSON once and the same bytes are queued on every recipient.
//!
//! # Architecture
//!
//! - **Single coordinator**: registration and deregistration requests travel
//!   over channels to one [`Coordinator`] task, the only code that changes the
//!   client set. Broadcasts read the set under a shared lock.
//! - **Identity at registration**: a connection gets its [`ConnectionId`] when
//!   the coordinator registers it, never earlier.
//! - **Bounded queues, drop-oldest**: each connection buffers a fixed number of
//!   outgoing messages. A slow client loses its oldest pending messages rather
//!   than stalling the broadcast for everyone else.
//! - **Self-cleaning**: a send pump that hits a write error or a closed queue
//!   submits its own connection for deregistration, so broadcasts never need
//!   per-client error handling.
//! - **Ephemeral messages**: clients that are offline miss events and reload
//!   fresh state when they reconnect.
//!
//! # Message Flow
//!
//! 1. The web layer upgrades `GET /ws` and creates a [`Connection`]
//! 2. The connection is submitted with [`Hub::register`] and its send pump is
//!    spawned
//! 3. A collaborator finishes a state change (e.g. a post is created) and
//!    publishes a `DomainEvent`, or calls [`Hub::broadcast`] directly
//! 4. The hub serializes the message and enqueues it on every connection
//!    except the optional excluded one
//! 5. Each send pump writes its queue to the socket in order
//!
//! # Example: Sending an event
//!
//! ```rust,ignore
//! use hub::message::Event;
//!
//! app_state.hub.broadcast(&Event::PostCreated(post_json), None);
//! ```
//!
//! # Modules
//!
//! - `connection`: connection wrapper, outbound queue and send pump
//! - `hub`: client set, coordinator and broadcast
//! - `message`: wire envelope and event types
//! - `domain_event_handler`: bridges domain events to broadcasts

pub mod connection;
pub mod domain_event_handler;
pub mod error;
pub mod hub;
pub mod message;

pub use connection::{run_send_pump, Connection, ConnectionId, Outbound};
pub use hub::{Coordinator, Hub, Membership};
