//! # Veles
//!
//! An event-oriented messaging library layered over WebSocket, speaking a
//! subset of the Socket.IO v4 wire format. Peers exchange named events
//! carrying JSON argument lists, optionally request acknowledgments, and are
//! grouped into namespaces and rooms for targeted broadcast.
//!
//! ## Components
//!
//! - `veles-protocol`: packet model, wire codec, event emitter and ack table
//! - `veles-server`: server, namespaces, rooms and broadcast
//! - `veles-client`: client dialer and socket

pub use veles_client as client;
pub use veles_protocol as protocol;
pub use veles_server as server;
