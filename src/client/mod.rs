//! The `client` module defines the broker-side handle of one connected
//! WebSocket peer.
//!
//! A `Client` owns the sending half of the channel drained by the
//! connection's writer task, so anything holding a clone can push frames to
//! that peer without touching the socket.

pub mod pubsub_client;
pub use pubsub_client::Client;
