//! Courier daemon: wires the messaging protocol client to the encrypted
//! state in `courier_core` and exposes it over a local control socket.

pub mod avatars;
pub mod backend;
pub mod control;
pub mod ingest;
pub mod media;
pub mod protocol;

pub use backend::{Backend, ServiceStatus, Timings};
pub use protocol::{MessagingClient, OfflineClient, ProtocolError, ProtocolEvent};
