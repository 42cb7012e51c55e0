//! Mesh replication for PluresDB peers.
//!
//! A peer can simultaneously serve inbound WebSocket links and dial out
//! to known peer URLs. Local store updates fan out to every link; received
//! updates feed the store's merge flow and are relayed across served
//! links with origin suppression. Peers that were apart reconcile on
//! reconnect through sync requests, so no outbound queue outlives the
//! process.

pub mod message;
pub mod replicator;

pub use message::MeshMessage;
pub use replicator::{LinkRole, MeshReplicator, MeshServer};
