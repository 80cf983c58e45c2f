//! # Discovery Wire Messages
//!
//! Serializable message types for the discovery protocol. Messages are
//! encoded with bincode; deserialization is size-limited so a hostile frame
//! cannot trigger an oversized allocation.
//!
//! A received `NodeId` is only trusted after the admission check — the wire
//! schema carries the claimed `id` alongside the public key, and the two are
//! rebound by [`crate::identity::is_peer_valid`] on receipt.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::NodeId;

/// Maximum size of an encoded discovery message.
///
/// The largest legitimate frame is a lookup response carrying a full bucket
/// width of identities; 64 KiB leaves ample headroom over that.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

/// Returns bincode options with the size limit enforced.
/// Always use this for deserialization of untrusted bytes.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with the size bound enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_message(message: &DiscoveryMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

pub fn deserialize_message(bytes: &[u8]) -> Result<DiscoveryMessage, bincode::Error> {
    deserialize_bounded(bytes)
}

/// The discovery protocol's message kinds.
///
/// `LookupNodeResponse` only has meaning as the reply to an outstanding
/// `LookupNodeRequest`; the transport layer correlates the two.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    Ping,
    Pong,
    LookupNodeRequest { target: NodeId },
    LookupNodeResponse { peers: Vec<NodeId> },
}
