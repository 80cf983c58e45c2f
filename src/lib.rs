//! # Meshwire - Peer-to-Peer Discovery and Routing
//!
//! Meshwire is the core of a pluggable peer-to-peer networking stack built
//! around S/Kademlia-style distributed peer discovery:
//!
//! - **Identity**: peers are identified by the BLAKE2b-256 digest of their
//!   Ed25519 public key, bound to a transport address
//! - **Admission**: static (C1) and dynamic (C2) cryptopuzzles gate entry
//!   into the network, raising the cost of minting identities in bulk
//! - **Routing**: a 256-bucket XOR-metric routing table kept fresh by
//!   ordinary message traffic
//! - **Discovery**: the PING / PONG / LOOKUP_NODE protocol and an
//!   iterative, α-bounded FIND_NODE that converges on the peers closest to
//!   any target identifier
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `hashing` | BLAKE2b-256 digests, XOR, leading-zero-bit counting |
//! | `identity` | `NodeId`, Ed25519 `Keypair`, cryptopuzzle validation and puzzle-gated key generation |
//! | `messages` | Serializable discovery messages with bounded decoding |
//! | `protocols` | The `DiscoveryRpc` trait the routing core drives transports through |
//! | `discovery` | K-buckets, routing table, the discovery plugin, iterative FIND_NODE |
//! | `connection` | TCP adapter: dial-by-identity, accept loop, visible-address tally |
//!
//! ## Architecture
//!
//! The discovery plugin owns its routing table and is driven from two
//! directions: the transport layer feeds it decoded incoming messages
//! (every accepted message refreshes the sender's table entry), and local
//! callers start lookups and bootstraps against the [`DiscoveryRpc`] trait.
//! The plugin handle is cheap to clone; a shared cancellation signal
//! reaches every long-lived task so shutdown never strands an accept loop
//! or an in-flight lookup.

pub mod connection;
pub mod discovery;
pub mod hashing;
pub mod identity;
pub mod messages;
pub mod protocols;

pub use connection::{ConnectError, ConnectionAdapter, MAX_VISIBLE_ADDRESS_CANDIDATES};
pub use discovery::{
    Discovery, DiscoveryConfig, DiscoveryError, PendingEviction, RoutingTable, UpdateOutcome,
    DEFAULT_ALPHA, DEFAULT_BUCKET_SIZE,
};
pub use identity::{
    generate_keypair_and_id, is_peer_valid, is_valid_dynamic, is_valid_key_pair, Keypair,
    KeygenError, NodeId, PuzzleParams, DEFAULT_C1, DEFAULT_C2,
};
pub use messages::DiscoveryMessage;
pub use protocols::DiscoveryRpc;
