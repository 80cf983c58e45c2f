//! Protocol trait definitions for meshwire's networking layer.
//!
//! The discovery core depends on this trait rather than on a concrete
//! transport, so the same protocol logic runs over a production socket
//! layer or an in-memory test network. Request/response correlation —
//! matching a `LookupNodeResponse` to the `LookupNodeRequest` that caused
//! it — is the transport's job; by the time these futures resolve, the
//! reply has already been matched to its request.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::NodeId;

/// Discovery operations the routing core issues against remote peers.
#[async_trait]
pub trait DiscoveryRpc: Send + Sync + 'static {
    /// Liveness probe. Resolves once `to` has acknowledged with a pong.
    async fn ping(&self, to: &NodeId) -> Result<()>;

    /// Ask `to` for its closest known peers to `target`.
    async fn lookup_node(&self, to: &NodeId, target: &NodeId) -> Result<Vec<NodeId>>;
}
