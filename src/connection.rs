//! # TCP Connection Adapter
//!
//! Plumbing between peer identities and sockets:
//!
//! - an id→address map, populated as identities are observed on incoming
//!   traffic, so peers can be dialed by id ([`ConnectionAdapter::establish_actively`])
//! - a cancellable accept loop that yields inbound connections on a channel
//!   ([`ConnectionAdapter::establish_passively`])
//! - a bounded tally of externally-reported addresses for this node, so the
//!   most-agreed-upon publicly visible address can be advertised
//!
//! The adapter deals in raw ids (`&[u8]`), not [`crate::identity::NodeId`]
//! values: by the time a dial happens, the caller has already resolved who
//! it wants to reach, and keying by value avoids tying connection state to
//! routing state.

use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// Upper bound on tracked publicly-visible address candidates.
pub const MAX_VISIBLE_ADDRESS_CANDIDATES: usize = 8;

/// Bound on the id→address map. Far above any realistic routing table
/// population (256 buckets of 16), so eviction only matters under abuse.
const MAX_TRACKED_PEER_ADDRESSES: usize = 64 * 1024;

const ACCEPT_CHANNEL_DEPTH: usize = 32;

/// Failure to establish an outbound connection.
#[derive(Debug)]
pub enum ConnectError {
    /// No address has been observed for the requested id.
    NotFound,
    Io(io::Error),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::NotFound => write!(f, "no address known for the requested id"),
            ConnectError::Io(error) => write!(f, "dial failed: {error}"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::NotFound => None,
            ConnectError::Io(error) => Some(error),
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(error: io::Error) -> Self {
        ConnectError::Io(error)
    }
}

#[derive(Clone, Debug)]
struct VisibleAddress {
    address: String,
    count: u64,
}

/// Dial-by-identity and accept-loop plumbing around one TCP listener.
pub struct ConnectionAdapter {
    listener: TcpListener,
    id_to_address: Mutex<LruCache<Vec<u8>, String>>,
    /// Sorted count-descending; see [`ConnectionAdapter::report_visible_address`].
    visible_addresses: Mutex<Vec<VisibleAddress>>,
}

impl ConnectionAdapter {
    pub fn new(listener: TcpListener) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_PEER_ADDRESSES)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            listener,
            id_to_address: Mutex::new(LruCache::new(capacity)),
            visible_addresses: Mutex::new(Vec::new()),
        }
    }

    pub async fn bind(address: &str) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(address).await?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn lock_addresses(&self) -> MutexGuard<'_, LruCache<Vec<u8>, String>> {
        self.id_to_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_visible(&self) -> MutexGuard<'_, Vec<VisibleAddress>> {
        self.visible_addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record where an observed identity can be reached.
    pub fn map_id_to_address(&self, id: &[u8], address: impl Into<String>) {
        self.lock_addresses().put(id.to_vec(), address.into());
    }

    pub fn lookup_address(&self, id: &[u8]) -> Result<String, ConnectError> {
        self.lock_addresses()
            .get(id)
            .cloned()
            .ok_or(ConnectError::NotFound)
    }

    /// Ids with a known address, in no particular order.
    pub fn connection_ids(&self) -> Vec<Vec<u8>> {
        self.lock_addresses()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Dial a peer by id, resolving through the id→address map.
    pub async fn establish_actively(&self, remote: &[u8]) -> Result<TcpStream, ConnectError> {
        let address = self.lookup_address(remote)?;
        let stream = TcpStream::connect(&address).await?;
        debug!(address = %address, "dialed peer");
        Ok(stream)
    }

    /// Spawn the accept loop.
    ///
    /// Accepted connections arrive on the returned channel. Accept errors
    /// are logged and the loop continues; raising `cancel` stops the loop
    /// and closes the channel.
    pub fn establish_passively(
        self: Arc<Self>,
        mut cancel: watch::Receiver<bool>,
    ) -> mpsc::Receiver<(TcpStream, SocketAddr)> {
        let (tx, rx) = mpsc::channel(ACCEPT_CHANNEL_DEPTH);
        let adapter = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    accepted = adapter.listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                if tx.send((stream, peer_addr)).await.is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                error!(%error, "unable to accept connection");
                            }
                        }
                    }
                }
            }
        });
        rx
    }

    /// Count a peer's report of how this node looks from outside.
    ///
    /// The tally stays sorted count-descending by bubbling the incremented
    /// entry toward the front. When the tally is full, the lowest-ranked
    /// entry is dropped in favor of the newest report, so a fresh address
    /// always has a chance of being preferred.
    pub fn report_visible_address(&self, address: &str) {
        let mut tally = self.lock_visible();

        if let Some(pos) = tally.iter().position(|v| v.address == address) {
            tally[pos].count += 1;
            let mut p = pos;
            while p > 0 && tally[p - 1].count < tally[p].count {
                tally.swap(p - 1, p);
                p -= 1;
            }
            return;
        }

        if tally.len() > MAX_VISIBLE_ADDRESS_CANDIDATES - 1 {
            tally.truncate(MAX_VISIBLE_ADDRESS_CANDIDATES - 1);
        }
        tally.push(VisibleAddress {
            address: address.to_string(),
            count: 1,
        });
    }

    /// The most-reported externally-visible address, if any peer has
    /// reported one.
    pub fn publicly_visible_address(&self) -> Option<String> {
        self.lock_visible().first().map(|v| v.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn adapter() -> ConnectionAdapter {
        ConnectionAdapter::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn lookup_misses_report_not_found() {
        let adapter = adapter().await;
        assert!(matches!(
            adapter.lookup_address(b"unknown"),
            Err(ConnectError::NotFound)
        ));
    }

    #[tokio::test]
    async fn mapping_is_observable_and_overwritable() {
        let adapter = adapter().await;
        adapter.map_id_to_address(b"peer-1", "10.0.0.1:7000");
        assert_eq!(adapter.lookup_address(b"peer-1").unwrap(), "10.0.0.1:7000");

        adapter.map_id_to_address(b"peer-1", "10.0.0.2:7000");
        assert_eq!(adapter.lookup_address(b"peer-1").unwrap(), "10.0.0.2:7000");

        assert_eq!(adapter.connection_ids(), vec![b"peer-1".to_vec()]);
    }

    #[tokio::test]
    async fn dial_by_id_reaches_a_listener() {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let adapter = adapter().await;
        adapter.map_id_to_address(b"peer-1", remote_addr.to_string());

        let dialed = adapter.establish_actively(b"peer-1").await.unwrap();
        let (accepted, _) = remote.accept().await.unwrap();
        assert_eq!(
            dialed.local_addr().unwrap(),
            accepted.peer_addr().unwrap()
        );
    }

    #[tokio::test]
    async fn accept_loop_yields_connections_and_honors_cancellation() {
        let adapter = Arc::new(adapter().await);
        let local = adapter.local_addr().unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut incoming = adapter.clone().establish_passively(cancel_rx);

        let outbound = TcpStream::connect(local).await.unwrap();
        let (inbound, inbound_peer) = incoming.recv().await.unwrap();
        assert_eq!(outbound.local_addr().unwrap(), inbound_peer);
        drop(inbound);
        drop(outbound);

        cancel_tx.send_replace(true);
        assert!(incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn visible_address_tally_prefers_the_most_reported() {
        let adapter = adapter().await;
        assert!(adapter.publicly_visible_address().is_none());

        adapter.report_visible_address("1.2.3.4:1000");
        adapter.report_visible_address("5.6.7.8:2000");
        adapter.report_visible_address("5.6.7.8:2000");

        assert_eq!(
            adapter.publicly_visible_address().as_deref(),
            Some("5.6.7.8:2000")
        );

        // Outvote the current leader.
        adapter.report_visible_address("1.2.3.4:1000");
        adapter.report_visible_address("1.2.3.4:1000");
        assert_eq!(
            adapter.publicly_visible_address().as_deref(),
            Some("1.2.3.4:1000")
        );
    }

    #[tokio::test]
    async fn visible_address_tally_keeps_a_slot_for_the_newest() {
        let adapter = adapter().await;
        for index in 0..MAX_VISIBLE_ADDRESS_CANDIDATES {
            adapter.report_visible_address(&format!("10.0.0.{index}:9000"));
        }

        // A full tally evicts its lowest-ranked entry for the newcomer.
        adapter.report_visible_address("192.168.0.1:9000");

        let tally = adapter.lock_visible();
        assert_eq!(tally.len(), MAX_VISIBLE_ADDRESS_CANDIDATES);
        assert!(tally.iter().any(|v| v.address == "192.168.0.1:9000"));
        let last_seeded = format!("10.0.0.{}:9000", MAX_VISIBLE_ADDRESS_CANDIDATES - 1);
        assert!(tally.iter().all(|v| v.address != last_seeded));
    }
}
