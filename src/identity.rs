//! # Peer Identity and Cryptographic Admission
//!
//! This module defines the identity types used throughout meshwire:
//!
//! - [`NodeId`]: a peer's network address, raw public key, and the
//!   BLAKE2b-256 digest of that key. The digest is the peer's position in
//!   the XOR identifier space; equality and ordering are defined on it
//!   alone.
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key).
//!
//! ## S/Kademlia Cryptopuzzles
//!
//! Entry into the network is gated by two puzzles:
//!
//! - **Static (C1)**: `H(public_key)` must have at least `c1` leading zero
//!   bits. Solved once at key generation; raises the cost of minting
//!   identities in bulk.
//! - **Dynamic (C2)**: `H(H(public_key) ⊕ X)` must have at least `c2`
//!   leading zero bits for a session nonce `X` supplied during the
//!   handshake.
//!
//! Verification of either puzzle is O(1); generation work grows as `2^c1`.
//!
//! ## Invariants
//!
//! - `NodeId::new(addr, pk).id == hash(pk)` always
//! - two identities are equal iff their `id` bytes are equal; the address
//!   is informational and excluded from equality
//! - `Keypair::from_secret_key_bytes(kp.secret_key_bytes())` preserves the
//!   public key and the derived identity

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::hashing::{self, LengthMismatch};

/// A peer identity: where to reach it, its public key, and the derived id.
///
/// `id` is the BLAKE2b-256 digest of `public_key` for every identity built
/// with [`NodeId::new`]. Identities received from the wire must be checked
/// with [`is_peer_valid`] before they are trusted to uphold that binding.
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeId {
    pub address: String,
    pub public_key: Vec<u8>,
    pub id: Vec<u8>,
}

impl NodeId {
    /// Bind an address and public key together, deriving `id = hash(public_key)`.
    pub fn new(address: impl Into<String>, public_key: impl Into<Vec<u8>>) -> Self {
        let public_key = public_key.into();
        let id = hashing::hash(&public_key).to_vec();
        Self {
            address: address.into(),
            public_key,
            id,
        }
    }

    /// Distance arithmetic: an identity carrying `self.id ⊕ other.id`.
    ///
    /// The result's public key is left empty; it exists only to carry the
    /// XOR distance through id-based comparisons.
    pub fn xor_id(&self, other: &NodeId) -> Result<NodeId, LengthMismatch> {
        Ok(NodeId {
            address: self.address.clone(),
            public_key: Vec::new(),
            id: hashing::xor(&self.id, &other.id)?,
        })
    }

    /// Byte-wise XOR of the two public keys, keeping `self`'s address.
    ///
    /// Kept for API compatibility; routing decisions use [`NodeId::xor_id`].
    pub fn xor(&self, other: &NodeId) -> Result<NodeId, LengthMismatch> {
        Ok(NodeId {
            address: self.address.clone(),
            public_key: hashing::xor(&self.public_key, &other.public_key)?,
            id: Vec::new(),
        })
    }

    /// Number of leading zero bits of `id`.
    #[inline]
    pub fn prefix_len(&self) -> usize {
        hashing::leading_zero_bits(&self.id)
    }

    /// Lowercase hex rendering of the public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeId {}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ID{{Address: {}, Id: [", self.address)?;
        for (i, byte) in self.id.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte}")?;
        }
        write!(f, "]}}")
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id_hex = hex::encode(&self.id);
        let short = &id_hex[..id_hex.len().min(16)];
        write!(f, "NodeId({}, {})", self.address, short)
    }
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Sample a fresh keypair without solving the static puzzle.
    ///
    /// Identities derived from unvetted keys will be rejected by peers
    /// enforcing admission; use [`generate_keypair_and_id`] to join a
    /// puzzle-enforcing network.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Identity binding `address` to this keypair's public key.
    pub fn node_id(&self, address: impl Into<String>) -> NodeId {
        NodeId::new(address, self.public_key_bytes().to_vec())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// S/Kademlia Cryptopuzzles
// ============================================================================

/// Default static puzzle difficulty (leading zero bits of `H(pk)`).
pub const DEFAULT_C1: usize = 8;

/// Default dynamic puzzle difficulty.
pub const DEFAULT_C2: usize = 8;

/// Maximum keypair samples before key generation gives up.
///
/// At difficulty 8 acceptance takes ~256 samples on average; this bound
/// covers difficulties well past 20 without risking an unbounded loop on a
/// misconfigured difficulty.
const MAX_KEYGEN_ATTEMPTS: u64 = 1 << 24;

/// Puzzle difficulties for one network.
///
/// `c1` gates key generation and static admission; `c2` is consumed by the
/// dynamic handshake check ([`is_valid_dynamic`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PuzzleParams {
    pub c1: usize,
    pub c2: usize,
}

impl Default for PuzzleParams {
    fn default() -> Self {
        Self {
            c1: DEFAULT_C1,
            c2: DEFAULT_C2,
        }
    }
}

/// Static puzzle: `H(public_key)` has at least `c1` leading zero bits.
#[inline]
pub fn is_valid_key_pair(public_key: &[u8], c1: usize) -> bool {
    hashing::leading_zero_bits(&hashing::hash(public_key)) >= c1
}

/// Dynamic puzzle: `H(H(public_key) ⊕ nonce)` has at least `c2` leading
/// zero bits. A nonce of the wrong width can never satisfy the puzzle.
pub fn is_valid_dynamic(public_key: &[u8], nonce: &[u8], c2: usize) -> bool {
    let node_id = hashing::hash(public_key);
    match hashing::xor(&node_id, nonce) {
        Ok(mixed) => hashing::leading_zero_bits(&hashing::hash(&mixed)) >= c2,
        Err(_) => false,
    }
}

/// Admission check for a remote identity: the static puzzle holds and the
/// claimed id is really the digest of the claimed public key.
pub fn is_peer_valid(peer: &NodeId, c1: usize) -> bool {
    is_valid_key_pair(&peer.public_key, c1) && peer.id == hashing::hash(&peer.public_key)
}

/// Key generation exhausted its attempt bound.
///
/// With a functioning CSPRNG this only happens when the difficulty is set
/// far beyond what the attempt bound covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeygenError {
    pub attempts: u64,
    pub c1: usize,
}

impl std::fmt::Display for KeygenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "no keypair satisfying the static puzzle (c1={}) found in {} attempts",
            self.c1, self.attempts
        )
    }
}

impl std::error::Error for KeygenError {}

/// Sample keypairs until one's public key satisfies the static puzzle at
/// `params.c1`, then bind it to `address`.
///
/// Expected work grows as `2^c1`; each call produces a fresh key.
pub fn generate_keypair_and_id(
    address: &str,
    params: &PuzzleParams,
) -> Result<(Keypair, NodeId), KeygenError> {
    for _ in 0..MAX_KEYGEN_ATTEMPTS {
        let keypair = Keypair::generate();
        let public_key = keypair.public_key_bytes();
        if is_valid_key_pair(&public_key, params.c1) {
            let id = NodeId::new(address, public_key.to_vec());
            return Ok((keypair, id));
        }
    }
    Err(KeygenError {
        attempts: MAX_KEYGEN_ATTEMPTS,
        c1: params.c1,
    })
}
