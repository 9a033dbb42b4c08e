//! # Content Keys and Blocks
//!
//! Keys are opaque 32-byte routing identifiers tagged with their variant:
//!
//! - **CHK** (content-hash key): content-addressed, unforgeable. Holding the
//!   block proves the key.
//! - **SSK** (signed-subspace key): signed by its owner, not content-addressed.
//!   A peer can claim an SSK without being able to prove it names the block.
//!
//! The distinction matters for offer acceptance: bidirectional offer
//! propagation is only safe for CHKs (see `serve.rs`).
//!
//! Blocks carry the raw wire encoding (headers + data) as stored in the
//! datastore; this crate never decodes them, it only moves them.

use serde::{Deserialize, Serialize};

/// Size of a single transfer packet on the wire.
pub const PACKET_SIZE: usize = 1024;

/// Number of packets in a full CHK block transfer.
pub const PACKETS_IN_BLOCK: usize = 32;

/// Raw data payload size of a CHK block (32 KiB).
pub const CHK_DATA_SIZE: usize = PACKETS_IN_BLOCK * PACKET_SIZE;

/// Key variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// Content-hash key: key = hash(block), unforgeable.
    Chk,
    /// Signed-subspace key: owner-signed, not content-addressed.
    Ssk,
}

/// A content routing key: variant tag plus 32 opaque routing bytes.
///
/// Equality and hashing cover the full bytes including the tag, so a CHK and
/// an SSK with identical routing bytes are distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    kind: KeyKind,
    routing_key: [u8; 32],
}

impl Key {
    pub fn new(kind: KeyKind, routing_key: [u8; 32]) -> Self {
        Self { kind, routing_key }
    }

    pub fn chk(routing_key: [u8; 32]) -> Self {
        Self::new(KeyKind::Chk, routing_key)
    }

    pub fn ssk(routing_key: [u8; 32]) -> Self {
        Self::new(KeyKind::Ssk, routing_key)
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn is_chk(&self) -> bool {
        self.kind == KeyKind::Chk
    }

    pub fn is_ssk(&self) -> bool {
        self.kind == KeyKind::Ssk
    }

    pub fn routing_key(&self) -> &[u8; 32] {
        &self.routing_key
    }

    /// Short hex form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.routing_key[..8])
    }
}

/// A CHK block as stored: raw headers plus exactly `CHK_DATA_SIZE` data bytes.
#[derive(Debug, Clone)]
pub struct ChkBlock {
    key: Key,
    headers: Vec<u8>,
    data: Vec<u8>,
}

impl ChkBlock {
    pub fn new(key: Key, headers: Vec<u8>, data: Vec<u8>) -> Self {
        debug_assert!(key.is_chk());
        Self { key, headers, data }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn headers(&self) -> &[u8] {
        &self.headers
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// An SSK block as stored: raw headers, data, and the subspace public key
/// needed to verify it.
#[derive(Debug, Clone)]
pub struct SskBlock {
    key: Key,
    headers: Vec<u8>,
    data: Vec<u8>,
    pub_key: Vec<u8>,
}

impl SskBlock {
    pub fn new(key: Key, headers: Vec<u8>, data: Vec<u8>, pub_key: Vec<u8>) -> Self {
        debug_assert!(key.is_ssk());
        Self {
            key,
            headers,
            data,
            pub_key,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn headers(&self) -> &[u8] {
        &self.headers
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pub_key(&self) -> &[u8] {
        &self.pub_key
    }
}

/// Either kind of stored block.
#[derive(Debug, Clone)]
pub enum KeyBlock {
    Chk(ChkBlock),
    Ssk(SskBlock),
}

impl KeyBlock {
    pub fn key(&self) -> &Key {
        match self {
            KeyBlock::Chk(b) => b.key(),
            KeyBlock::Ssk(b) => b.key(),
        }
    }
}
