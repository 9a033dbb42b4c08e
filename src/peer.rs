//! # Peer References
//!
//! Peers are owned by the node's peer table, not by this crate. Everything the
//! failure table remembers about a peer goes through [`PeerHandle`], a weak
//! reference paired with the peer id captured at record time. A handle that no
//! longer upgrades means the peer is gone, which for every consumer here is
//! the same as "no longer interested".
//!
//! PRIVACY: weak references keep the failure table from extending peer
//! lifetime, so forgetting a peer really forgets it.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::messages::Message;

/// Stable identity of a peer (32 bytes, assigned by the peer table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Error kinds surfaced by peer send paths.
///
/// Callers of fire-and-forget sends ignore `Disconnected` (the offer was
/// best-effort); the serve pipeline logs `Timeout` and abandons the transfer.
/// Both cases still release the transaction uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The peer is no longer connected.
    Disconnected,
    /// A throttled send did not complete within its deadline.
    Timeout,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "peer disconnected"),
            SendError::Timeout => write!(f, "send deadline elapsed"),
        }
    }
}

impl std::error::Error for SendError {}

/// A connected peer as seen from the failure table.
///
/// Implemented by the node's peer object. `send` queues a message without
/// blocking (transport-thread safe); `send_throttled` participates in output
/// bandwidth limiting and may park until the deadline.
#[async_trait]
pub trait PeerNode: Send + Sync {
    fn peer_id(&self) -> PeerId;

    /// Monotonically advancing per-process counter; changes when the peer
    /// restarts. Offers recorded against an older boot id are stale.
    fn boot_id(&self) -> u64;

    fn is_connected(&self) -> bool;

    /// Queue a message for delivery. Never blocks.
    fn send(&self, msg: Message) -> Result<(), SendError>;

    /// Send a payload-bearing message through the output throttle.
    /// Fails with `Timeout` if the deadline elapses first.
    async fn send_throttled(
        &self,
        msg: Message,
        payload_len: usize,
        deadline: Duration,
    ) -> Result<(), SendError>;
}

/// Weak reference to a peer plus the id it had when recorded.
///
/// The id is kept outside the weak pointer so records can still be matched
/// against a peer after the peer object is dropped.
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    node: Weak<dyn PeerNode>,
}

impl PeerHandle {
    pub fn new(peer: &Arc<dyn PeerNode>) -> Self {
        Self {
            id: peer.peer_id(),
            node: Arc::downgrade(peer),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    /// Resolve to the live peer, or `None` if it is gone.
    pub fn upgrade(&self) -> Option<Arc<dyn PeerNode>> {
        self.node.upgrade()
    }

    /// Resolve only if the peer is both alive and currently connected.
    pub fn upgrade_connected(&self) -> Option<Arc<dyn PeerNode>> {
        self.node.upgrade().filter(|p| p.is_connected())
    }
}

// Debug cannot derive through `Weak<dyn PeerNode>`.
impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id.short())
            .field("alive", &(self.node.strong_count() > 0))
            .finish()
    }
}
