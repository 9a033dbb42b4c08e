//! Collaborator trait definitions for the failure table.
//!
//! The failure table sits between several node subsystems it does not own.
//! Each is reached through a narrow trait so the table can be exercised
//! against mocks in tests.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Datastore | [`Datastore`] | block presence checks and fetches (disk I/O) |
//! | Client core | [`ClientCore`] | offered-key queue of the local request scheduler |
//! | Request tracker | [`UidTracker`] | transaction uid slots that must be released |
//! | Transfer layer | [`BlockTransmitter`] | packetised CHK payload streaming |
//!
//! Peers are a collaborator too; their trait lives in `peer.rs` next to the
//! weak-handle machinery.

use std::sync::Arc;

use async_trait::async_trait;

use crate::key::{Key, KeyBlock};
use crate::peer::{PeerNode, SendError};

/// Block presence and retrieval. Calls hit disk; the serve pipeline invokes
/// them only from its serial queue, never from a transport thread.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Cheap-ish presence probe (may still touch disk).
    async fn has_key(&self, key: &Key) -> bool;

    /// Fetch the stored block for `key`, if we hold it.
    async fn fetch(&self, key: &Key) -> Option<KeyBlock>;
}

/// The client-facing request queue.
pub trait ClientCore: Send + Sync {
    /// A fresh offer for `key` was recorded. `others_want` is true when
    /// downstream peers beyond the offerer are also interested, letting the
    /// client layer deprioritise offers of no ongoing value.
    fn maybe_queue_offered_key(&self, key: Key, others_want: bool);

    /// The last offer for `key` is gone; forget any queued offered-key work.
    fn dequeue_offered_key(&self, key: Key);
}

/// Transaction uid bookkeeping. Every uid handed to `send_offered_key` must
/// be released exactly once, on every exit path.
pub trait UidTracker: Send + Sync {
    fn unlock_uid(&self, uid: u64, is_ssk: bool);
}

/// Streams a CHK payload to a peer as `PACKETS_IN_BLOCK` packets of
/// `PACKET_SIZE` bytes. Runs on a worker; may block on congestion for the
/// length of its internal deadline.
#[async_trait]
pub trait BlockTransmitter: Send + Sync {
    async fn send_block(
        &self,
        to: Arc<dyn PeerNode>,
        uid: u64,
        data: Vec<u8>,
    ) -> Result<(), SendError>;
}
