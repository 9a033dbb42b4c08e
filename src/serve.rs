//! # Serial Offer Executor
//!
//! Everything offer-related that touches the datastore runs here, on one
//! queue with one consumer. Block fetches hit disk; serialising them keeps
//! their latency off the transport threads and bounds the tail instead of
//! letting a slow disk fan out into transfer timeouts.
//!
//! Two kinds of work arrive:
//!
//! - **Offer validation**: a peer offered us a key. The acceptance decision
//!   needs a datastore probe, and the entry must be re-checked afterwards
//!   because it may have vanished during the hop through the queue.
//! - **Offered-key serving**: a peer is claiming a key we offered it. The
//!   block is fetched here; the actual network sends are dispatched to
//!   worker tasks, since a throttled send may park for up to a minute.
//!
//! Every `SendKey` job owns a transaction uid. Release is tied to a drop
//! guard so it happens exactly once on every exit path, panics included.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::key::{Key, KeyBlock};
use crate::messages::{Message, OfferRejectReason};
use crate::offers::BlockOffer;
use crate::peer::{PeerHandle, PeerNode, SendError};
use crate::protocols::{BlockTransmitter, ClientCore, Datastore, UidTracker};
use crate::table::{FailureTable, FailureTableInner, OfferStats};

/// Deadline for streaming an offered block's payload to the claimant.
pub const OFFER_SEND_DEADLINE: Duration = Duration::from_secs(60);

/// Work items for the serial queue. Same-key items are FIFO by construction.
pub(crate) enum OfferWork {
    /// Validate and maybe record an incoming offer.
    Offer {
        key: Key,
        peer: Arc<dyn PeerNode>,
        authenticator: [u8; 32],
    },
    /// Serve a claim for a previously offered key.
    SendKey {
        key: Key,
        need_pub_key: bool,
        uid: u64,
        source: Arc<dyn PeerNode>,
    },
}

/// Releases a transaction uid exactly once, when dropped.
///
/// Handed from the pipeline into whichever worker finishes the transfer, so
/// early returns, send failures and panics all still release the slot.
struct UidGuard {
    tracker: Arc<dyn UidTracker>,
    uid: u64,
    is_ssk: bool,
}

impl UidGuard {
    fn new(tracker: Arc<dyn UidTracker>, uid: u64, is_ssk: bool) -> Self {
        Self {
            tracker,
            uid,
            is_ssk,
        }
    }
}

impl Drop for UidGuard {
    fn drop(&mut self) {
        self.tracker.unlock_uid(self.uid, self.is_ssk);
    }
}

/// Single consumer of the offer queue.
///
/// Holds only a weak reference to the table: the queue drains and stops when
/// the last table handle is dropped, and a `SendKey` that outlives the table
/// still releases its uid.
pub(crate) struct OfferExecutor {
    table: Weak<FailureTableInner>,
    datastore: Arc<dyn Datastore>,
    client_core: Arc<dyn ClientCore>,
    uid_tracker: Arc<dyn UidTracker>,
    transmitter: Arc<dyn BlockTransmitter>,
    stats: Arc<OfferStats>,
    send_legacy_ssk_format: bool,
}

impl OfferExecutor {
    pub(crate) fn new(
        table: Weak<FailureTableInner>,
        datastore: Arc<dyn Datastore>,
        client_core: Arc<dyn ClientCore>,
        uid_tracker: Arc<dyn UidTracker>,
        transmitter: Arc<dyn BlockTransmitter>,
        stats: Arc<OfferStats>,
        send_legacy_ssk_format: bool,
    ) -> Self {
        Self {
            table,
            datastore,
            client_core,
            uid_tracker,
            transmitter,
            stats,
            send_legacy_ssk_format,
        }
    }

    pub(crate) async fn run(self, mut rx: mpsc::UnboundedReceiver<OfferWork>) {
        while let Some(work) = rx.recv().await {
            match work {
                OfferWork::Offer {
                    key,
                    peer,
                    authenticator,
                } => self.validate_offer(key, peer, authenticator).await,
                OfferWork::SendKey {
                    key,
                    need_pub_key,
                    uid,
                    source,
                } => self.serve_offered_key(key, need_pub_key, uid, source).await,
            }
        }
        trace!("offer executor stopped");
    }

    /// Offer acceptance policy. We accept iff we asked that peer for the
    /// key, or — for CHKs only — that peer asked us. CHKs are
    /// content-addressed and unforgeable, so bidirectional propagation is
    /// safe there; an SSK offer from a peer we never routed to could be bait.
    async fn validate_offer(&self, key: Key, peer: Arc<dyn PeerNode>, authenticator: [u8; 32]) {
        if self.datastore.has_key(&key).await {
            debug!(key = %key.short(), "offer redundant: already have the key");
            return;
        }

        // The entry can have been consumed while this job sat in the queue.
        let Some(inner) = self.table.upgrade() else {
            return;
        };
        let table = FailureTable::from_inner(inner);
        let now = Instant::now();
        let Some(entry) = table.peek_entry(&key) else {
            debug!(key = %key.short(), "offer dropped: we never asked for the key");
            return;
        };

        let peer_id = peer.peer_id();
        let we_asked = entry.asked_from_peer(peer_id, now);
        let he_asked = entry.asked_by_peer(peer_id, now);
        if !(we_asked || (key.is_chk() && he_asked)) {
            debug!(
                key = %key.short(),
                peer = %peer_id.short(),
                we_asked,
                he_asked,
                "offer not accepted"
            );
            OfferStats::add(&self.stats.offers_rejected, 1);
            table.remove_entry_if_empty(&key, &entry, now);
            return;
        }
        table.remove_entry_if_empty(&key, &entry, now);

        // Valid offer; remember who can give us the block.
        let offer = BlockOffer::new(
            PeerHandle::new(&peer),
            now,
            authenticator,
            peer.boot_id(),
        );
        table.add_offer(key, offer, now);
        OfferStats::add(&self.stats.offers_accepted, 1);
        debug!(key = %key.short(), peer = %peer_id.short(), "offer accepted");

        let others_want = entry.others_want(Some(peer_id), now);
        self.client_core.maybe_queue_offered_key(key, others_want);
    }

    /// Serve a claim on an offered key. The fetch happens here; sends that
    /// can park go to workers. `uid` is released by guard on every path.
    async fn serve_offered_key(
        &self,
        key: Key,
        need_pub_key: bool,
        uid: u64,
        source: Arc<dyn PeerNode>,
    ) {
        let guard = UidGuard::new(self.uid_tracker.clone(), uid, key.is_ssk());

        let block = self.datastore.fetch(&key).await;
        match (key.is_ssk(), block) {
            (true, Some(KeyBlock::Ssk(block))) => {
                self.serve_ssk(block, need_pub_key, uid, source, guard);
            }
            (false, Some(KeyBlock::Chk(block))) => {
                self.serve_chk(block, uid, source, guard);
            }
            (_, other) => {
                if other.is_some() {
                    warn!(key = %key.short(), "datastore returned a block of the wrong kind");
                }
                debug!(key = %key.short(), uid, "offered key claimed but not in store");
                OfferStats::add(&self.stats.offered_blocks_missing, 1);
                let _ = source.send(Message::GetOfferedKeyInvalid {
                    uid,
                    reason: OfferRejectReason::NoKey,
                });
                // guard drops here: uid released.
            }
        }
    }

    /// SSK wire order matters for compatibility: headers first, then the
    /// data send is started, then the legacy combined message (old-format
    /// peers), then the public key if the claimant asked for it.
    fn serve_ssk(
        &self,
        block: crate::key::SskBlock,
        need_pub_key: bool,
        uid: u64,
        source: Arc<dyn PeerNode>,
        guard: UidGuard,
    ) {
        let headers = Message::SskDataFoundHeaders {
            uid,
            headers: block.headers().to_vec(),
        };
        if let Err(e) = source.send(headers) {
            debug!(uid, error = %e, "claimant gone before SSK headers");
            OfferStats::add(&self.stats.send_failures, 1);
            return; // guard releases uid
        }

        let data = block.data().to_vec();
        let data_len = data.len();
        let data_msg = Message::SskDataFoundData { uid, data };
        let stats = self.stats.clone();
        let worker_source = source.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match worker_source
                .send_throttled(data_msg, data_len, OFFER_SEND_DEADLINE)
                .await
            {
                Ok(()) => {
                    OfferStats::add(&stats.offered_blocks_sent, 1);
                    OfferStats::add(&stats.payload_bytes_sent, data_len as u64);
                }
                Err(SendError::Disconnected) => {
                    trace!(uid, "claimant disconnected during SSK data send");
                    OfferStats::add(&stats.send_failures, 1);
                }
                Err(SendError::Timeout) => {
                    warn!(uid, "waited too long sending offered SSK data");
                    OfferStats::add(&stats.send_failures, 1);
                }
            }
        });

        if self.send_legacy_ssk_format {
            let _ = source.send(Message::SskDataFound {
                uid,
                headers: block.headers().to_vec(),
                data: block.data().to_vec(),
            });
        }
        if need_pub_key {
            let _ = source.send(Message::SskPubKey {
                uid,
                pub_key: block.pub_key().to_vec(),
            });
        }
    }

    fn serve_chk(
        &self,
        block: crate::key::ChkBlock,
        uid: u64,
        source: Arc<dyn PeerNode>,
        guard: UidGuard,
    ) {
        let headers = Message::ChkDataFound {
            uid,
            headers: block.headers().to_vec(),
        };
        if let Err(e) = source.send(headers) {
            debug!(uid, error = %e, "claimant gone before CHK headers");
            OfferStats::add(&self.stats.send_failures, 1);
            return; // guard releases uid
        }

        let data = block.data().to_vec();
        let data_len = data.len();
        let transmitter = self.transmitter.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match transmitter.send_block(source, uid, data).await {
                Ok(()) => {
                    OfferStats::add(&stats.offered_blocks_sent, 1);
                    OfferStats::add(&stats.payload_bytes_sent, data_len as u64);
                }
                Err(e) => {
                    warn!(uid, error = %e, "offered CHK transfer failed");
                    OfferStats::add(&stats.send_failures, 1);
                }
            }
        });
    }
}
