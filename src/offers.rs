//! # Received Offers
//!
//! When a peer tells us a previously-DNFed key is now available from them, we
//! record a [`BlockOffer`]: who offered, when, under which authenticator, and
//! the boot id we observed so a restart invalidates the offer.
//!
//! Offers for one key live in a [`BlockOfferList`]; the table keeps those in
//! a bounded LRU index. Consumers walk the offers through [`OfferList`],
//! which hands them out in uniformly random order (recent before expired) to
//! frustrate traffic analysis, and requires every offer to be explicitly
//! accepted or kept before the next one is drawn.

use std::sync::Arc;

use parking_lot::Mutex;

use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::key::Key;
use crate::peer::PeerHandle;
use crate::table::FailureTable;

/// Offers go stale after this long; stale offers are still tried, but only
/// after every fresh one has been.
pub const OFFER_EXPIRY_TIME: Duration = Duration::from_secs(10 * 60);

/// A single recorded offer of a key by a peer.
pub struct BlockOffer {
    offered_time: Instant,
    peer: PeerHandle,
    authenticator: [u8; 32],
    /// Peer's boot counter observed when the offer arrived.
    boot_id: u64,
}

impl BlockOffer {
    pub fn new(peer: PeerHandle, now: Instant, authenticator: [u8; 32], boot_id: u64) -> Self {
        Self {
            offered_time: now,
            peer,
            authenticator,
            boot_id,
        }
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    pub fn offered_time(&self) -> Instant {
        self.offered_time
    }

    pub fn authenticator(&self) -> &[u8; 32] {
        &self.authenticator
    }

    pub fn boot_id(&self) -> u64 {
        self.boot_id
    }

    pub fn expired(&self, now: Instant) -> bool {
        now > self.offered_time + OFFER_EXPIRY_TIME
    }
}

impl std::fmt::Debug for BlockOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockOffer")
            .field("peer", &self.peer.peer_id().short())
            .field("boot_id", &self.boot_id)
            .finish()
    }
}

/// All current offers for one key.
///
/// Offers are shared as `Arc`s; removal is by pointer identity, so two offers
/// from the same peer at the same instant stay distinguishable.
pub struct BlockOfferList {
    key: Key,
    offers: Mutex<Vec<Arc<BlockOffer>>>,
}

impl BlockOfferList {
    pub fn new(key: Key, first: BlockOffer) -> Self {
        Self {
            key,
            offers: Mutex::new(vec![Arc::new(first)]),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn add_offer(&self, offer: BlockOffer) {
        self.offers.lock().push(Arc::new(offer));
    }

    pub fn len(&self) -> usize {
        self.offers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest point at which any offer in the list is still fresh.
    pub fn expires(&self) -> Instant {
        let offers = self.offers.lock();
        let mut last: Option<Instant> = None;
        for o in offers.iter() {
            if last.map_or(true, |l| o.offered_time > l) {
                last = Some(o.offered_time);
            }
        }
        // An emptied list expired in the distant past as far as trimming cares.
        last.map_or_else(Instant::now, |l| l + OFFER_EXPIRY_TIME)
    }

    /// True when every offer in the list has expired.
    pub fn all_expired(&self, now: Instant) -> bool {
        self.offers.lock().iter().all(|o| o.expired(now))
    }

    pub fn snapshot(&self) -> Vec<Arc<BlockOffer>> {
        self.offers.lock().clone()
    }

    /// Remove one offer by pointer identity. Returns whether the list is now
    /// empty (the caller then drops the list from the index).
    pub fn remove_offer(&self, offer: &Arc<BlockOffer>) -> bool {
        let mut offers = self.offers.lock();
        if let Some(pos) = offers.iter().position(|o| Arc::ptr_eq(o, offer)) {
            offers.remove(pos);
            trace!(key = %self.key.short(), remaining = offers.len(), "offer deleted");
        }
        offers.is_empty()
    }

    /// Drop expired offers. Returns (how many were dropped, list now empty).
    pub fn prune_expired(&self, now: Instant) -> (usize, bool) {
        let mut offers = self.offers.lock();
        let before = offers.len();
        offers.retain(|o| !o.expired(now));
        (before - offers.len(), offers.is_empty())
    }
}

/// Iterator over the offers for one key, drawn in uniformly random order.
///
/// Fresh offers are exhausted before expired ones. After `next_offer`
/// returns an offer, exactly one of [`OfferList::accept_last`] (the offer was
/// used; delete it) or [`OfferList::keep_last`] (leave it for a future
/// attempt) must be called before drawing again. Anything else is a
/// programmer error and panics.
pub struct OfferList {
    table: FailureTable,
    list: Arc<BlockOfferList>,
    recent: Vec<Arc<BlockOffer>>,
    expired: Vec<Arc<BlockOffer>>,
    last: Option<Arc<BlockOffer>>,
}

impl OfferList {
    pub(crate) fn new(table: FailureTable, list: Arc<BlockOfferList>, now: Instant) -> Self {
        let mut recent = Vec::new();
        let mut expired = Vec::new();
        for offer in list.snapshot() {
            if offer.expired(now) {
                expired.push(offer);
            } else {
                recent.push(offer);
            }
        }
        trace!(
            key = %list.key().short(),
            recent = recent.len(),
            expired = expired.len(),
            "offer iteration started"
        );
        Self {
            table,
            list,
            recent,
            expired,
            last: None,
        }
    }

    /// Draw a random offer: from the fresh ones while any remain, then from
    /// the expired ones. `None` when exhausted.
    ///
    /// # Panics
    ///
    /// If the previous offer was neither accepted nor kept.
    pub fn next_offer(&mut self) -> Option<Arc<BlockOffer>> {
        assert!(
            self.last.is_none(),
            "previous offer not dealt with: call accept_last or keep_last first"
        );
        let bucket = if !self.recent.is_empty() {
            &mut self.recent
        } else if !self.expired.is_empty() {
            &mut self.expired
        } else {
            return None;
        };
        let idx = self.table.random_index(bucket.len());
        let offer = bucket.swap_remove(idx);
        self.last = Some(offer.clone());
        Some(offer)
    }

    /// The last offer was used (successfully or not): delete it from the
    /// underlying list.
    ///
    /// # Panics
    ///
    /// If there is no outstanding offer.
    pub fn accept_last(&mut self) {
        let offer = self
            .last
            .take()
            .expect("accept_last without an outstanding offer");
        self.table.delete_offer(&self.list, &offer);
    }

    /// The last offer could not be used right now (e.g. overload); leave it
    /// in place for future iterations.
    ///
    /// # Panics
    ///
    /// If there is no outstanding offer.
    pub fn keep_last(&mut self) {
        assert!(
            self.last.take().is_some(),
            "keep_last without an outstanding offer"
        );
    }
}
