//! # Failure Table Coordinator
//!
//! Tracks recently DNFed keys: where we routed them, who asked us for them,
//! and for how long a failure should suppress re-requests. Implements
//! ultra-lightweight persistent requests: when a DNFed key is later found
//! anywhere, the recorded requestors get a push offer instead of having to
//! poll.
//!
//! ## Structure
//!
//! - Two bounded LRU indices under one coarse lock: key → [`FailureTableEntry`]
//!   and key → [`BlockOfferList`].
//! - A single-consumer serial executor (see `serve.rs`) for everything that
//!   touches the datastore, so disk latency never lands on a transport thread.
//! - A periodic cleaner task and memory-pressure shedding hooks.
//!
//! ## Locking
//!
//! Take the table lock first if you need both; entry and offer-list locks are
//! for cheap internal mutation only. No code path acquires the table lock
//! while holding an entry or list lock, and nothing does I/O under any lock.
//!
//! PRIVACY: the table is in-memory only and forgets aggressively. The moment
//! a key is found, its entry is deleted (before any offers go out) so a
//! seized node reveals as little as possible about who asked for what.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::entry::{offer_authenticator, FailureTableEntry};
use crate::key::{Key, KeyBlock};
use crate::offers::{BlockOffer, BlockOfferList, OfferList};
use crate::peer::{PeerId, PeerNode};
use crate::protocols::{BlockTransmitter, ClientCore, Datastore, UidTracker};
use crate::serve::{OfferExecutor, OfferWork};

/// Maximum number of keys tracked in the entries index.
pub const MAX_ENTRIES: usize = 2 * 1000;

/// Maximum number of keys tracked in the offers index.
pub const MAX_OFFERS: usize = 1000;

/// How often the cleaner sweeps both indices. Saves memory and, more
/// importantly, limits how far back a seized node can be interrogated.
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Runtime configuration. The two feature flags are re-read on every
/// operation, so the node can toggle them without rebuilding the table.
#[derive(Debug, Clone)]
pub struct FailureTableConfig {
    /// Gates offer propagation: outgoing offers on `on_found`, acceptance of
    /// incoming offers, and `get_offers`.
    pub enable_ulpr_propagation: bool,
    /// Gates per-node failure recording (`on_failed` / `on_final_failure`)
    /// and the timed-out-nodes view.
    pub enable_per_node_failure_tables: bool,
    /// Also emit the legacy combined SSK data-found message for peers
    /// speaking the old wire format.
    pub send_legacy_ssk_format: bool,
    /// Seed for the offer-selection RNG. `None` seeds from the OS; tests
    /// pin it for deterministic iteration order.
    pub offer_selection_seed: Option<u64>,
}

impl Default for FailureTableConfig {
    fn default() -> Self {
        Self {
            enable_ulpr_propagation: true,
            enable_per_node_failure_tables: true,
            send_legacy_ssk_format: false,
            offer_selection_seed: None,
        }
    }
}

/// Memory pressure levels fed to [`FailureTable::spawn_memory_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Normal,
    /// Shed half of the entries index.
    Low,
    /// Drop the entries index entirely. The offers index is smaller and more
    /// valuable, so it survives.
    Critical,
}

/// Counters for offer traffic, mirrored out through [`OfferStatsSnapshot`].
#[derive(Default)]
pub(crate) struct OfferStats {
    pub(crate) offers_sent: AtomicU64,
    pub(crate) offers_received: AtomicU64,
    pub(crate) offers_accepted: AtomicU64,
    pub(crate) offers_rejected: AtomicU64,
    pub(crate) offered_blocks_sent: AtomicU64,
    pub(crate) offered_blocks_missing: AtomicU64,
    pub(crate) send_failures: AtomicU64,
    pub(crate) payload_bytes_sent: AtomicU64,
}

impl OfferStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> OfferStatsSnapshot {
        OfferStatsSnapshot {
            offers_sent: self.offers_sent.load(Ordering::Relaxed),
            offers_received: self.offers_received.load(Ordering::Relaxed),
            offers_accepted: self.offers_accepted.load(Ordering::Relaxed),
            offers_rejected: self.offers_rejected.load(Ordering::Relaxed),
            offered_blocks_sent: self.offered_blocks_sent.load(Ordering::Relaxed),
            offered_blocks_missing: self.offered_blocks_missing.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            payload_bytes_sent: self.payload_bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the offer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferStatsSnapshot {
    pub offers_sent: u64,
    pub offers_received: u64,
    pub offers_accepted: u64,
    pub offers_rejected: u64,
    pub offered_blocks_sent: u64,
    pub offered_blocks_missing: u64,
    pub send_failures: u64,
    pub payload_bytes_sent: u64,
}

struct Tables {
    entries: LruCache<Key, Arc<FailureTableEntry>>,
    offers: LruCache<Key, Arc<BlockOfferList>>,
}

pub(crate) struct FailureTableInner {
    tables: Mutex<Tables>,
    /// Process-local keyed-hash key for offer authenticators. Regenerated
    /// every start, so offers do not survive a restart.
    auth_key: [u8; 32],
    /// Our own boot counter, carried in outgoing offers.
    local_boot_id: u64,
    ulpr_propagation: AtomicBool,
    per_node_failure_tables: AtomicBool,
    rng: Mutex<StdRng>,
    pub(crate) stats: Arc<OfferStats>,
    client_core: Arc<dyn ClientCore>,
    uid_tracker: Arc<dyn UidTracker>,
    offer_tx: mpsc::UnboundedSender<OfferWork>,
}

/// Handle to the failure table. Cheap to clone; the table and its background
/// tasks shut down when the last handle is dropped.
#[derive(Clone)]
pub struct FailureTable {
    inner: Arc<FailureTableInner>,
}

impl FailureTable {
    /// Build the table and spawn its serial offer executor and cleaner.
    /// Must be called within a tokio runtime.
    pub fn new(
        datastore: Arc<dyn Datastore>,
        client_core: Arc<dyn ClientCore>,
        uid_tracker: Arc<dyn UidTracker>,
        transmitter: Arc<dyn BlockTransmitter>,
        config: FailureTableConfig,
    ) -> Self {
        let mut auth_key = [0u8; 32];
        OsRng.fill_bytes(&mut auth_key);

        let rng = match config.offer_selection_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let stats = Arc::new(OfferStats::default());
        let (offer_tx, offer_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(FailureTableInner {
            tables: Mutex::new(Tables {
                entries: LruCache::unbounded(),
                offers: LruCache::unbounded(),
            }),
            auth_key,
            local_boot_id: OsRng.next_u64(),
            ulpr_propagation: AtomicBool::new(config.enable_ulpr_propagation),
            per_node_failure_tables: AtomicBool::new(config.enable_per_node_failure_tables),
            rng: Mutex::new(rng),
            stats: stats.clone(),
            client_core: client_core.clone(),
            uid_tracker: uid_tracker.clone(),
            offer_tx,
        });

        let executor = OfferExecutor::new(
            Arc::downgrade(&inner),
            datastore,
            client_core,
            uid_tracker,
            transmitter,
            stats,
            config.send_legacy_ssk_format,
        );
        tokio::spawn(executor.run(offer_rx));

        let table = Self { inner };
        table.spawn_cleaner();
        table
    }

    // ------------------------------------------------------------------
    // Feature flags
    // ------------------------------------------------------------------

    pub fn set_ulpr_propagation(&self, enabled: bool) {
        self.inner
            .ulpr_propagation
            .store(enabled, Ordering::Relaxed);
    }

    pub fn set_per_node_failure_tables(&self, enabled: bool) {
        self.inner
            .per_node_failure_tables
            .store(enabled, Ordering::Relaxed);
    }

    fn ulpr_enabled(&self) -> bool {
        self.inner.ulpr_propagation.load(Ordering::Relaxed)
    }

    fn recording_enabled(&self) -> bool {
        self.ulpr_enabled()
            || self
                .inner
                .per_node_failure_tables
                .load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Failure recording (routing layer)
    // ------------------------------------------------------------------

    /// A routing attempt to `routed_to` failed but the request continues.
    /// The timeout is normally the time it took to route there and give up.
    pub fn on_failed(
        &self,
        key: Key,
        routed_to: &Arc<dyn PeerNode>,
        htl: u8,
        timeout: Duration,
    ) {
        if !self.recording_enabled() {
            return;
        }
        let now = Instant::now();
        let entry = self.get_or_create_entry(key, now);
        entry.failed_to(routed_to, timeout, now, htl);
    }

    /// The request terminated in data-not-found. Records the last routed-to
    /// peer and, if given, the downstream requestor to offer the key to
    /// later.
    pub fn on_final_failure(
        &self,
        key: Key,
        routed_to: Option<&Arc<dyn PeerNode>>,
        htl: u8,
        timeout: Duration,
        requestor: Option<&Arc<dyn PeerNode>>,
    ) {
        if !self.recording_enabled() {
            return;
        }
        let now = Instant::now();
        let entry = self.get_or_create_entry(key, now);
        if let Some(peer) = routed_to {
            entry.failed_to(peer, timeout, now, htl);
        }
        if let Some(peer) = requestor {
            entry.add_requestor(peer, now);
        }
    }

    fn get_or_create_entry(&self, key: Key, now: Instant) -> Arc<FailureTableEntry> {
        let mut tables = self.inner.tables.lock();
        let entry = match tables.entries.get(&key) {
            Some(entry) => entry.clone(),
            None => {
                let entry = Arc::new(FailureTableEntry::new(key, now));
                tables.entries.put(key, entry.clone());
                entry
            }
        };
        // `get` already moved an existing key to the MRU end.
        while tables.entries.len() > MAX_ENTRIES {
            tables.entries.pop_lru();
        }
        entry
    }

    // ------------------------------------------------------------------
    // Found keys (datastore)
    // ------------------------------------------------------------------

    /// A block was stored locally. If an entry exists for its key, it is
    /// consumed (along with the key's offer list) and the block is offered
    /// to every recorded requestor. No entry means nobody asked; nothing is
    /// touched.
    ///
    /// PRIVACY: the deletion happens *first*, and even when offer
    /// propagation is disabled — keeping requestor identities around after
    /// the data exists would hand them to anyone who seizes the node.
    pub fn on_found(&self, block: &KeyBlock) {
        if !self.recording_enabled() {
            return;
        }
        let key = *block.key();
        let entry = {
            let mut tables = self.inner.tables.lock();
            let entry = tables.entries.pop(&key);
            if entry.is_some() {
                tables.offers.pop(&key);
            }
            entry
        };
        let Some(entry) = entry else {
            return; // nobody cares
        };
        if !self.ulpr_enabled() {
            return;
        }
        let sent = entry.offer(&self.inner.auth_key, self.inner.local_boot_id, Instant::now());
        OfferStats::add(&self.inner.stats.offers_sent, sent as u64);
    }

    // ------------------------------------------------------------------
    // Incoming offers (transport)
    // ------------------------------------------------------------------

    /// A peer offered us `key`. Cheap gate on the transport thread: if we
    /// never asked for the key there is nothing to do. Real validation needs
    /// a datastore probe, so it is handed to the serial executor.
    pub fn on_offer(&self, key: Key, peer: &Arc<dyn PeerNode>, authenticator: [u8; 32]) {
        if !self.ulpr_enabled() {
            return;
        }
        OfferStats::add(&self.inner.stats.offers_received, 1);
        {
            let tables = self.inner.tables.lock();
            if tables.entries.peek(&key).is_none() {
                trace!(key = %key.short(), peer = %peer.peer_id().short(), "unsolicited offer dropped");
                return;
            }
        }
        let _ = self.inner.offer_tx.send(OfferWork::Offer {
            key,
            peer: peer.clone(),
            authenticator,
        });
    }

    /// A peer is claiming a key we offered it. Runs on the serial executor;
    /// the executor releases `uid` on every exit path.
    pub fn send_offered_key(
        &self,
        key: Key,
        need_pub_key: bool,
        uid: u64,
        source: &Arc<dyn PeerNode>,
    ) {
        let work = OfferWork::SendKey {
            key,
            need_pub_key,
            uid,
            source: source.clone(),
        };
        if self.inner.offer_tx.send(work).is_err() {
            // Executor is gone (shutdown); the uid must still be released.
            self.inner.uid_tracker.unlock_uid(uid, key.is_ssk());
        }
    }

    // ------------------------------------------------------------------
    // Offer consumption (client / request starters)
    // ------------------------------------------------------------------

    /// Iterate the current offers for `key`, randomised, fresh before stale.
    pub fn get_offers(&self, key: Key) -> Option<OfferList> {
        if !self.ulpr_enabled() {
            return None;
        }
        let list = {
            let tables = self.inner.tables.lock();
            tables.offers.peek(&key).cloned()
        }?;
        Some(OfferList::new(self.clone(), list, Instant::now()))
    }

    /// True iff any recorded requestor for `key` is still alive, connected
    /// and fresh.
    pub fn peers_want_key(&self, key: Key) -> bool {
        let entry = {
            let tables = self.inner.tables.lock();
            tables.entries.peek(&key).cloned()
        };
        match entry {
            Some(entry) => entry.others_want(None, Instant::now()),
            None => false,
        }
    }

    /// Read-only timeout view for the routing layer: which peers are under a
    /// suppression deadline for `key`.
    pub fn timed_out_nodes_list(&self, key: Key) -> Option<Arc<FailureTableEntry>> {
        if !self
            .inner
            .per_node_failure_tables
            .load(Ordering::Relaxed)
        {
            return None;
        }
        let tables = self.inner.tables.lock();
        tables.entries.peek(&key).cloned()
    }

    /// True while `key` had a failure recorded within `REJECT_TIME`. The
    /// request starters consult this to fail fast instead of re-routing into
    /// a known recent DNF.
    pub fn recently_failed(&self, key: Key) -> bool {
        if !self
            .inner
            .per_node_failure_tables
            .load(Ordering::Relaxed)
        {
            return false;
        }
        let entry = {
            let tables = self.inner.tables.lock();
            tables.entries.peek(&key).cloned()
        };
        match entry {
            Some(entry) => entry.recently_failed(Instant::now()),
            None => false,
        }
    }

    /// Recompute the authenticator we would have attached to an offer of
    /// `key` to `peer`, for verifying an echoed claim.
    pub fn offer_authenticator_for(&self, key: &Key, peer: PeerId) -> [u8; 32] {
        offer_authenticator(&self.inner.auth_key, key, peer)
    }

    /// Peer lifecycle hook. Stale handles for the peer age out through the
    /// periodic cleanup; nothing to do eagerly.
    pub fn on_disconnect(&self, peer: &Arc<dyn PeerNode>) {
        if !self.recording_enabled() {
            return;
        }
        trace!(peer = %peer.peer_id().short(), "peer disconnected");
    }

    pub fn stats(&self) -> OfferStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.tables.lock().entries.len()
    }

    pub fn offer_count(&self) -> usize {
        self.inner.tables.lock().offers.len()
    }

    // ------------------------------------------------------------------
    // Cleanup and shedding
    // ------------------------------------------------------------------

    fn spawn_cleaner(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_PERIOD);
            tick.tick().await; // the immediate first tick
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.clean(Instant::now());
            }
            trace!("failure table cleaner stopped");
        });
    }

    /// Shed memory: halve the entries index, oldest first.
    pub fn handle_low_memory(&self) {
        let mut tables = self.inner.tables.lock();
        let target = tables.entries.len() / 2;
        while tables.entries.len() > target {
            if tables.entries.pop_lru().is_none() {
                break;
            }
        }
        warn!(remaining = tables.entries.len(), "low memory: halved failure table");
    }

    /// Shed memory hard: drop the whole entries index. Offers survive.
    pub fn handle_out_of_memory(&self) {
        let mut tables = self.inner.tables.lock();
        tables.entries.clear();
        warn!("out of memory: cleared failure table entries");
    }

    /// Drive shedding from a node-wide memory pressure signal.
    pub fn spawn_memory_listener(&self, mut rx: watch::Receiver<MemoryPressure>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let level = *rx.borrow();
                let Some(inner) = weak.upgrade() else { break };
                let table = FailureTable { inner };
                match level {
                    MemoryPressure::Normal => {}
                    MemoryPressure::Low => table.handle_low_memory(),
                    MemoryPressure::Critical => table.handle_out_of_memory(),
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Internal: executor and iterator support
    // ------------------------------------------------------------------

    /// Non-promoting entry lookup for the serial executor's re-check.
    pub(crate) fn peek_entry(&self, key: &Key) -> Option<Arc<FailureTableEntry>> {
        let tables = self.inner.tables.lock();
        tables.entries.peek(key).cloned()
    }

    /// Drop `key` from the entries index if its entry reports empty.
    pub(crate) fn remove_entry_if_empty(&self, key: &Key, entry: &FailureTableEntry, now: Instant) {
        if entry.is_empty(now) {
            let mut tables = self.inner.tables.lock();
            tables.entries.pop(key);
        }
    }

    /// Record an accepted offer, pushing its list to the MRU end and
    /// trimming the offers index.
    pub(crate) fn add_offer(&self, key: Key, offer: BlockOffer, now: Instant) {
        let mut tables = self.inner.tables.lock();
        let list = match tables.offers.peek(&key) {
            Some(list) => {
                let list = list.clone();
                list.add_offer(offer);
                list
            }
            None => Arc::new(BlockOfferList::new(key, offer)),
        };
        tables.offers.put(key, list);
        Self::trim_offers(&mut tables, now);
    }

    /// From the LRU end, drop offer lists that are entirely expired, then
    /// enforce the size cap. Eviction is silent.
    fn trim_offers(tables: &mut Tables, now: Instant) {
        loop {
            let evict = match tables.offers.peek_lru() {
                Some((_, list)) => list.all_expired(now) || tables.offers.len() > MAX_OFFERS,
                None => false,
            };
            if !evict {
                return;
            }
            if let Some((key, _)) = tables.offers.pop_lru() {
                trace!(key = %key.short(), "offer list evicted");
            }
        }
    }

    /// Delete one consumed offer; an emptied list is dropped from the index
    /// and the client core told to forget the key.
    pub(crate) fn delete_offer(&self, list: &Arc<BlockOfferList>, offer: &Arc<BlockOffer>) {
        let emptied = list.remove_offer(offer);
        if emptied {
            {
                let mut tables = self.inner.tables.lock();
                tables.offers.pop(list.key());
            }
            self.inner.client_core.dequeue_offered_key(*list.key());
        }
    }

    /// Uniform random index below `len`, from the injected RNG.
    pub(crate) fn random_index(&self, len: usize) -> usize {
        debug_assert!(len > 0);
        self.inner.rng.lock().gen_range(0..len)
    }

    pub(crate) fn from_inner(inner: Arc<FailureTableInner>) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn clean_at(&self, now: Instant) {
        self.inner.clean(now);
    }
}

impl FailureTableInner {
    /// One cleaner sweep: prune every entry (no table lock held), drop the
    /// ones that end up empty, then prune expired offers.
    fn clean(&self, now: Instant) {
        let started = Instant::now();

        let entries: Vec<(Key, Arc<FailureTableEntry>)> = {
            let tables = self.tables.lock();
            tables
                .entries
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect()
        };
        let mut removed = 0usize;
        for (key, entry) in entries {
            entry.cleanup(now);
            if entry.is_empty(now) {
                let mut tables = self.tables.lock();
                tables.entries.pop(&key);
                removed += 1;
            }
        }

        let lists: Vec<(Key, Arc<BlockOfferList>)> = {
            let tables = self.tables.lock();
            tables.offers.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        let mut dequeued = 0usize;
        for (key, list) in lists {
            let (_, emptied) = list.prune_expired(now);
            if emptied {
                {
                    let mut tables = self.tables.lock();
                    tables.offers.pop(&key);
                }
                self.client_core.dequeue_offered_key(key);
                dequeued += 1;
            }
        }

        debug!(
            removed_entries = removed,
            removed_offer_lists = dequeued,
            took_ms = started.elapsed().as_millis() as u64,
            "failure table cleanup"
        );
    }
}
