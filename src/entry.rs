//! # Per-Key Failure State
//!
//! One [`FailureTableEntry`] exists for each recently-DNFed key. It remembers
//! which peers we routed the request to (and until when re-routing to them is
//! pointless) and which peers asked us for the key (so we can offer it to
//! them if it turns up).
//!
//! Entries keep their own lock for internal mutation. Lock order is always
//! table first, then entry; entry methods never call back into the table.
//!
//! PRIVACY: everything in here is a record of who wanted what. Members age
//! out after `MAX_LIFETIME`, and the whole entry is consumed the moment the
//! key is found (see `FailureTable::on_found`).

use std::sync::Arc;

use parking_lot::Mutex;

use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::key::Key;
use crate::messages::Message;
use crate::peer::{PeerHandle, PeerId, PeerNode};

/// How long a recorded failure suppresses re-routing to the same peer.
pub const REJECT_TIME: Duration = Duration::from_secs(10 * 60);

/// Total lifetime of an entry. Past this every member is stale and the entry
/// reports itself empty regardless of contents.
pub const MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// A peer that asked us for the key.
struct RequestorRecord {
    handle: PeerHandle,
    last_asked: Instant,
}

/// A peer we routed the request to.
struct RoutedToRecord {
    handle: PeerHandle,
    last_tried: Instant,
    /// Re-routing to this peer is suppressed until this deadline. Only ever
    /// moves forward for a given peer.
    timeout_until: Instant,
    htl: u8,
}

struct EntryState {
    last_update: Instant,
    requestors: Vec<RequestorRecord>,
    routed_to: Vec<RoutedToRecord>,
}

/// Per-key record of requestors and routed-to peers.
pub struct FailureTableEntry {
    key: Key,
    creation_time: Instant,
    state: Mutex<EntryState>,
}

impl FailureTableEntry {
    pub fn new(key: Key, now: Instant) -> Self {
        Self {
            key,
            creation_time: now,
            state: Mutex::new(EntryState {
                last_update: now,
                requestors: Vec::new(),
                routed_to: Vec::new(),
            }),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn creation_time(&self) -> Instant {
        self.creation_time
    }

    pub fn last_update(&self) -> Instant {
        self.state.lock().last_update
    }

    /// Record that routing to `peer` failed; suppress re-routing to it for
    /// `timeout`. An existing later suppression deadline is kept.
    pub fn failed_to(&self, peer: &Arc<dyn PeerNode>, timeout: Duration, now: Instant, htl: u8) {
        let deadline = now + timeout;
        let id = peer.peer_id();
        let mut state = self.state.lock();
        state.last_update = now;
        if let Some(rec) = state.routed_to.iter_mut().find(|r| r.handle.peer_id() == id) {
            rec.last_tried = now;
            rec.htl = htl;
            if deadline > rec.timeout_until {
                rec.timeout_until = deadline;
            }
        } else {
            state.routed_to.push(RoutedToRecord {
                handle: PeerHandle::new(peer),
                last_tried: now,
                timeout_until: deadline,
                htl,
            });
        }
        trace!(
            key = %self.key.short(),
            peer = %id.short(),
            htl,
            timeout_ms = timeout.as_millis() as u64,
            "recorded routing failure"
        );
    }

    /// Record that `peer` asked us for the key.
    pub fn add_requestor(&self, peer: &Arc<dyn PeerNode>, now: Instant) {
        let id = peer.peer_id();
        let mut state = self.state.lock();
        state.last_update = now;
        if let Some(rec) = state.requestors.iter_mut().find(|r| r.handle.peer_id() == id) {
            rec.last_asked = now;
        } else {
            state.requestors.push(RequestorRecord {
                handle: PeerHandle::new(peer),
                last_asked: now,
            });
        }
    }

    /// Did we route the request for this key to `peer` recently?
    pub fn asked_from_peer(&self, peer: PeerId, now: Instant) -> bool {
        let state = self.state.lock();
        state
            .routed_to
            .iter()
            .any(|r| r.handle.peer_id() == peer && now.duration_since(r.last_tried) <= MAX_LIFETIME)
    }

    /// Did `peer` ask us for this key recently?
    pub fn asked_by_peer(&self, peer: PeerId, now: Instant) -> bool {
        let state = self.state.lock();
        state
            .requestors
            .iter()
            .any(|r| r.handle.peer_id() == peer && now.duration_since(r.last_asked) <= MAX_LIFETIME)
    }

    /// Is any requestor other than `excluded` still interested? Requires the
    /// peer to be alive and connected; dead handles are pruned in passing.
    pub fn others_want(&self, excluded: Option<PeerId>, now: Instant) -> bool {
        let mut state = self.state.lock();
        state
            .requestors
            .retain(|r| r.handle.upgrade().is_some());
        state.requestors.iter().any(|r| {
            Some(r.handle.peer_id()) != excluded
                && now.duration_since(r.last_asked) <= MAX_LIFETIME
                && r.handle.upgrade_connected().is_some()
        })
    }

    /// Suppression deadline for `peer`, if we recently failed routing to it.
    /// The routing layer consults this to avoid re-routing into a known
    /// timeout (see `FailureTable::timed_out_nodes_list`).
    pub fn timeout_for(&self, peer: PeerId, now: Instant) -> Option<Instant> {
        let state = self.state.lock();
        state
            .routed_to
            .iter()
            .find(|r| {
                r.handle.peer_id() == peer
                    && now.duration_since(r.last_tried) <= MAX_LIFETIME
            })
            .map(|r| r.timeout_until)
    }

    /// True while requests for this key should be failed fast: a failure was
    /// recorded within `REJECT_TIME`, so retrying the same neighbourhood now
    /// would only re-DNF.
    pub fn recently_failed(&self, now: Instant) -> bool {
        let state = self.state.lock();
        now.duration_since(state.last_update) <= REJECT_TIME
    }

    /// True when the entry carries no information: both member sets empty, or
    /// the entry has outlived `MAX_LIFETIME` entirely.
    pub fn is_empty(&self, now: Instant) -> bool {
        if now.duration_since(self.creation_time) > MAX_LIFETIME {
            return true;
        }
        let state = self.state.lock();
        state.requestors.is_empty() && state.routed_to.is_empty()
    }

    /// Drop members that are dead weight: gone peers, and records past
    /// `MAX_LIFETIME` (routed-to records additionally must have an elapsed
    /// suppression deadline before age alone evicts them). Returns true if
    /// anything changed so the caller can re-check `is_empty`.
    pub fn cleanup(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let before = state.requestors.len() + state.routed_to.len();
        state.requestors.retain(|r| {
            r.handle.upgrade().is_some() && now.duration_since(r.last_asked) <= MAX_LIFETIME
        });
        state.routed_to.retain(|r| {
            r.handle.upgrade().is_some()
                && !(now.duration_since(r.last_tried) > MAX_LIFETIME && r.timeout_until <= now)
        });
        let changed = state.requestors.len() + state.routed_to.len() != before;
        if changed {
            trace!(key = %self.key.short(), "entry cleanup dropped stale members");
        }
        changed
    }

    /// The key was found: push a `BlockOffer` to every requestor still
    /// reachable. Called with no table lock held; the entry lock is only
    /// taken to snapshot the targets. Returns how many offers went out.
    pub fn offer(&self, auth_key: &[u8; 32], local_boot_id: u64, now: Instant) -> usize {
        let targets: Vec<Arc<dyn PeerNode>> = {
            let state = self.state.lock();
            state
                .requestors
                .iter()
                .filter(|r| now.duration_since(r.last_asked) <= MAX_LIFETIME)
                .filter_map(|r| r.handle.upgrade())
                .collect()
        };
        let mut sent = 0;
        for peer in targets {
            let authenticator = offer_authenticator(auth_key, &self.key, peer.peer_id());
            let msg = Message::BlockOffer {
                key: self.key,
                authenticator,
                boot_id: local_boot_id,
            };
            match peer.send(msg) {
                Ok(()) => {
                    sent += 1;
                    debug!(
                        key = %self.key.short(),
                        peer = %peer.peer_id().short(),
                        "offered found key"
                    );
                }
                Err(e) => {
                    // Best effort; the peer lost interest along with its link.
                    debug!(
                        key = %self.key.short(),
                        peer = %peer.peer_id().short(),
                        error = %e,
                        "offer not sent"
                    );
                }
            }
        }
        sent
    }
}

/// Authenticator tag for an offer of `key` to `peer`.
///
/// Keyed-hash over the full key (variant tag included) and the recipient
/// identity. A peer claiming an offered key must echo this tag; a stolen tag
/// is useless against other peers or a restarted node, since the key is
/// process-local.
pub(crate) fn offer_authenticator(auth_key: &[u8; 32], key: &Key, peer: PeerId) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(auth_key);
    hasher.update(&[key.kind() as u8]);
    hasher.update(key.routing_key());
    hasher.update(peer.as_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockPeer;

    fn as_peer(p: &Arc<MockPeer>) -> Arc<dyn PeerNode> {
        p.clone()
    }

    #[test]
    fn timeout_deadline_is_monotonic() {
        let now = Instant::now();
        let entry = FailureTableEntry::new(Key::chk([1; 32]), now);
        let peer = MockPeer::connected([1; 32]);

        entry.failed_to(&as_peer(&peer), Duration::from_secs(600), now, 10);
        let first = entry.timeout_for(PeerId([1; 32]), now).unwrap();
        assert!(first >= now + Duration::from_secs(600));

        // A later, shorter failure must not pull the deadline back.
        let later = now + Duration::from_secs(5);
        entry.failed_to(&as_peer(&peer), Duration::from_secs(1), later, 9);
        let second = entry.timeout_for(PeerId([1; 32]), later).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn asked_from_and_by_peer() {
        let now = Instant::now();
        let entry = FailureTableEntry::new(Key::chk([2; 32]), now);
        let routed = MockPeer::connected([1; 32]);
        let requestor = MockPeer::connected([2; 32]);

        entry.failed_to(&as_peer(&routed), Duration::from_secs(30), now, 8);
        entry.add_requestor(&as_peer(&requestor), now);

        assert!(entry.asked_from_peer(PeerId([1; 32]), now));
        assert!(!entry.asked_from_peer(PeerId([2; 32]), now));
        assert!(entry.asked_by_peer(PeerId([2; 32]), now));
        assert!(!entry.asked_by_peer(PeerId([1; 32]), now));

        // Records past MAX_LIFETIME stop counting.
        let old = now + MAX_LIFETIME + Duration::from_secs(1);
        assert!(!entry.asked_from_peer(PeerId([1; 32]), old));
        assert!(!entry.asked_by_peer(PeerId([2; 32]), old));
    }

    #[test]
    fn cleanup_drops_gone_peers() {
        let now = Instant::now();
        let entry = FailureTableEntry::new(Key::chk([3; 32]), now);
        let peer = MockPeer::connected([1; 32]);
        entry.failed_to(&as_peer(&peer), Duration::from_secs(600), now, 10);
        entry.add_requestor(&as_peer(&peer), now);

        assert!(!entry.cleanup(now));
        assert!(!entry.is_empty(now));

        drop(peer);
        assert!(entry.cleanup(now));
        assert!(entry.is_empty(now));
    }

    #[test]
    fn cleanup_keeps_routed_record_while_timeout_pending() {
        let now = Instant::now();
        let entry = FailureTableEntry::new(Key::chk([4; 32]), now);
        let peer = MockPeer::connected([1; 32]);
        // Suppression outlives MAX_LIFETIME: the record stays until it elapses.
        entry.failed_to(&as_peer(&peer), MAX_LIFETIME + Duration::from_secs(600), now, 10);

        let aged = now + MAX_LIFETIME + Duration::from_secs(60);
        assert!(!entry.cleanup(aged));
        assert!(entry.timeout_for(PeerId([1; 32]), now).is_some());

        let elapsed = now + MAX_LIFETIME + Duration::from_secs(601);
        assert!(entry.cleanup(elapsed));
    }

    #[test]
    fn recently_failed_window_tracks_last_update() {
        let now = Instant::now();
        let entry = FailureTableEntry::new(Key::chk([8; 32]), now);
        let peer = MockPeer::connected([1; 32]);
        entry.failed_to(&as_peer(&peer), Duration::from_secs(30), now, 10);

        assert!(entry.recently_failed(now + REJECT_TIME));
        assert!(!entry.recently_failed(now + REJECT_TIME + Duration::from_secs(1)));

        // A fresh failure reopens the window.
        let later = now + REJECT_TIME + Duration::from_secs(60);
        entry.failed_to(&as_peer(&peer), Duration::from_secs(30), later, 9);
        assert!(entry.recently_failed(later + Duration::from_secs(1)));
    }

    #[test]
    fn entry_past_max_lifetime_reports_empty() {
        let now = Instant::now();
        let entry = FailureTableEntry::new(Key::chk([5; 32]), now);
        let peer = MockPeer::connected([1; 32]);
        entry.add_requestor(&as_peer(&peer), now);

        assert!(!entry.is_empty(now));
        assert!(entry.is_empty(now + MAX_LIFETIME + Duration::from_secs(1)));
    }

    #[test]
    fn others_want_excludes_the_offerer_and_disconnected() {
        let now = Instant::now();
        let entry = FailureTableEntry::new(Key::chk([6; 32]), now);
        let p1 = MockPeer::connected([1; 32]);
        let p2 = MockPeer::connected([2; 32]);
        entry.add_requestor(&as_peer(&p1), now);
        entry.add_requestor(&as_peer(&p2), now);

        assert!(entry.others_want(Some(PeerId([1; 32])), now));
        p2.set_connected(false);
        assert!(!entry.others_want(Some(PeerId([1; 32])), now));
        assert!(entry.others_want(None, now));
    }

    #[test]
    fn offer_reaches_live_requestors_only() {
        let now = Instant::now();
        let entry = FailureTableEntry::new(Key::chk([7; 32]), now);
        let p1 = MockPeer::connected([1; 32]);
        let p2 = MockPeer::connected([2; 32]);
        entry.add_requestor(&as_peer(&p1), now);
        entry.add_requestor(&as_peer(&p2), now);
        drop(p2);

        let auth_key = [0x55u8; 32];
        let sent = entry.offer(&auth_key, 7, now);
        assert_eq!(sent, 1);

        let msgs = p1.sent();
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            Message::BlockOffer {
                key,
                authenticator,
                boot_id,
            } => {
                assert_eq!(*key, Key::chk([7; 32]));
                assert_eq!(*boot_id, 7);
                assert_eq!(
                    *authenticator,
                    offer_authenticator(&auth_key, &Key::chk([7; 32]), PeerId([1; 32]))
                );
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn authenticator_binds_key_peer_and_process() {
        let key = Key::chk([9; 32]);
        let a = offer_authenticator(&[1; 32], &key, PeerId([1; 32]));
        // Different recipient, different process key, different variant tag.
        assert_ne!(a, offer_authenticator(&[1; 32], &key, PeerId([2; 32])));
        assert_ne!(a, offer_authenticator(&[2; 32], &key, PeerId([1; 32])));
        assert_ne!(
            a,
            offer_authenticator(&[1; 32], &Key::ssk([9; 32]), PeerId([1; 32]))
        );
        // Deterministic for the same inputs.
        assert_eq!(a, offer_authenticator(&[1; 32], &key, PeerId([1; 32])));
    }
}
