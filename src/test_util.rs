//! Shared mock collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Duration;

use crate::key::{Key, KeyBlock};
use crate::messages::Message;
use crate::peer::{PeerId, PeerNode, SendError};
use crate::protocols::{BlockTransmitter, ClientCore, Datastore, UidTracker};

/// Poll `cond` until it holds or a couple of seconds pass.
pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(cond(), "condition not reached in time");
}

pub(crate) struct MockPeer {
    id: PeerId,
    boot: AtomicU64,
    connected: AtomicBool,
    sent: Mutex<Vec<Message>>,
    throttled: Mutex<Vec<Message>>,
    throttled_failure: Mutex<Option<SendError>>,
}

impl MockPeer {
    pub(crate) fn connected(id: [u8; 32]) -> Arc<Self> {
        Arc::new(Self {
            id: PeerId(id),
            boot: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            throttled: Mutex::new(Vec::new()),
            throttled_failure: Mutex::new(None),
        })
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub(crate) fn set_boot_id(&self, boot: u64) {
        self.boot.store(boot, Ordering::Relaxed);
    }

    pub(crate) fn fail_throttled_with(&self, err: SendError) {
        *self.throttled_failure.lock() = Some(err);
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub(crate) fn throttled(&self) -> Vec<Message> {
        self.throttled.lock().clone()
    }
}

#[async_trait]
impl PeerNode for MockPeer {
    fn peer_id(&self) -> PeerId {
        self.id
    }

    fn boot_id(&self) -> u64 {
        self.boot.load(Ordering::Relaxed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn send(&self, msg: Message) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Disconnected);
        }
        self.sent.lock().push(msg);
        Ok(())
    }

    async fn send_throttled(
        &self,
        msg: Message,
        _payload_len: usize,
        _deadline: Duration,
    ) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Disconnected);
        }
        if let Some(err) = *self.throttled_failure.lock() {
            return Err(err);
        }
        self.throttled.lock().push(msg);
        Ok(())
    }
}

pub(crate) struct MockStore {
    blocks: Mutex<HashMap<Key, KeyBlock>>,
}

impl MockStore {
    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn insert(&self, block: KeyBlock) {
        let key = *block.key();
        self.blocks.lock().insert(key, block);
    }
}

#[async_trait]
impl Datastore for MockStore {
    async fn has_key(&self, key: &Key) -> bool {
        self.blocks.lock().contains_key(key)
    }

    async fn fetch(&self, key: &Key) -> Option<KeyBlock> {
        self.blocks.lock().get(key).cloned()
    }
}

pub(crate) struct MockClientCore {
    queued: Mutex<Vec<(Key, bool)>>,
    dequeued: Mutex<Vec<Key>>,
}

impl MockClientCore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(Vec::new()),
            dequeued: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn queued(&self) -> Vec<(Key, bool)> {
        self.queued.lock().clone()
    }

    pub(crate) fn dequeued(&self) -> Vec<Key> {
        self.dequeued.lock().clone()
    }
}

impl ClientCore for MockClientCore {
    fn maybe_queue_offered_key(&self, key: Key, others_want: bool) {
        self.queued.lock().push((key, others_want));
    }

    fn dequeue_offered_key(&self, key: Key) {
        self.dequeued.lock().push(key);
    }
}

pub(crate) struct MockUids {
    unlocked: Mutex<Vec<(u64, bool)>>,
}

impl MockUids {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            unlocked: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn unlocked(&self) -> Vec<(u64, bool)> {
        self.unlocked.lock().clone()
    }
}

impl UidTracker for MockUids {
    fn unlock_uid(&self, uid: u64, is_ssk: bool) {
        self.unlocked.lock().push((uid, is_ssk));
    }
}

pub(crate) struct MockTransmitter {
    sent: Mutex<Vec<(u64, usize)>>,
    fail_with: Mutex<Option<SendError>>,
}

impl MockTransmitter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        })
    }

    pub(crate) fn fail_with(&self, err: SendError) {
        *self.fail_with.lock() = Some(err);
    }

    pub(crate) fn sent(&self) -> Vec<(u64, usize)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl BlockTransmitter for MockTransmitter {
    async fn send_block(
        &self,
        to: Arc<dyn PeerNode>,
        uid: u64,
        data: Vec<u8>,
    ) -> Result<(), SendError> {
        if !to.is_connected() {
            return Err(SendError::Disconnected);
        }
        if let Some(err) = *self.fail_with.lock() {
            return Err(err);
        }
        self.sent.lock().push((uid, data.len()));
        Ok(())
    }
}
