//! # Wire Messages
//!
//! Message types exchanged for offer propagation and offered-key transfers.
//! Messages are serialized with bincode under an explicit size limit so a
//! malicious length prefix cannot balloon an allocation.
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | `BlockOffer` | outbound | a key we previously failed on is now available here |
//! | `GetOfferedKeyInvalid` | outbound | claim for an offered key we cannot serve |
//! | `SskDataFoundHeaders` / `SskDataFoundData` / `SskPubKey` | outbound | SSK offered-key transfer |
//! | `SskDataFound` | outbound | legacy combined SSK transfer (old wire format) |
//! | `ChkDataFound` | outbound | CHK transfer headers; data follows as a packet stream |
//!
//! The CHK data payload itself is not a `Message`: it is handed to the block
//! transmitter, which streams `PACKETS_IN_BLOCK` packets of `PACKET_SIZE`
//! bytes (see `key.rs`).

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::key::{Key, CHK_DATA_SIZE};

/// Maximum serialized message size: a full CHK payload plus headers and
/// framing slack. Anything larger is not a valid message of ours.
pub const MAX_MESSAGE_SIZE: u64 = (CHK_DATA_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with the size bound enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(msg)
}

/// Reason codes for rejecting a claim on an offered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferRejectReason {
    /// We no longer (or never) hold the block.
    NoKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// Push notification that `key` is now retrievable from us.
    ///
    /// The authenticator binds the offer to (key, recipient, this process);
    /// the recipient must echo it when claiming the key. `boot_id` is the
    /// sender's current boot counter so the recipient can detect offers that
    /// predate a restart.
    BlockOffer {
        key: Key,
        authenticator: [u8; 32],
        boot_id: u64,
    },
    /// A claim for an offered key was rejected.
    GetOfferedKeyInvalid { uid: u64, reason: OfferRejectReason },
    /// SSK transfer: raw block headers.
    SskDataFoundHeaders { uid: u64, headers: Vec<u8> },
    /// SSK transfer: raw block data (throttled).
    SskDataFoundData { uid: u64, data: Vec<u8> },
    /// SSK transfer: subspace public key, when the claimant asked for it.
    SskPubKey { uid: u64, pub_key: Vec<u8> },
    /// Legacy combined SSK transfer kept for old-format peers.
    SskDataFound {
        uid: u64,
        headers: Vec<u8>,
        data: Vec<u8>,
    },
    /// CHK transfer headers; the data follows via the block transmitter.
    ChkDataFound { uid: u64, headers: Vec<u8> },
}

impl Message {
    /// Transaction uid this message belongs to, if any.
    pub fn uid(&self) -> Option<u64> {
        match self {
            Message::BlockOffer { .. } => None,
            Message::GetOfferedKeyInvalid { uid, .. }
            | Message::SskDataFoundHeaders { uid, .. }
            | Message::SskDataFoundData { uid, .. }
            | Message::SskPubKey { uid, .. }
            | Message::SskDataFound { uid, .. }
            | Message::ChkDataFound { uid, .. } => Some(*uid),
        }
    }
}
