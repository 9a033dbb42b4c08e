//! # ULPR - Failure Table and Offer Propagation
//!
//! This crate implements the failure table of a darknet content-routing
//! node, and on top of it **Ultra-Lightweight Persistent Requests**: when a
//! request for a key ends in data-not-found, the node remembers who it asked
//! and who asked it; when the key later turns up anywhere, the recorded
//! requestors get a push offer and can resume without polling.
//!
//! ## Responsibilities
//!
//! - A bounded, privacy-aware index of recently failed keys (who we asked,
//!   who asked us, when, at what hops-to-live)
//! - A bounded index of received offers, with expiry and per-peer
//!   authenticator tags
//! - The acceptance policy for incoming offers and the fan-out of outgoing
//!   ones
//! - A serialized pipeline that fetches and streams a block when a peer
//!   claims a key we offered it
//! - Periodic cleanup and memory-pressure shedding
//!
//! The transport, datastore, routing and client layers are collaborators
//! reached through the narrow traits in `protocols` and `peer`.
//!
//! ## Privacy Model
//!
//! Everything here is in-memory and ephemeral by design: the table records
//! who wanted what, which is exactly what a forensic attacker wants to know.
//! Entries are consumed the moment their key is found, age out after an
//! hour, and are swept every thirty minutes. The offer authenticator key is
//! regenerated each start, so nothing recorded outlives the process.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `table` | the coordinator: LRU indices, cleaner, shedding, public API |
//! | `entry` | per-key record of requestors and routed-to peers |
//! | `offers` | received offers and the randomised offer iterator |
//! | `serve` | serial executor: offer validation and offered-key serving |
//! | `key` | CHK/SSK keys and raw block types |
//! | `peer` | weak peer handles and the peer send interface |
//! | `messages` | wire messages (bounded bincode) |
//! | `protocols` | collaborator traits (datastore, client core, uid tracker, transmitter) |

mod entry;
mod key;
mod messages;
mod offers;
mod peer;
mod protocols;
mod serve;
mod table;

#[cfg(test)]
mod test_util;

pub use entry::{FailureTableEntry, MAX_LIFETIME, REJECT_TIME};
pub use key::{
    ChkBlock, Key, KeyBlock, KeyKind, SskBlock, CHK_DATA_SIZE, PACKETS_IN_BLOCK, PACKET_SIZE,
};
pub use messages::{
    deserialize_bounded, serialize_message, Message, OfferRejectReason, MAX_MESSAGE_SIZE,
};
pub use offers::{BlockOffer, BlockOfferList, OfferList, OFFER_EXPIRY_TIME};
pub use peer::{PeerHandle, PeerId, PeerNode, SendError};
pub use protocols::{BlockTransmitter, ClientCore, Datastore, UidTracker};
pub use serve::OFFER_SEND_DEADLINE;
pub use table::{
    FailureTable, FailureTableConfig, MemoryPressure, OfferStatsSnapshot, CLEANUP_PERIOD,
    MAX_ENTRIES, MAX_OFFERS,
};
