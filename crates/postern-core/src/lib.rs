//! # Postern Core
//!
//! Session and message-delivery core of the Postern messaging protocol:
//! end-to-end encrypted envelopes exchanged between decentralized identities
//! through untrusted relay mailboxes.
//!
//! This crate provides:
//! - Ratchet session lifecycle (creation, lookup, lazy expiry, reset)
//! - Per-peer outboxes with per-relay queues, batching, retry and backoff
//! - Inbound deduplication, sender resolution and automatic receipts
//! - Splitting and reassembly of oversized messages
//! - Local relay endpoint reconciliation
//!
//! The ratchet cipher, identifier resolution and the relay transport are
//! external collaborators, plugged in through the traits in [`cipher`] and
//! [`transport`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Messenger                              │
//! │   (peers, events, inbound dispatch)                             │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │      PeerOutbox / Endpoint   │        InboundMiddleware         │
//! │   (queue, flush, retry)      │   (dedup, receipts, reassembly)  │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │                       SessionRegistry                           │
//! │   (ratchet sessions keyed by session id)                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Transport / Resolver                        │
//! │   (relay mailboxes, identity documents)                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod config;
pub mod dead_letter;
pub mod endpoints;
pub mod envelope;
pub mod error;
pub mod events;
pub mod hash;
pub mod identity;
pub mod inbound;
pub mod locks;
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
pub mod messenger;
pub mod outbox;
pub mod retry;
pub mod session;
pub mod split;
pub mod transport;

pub use cipher::{CipherError, CipherSuite, HandshakeBundle, RatchetCipher};
pub use config::CoreConfig;
pub use endpoints::{EndpointRegistry, validate_endpoint};
pub use envelope::{AckKind, Envelope};
pub use error::{CoreError, Result};
pub use events::{CoreEvent, EventReceiver};
pub use hash::Hash;
pub use identity::{
    EndpointConfig, ExportedIdentity, IdentityKey, LocalIdentity, PeerDocument, PeerId, PreKey,
};
pub use messenger::Messenger;
pub use outbox::{PeerEndpoint, PeerOutbox, Relationship};
pub use retry::RetryConfig;
pub use session::{Session, SessionRegistry};
pub use split::{MessageReassembler, MessageSplitter};
pub use transport::{DeliveryAck, DocumentPublisher, DocumentResolver, RelayConnector, Transport};

/// Envelope wire format version
pub const PROTOCOL_VERSION: u32 = 1;
