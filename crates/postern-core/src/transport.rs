//! External collaborator interfaces
//!
//! The relay transport, identifier resolution and document publication are
//! provided by the embedding application. Inbound ciphertext is handed to
//! [`crate::Messenger::incoming_data`] by whatever drives the relay sockets;
//! relay authentication (challenge/response) stays on that side of the
//! boundary.

use crate::error::Result;
use crate::hash::Hash;
use crate::identity::{EndpointConfig, PeerDocument, PeerId};
use async_trait::async_trait;

/// Relay confirmation of a `send_data` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryAck {
    /// Envelope ids the relay accepted
    pub message_ids: Vec<Hash>,
}

/// Outbound relay transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one ciphertext to the relay behind `endpoint`
    ///
    /// `message_ids` lists the envelopes contained in the ciphertext; the
    /// returned ack echoes the ids the relay stored.
    async fn send_data(
        &self,
        endpoint: &EndpointConfig,
        session_id: &Hash,
        ciphertext: Vec<u8>,
        message_ids: &[Hash],
    ) -> Result<DeliveryAck>;
}

/// Identifier resolution
#[async_trait]
pub trait DocumentResolver: Send + Sync {
    /// Fetch the current document published for `id`
    async fn resolve(&self, id: &PeerId) -> Result<PeerDocument>;
}

/// Connection management for the local identity's own relay endpoints
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Open a mailbox on the relay described by `endpoint`
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<()>;

    /// Close the mailbox on the relay at `url`
    async fn disconnect(&self, url: &str) -> Result<()>;
}

/// Publication of the local identity's document
#[async_trait]
pub trait DocumentPublisher: Send + Sync {
    /// Replace the published document
    async fn publish(&self, document: &PeerDocument) -> Result<()>;
}
