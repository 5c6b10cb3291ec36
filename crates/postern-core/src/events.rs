//! Events delivered from the core to the application
//!
//! Every notification (messages, acknowledgements, failures) flows through a
//! single ordered channel returned by [`crate::Messenger::new`].

use crate::envelope::Envelope;
use crate::error::CoreError;
use crate::hash::Hash;
use crate::identity::PeerId;
use tokio::sync::mpsc;

/// Notification emitted by the core
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A unique application message arrived
    Message {
        /// Sender
        from: PeerId,
        /// The message (reassembled if it was split)
        envelope: Envelope,
    },

    /// A relay confirmed storing messages for `peer`
    Delivered {
        /// Recipient
        peer: PeerId,
        /// Original envelope ids
        ids: Vec<Hash>,
    },

    /// `peer` confirmed decrypting and processing messages
    Received {
        /// Recipient
        peer: PeerId,
        /// Original envelope ids
        ids: Vec<Hash>,
    },

    /// `peer` marked messages as read
    Read {
        /// Recipient
        peer: PeerId,
        /// Envelope ids
        ids: Vec<Hash>,
    },

    /// Background delivery to `peer` gave up
    DeliveryFailed {
        /// Recipient
        peer: PeerId,
        /// Envelope ids still pending
        ids: Vec<Hash>,
        /// Terminal error
        error: CoreError,
    },

    /// `peer` asked to drop stale sessions
    SessionReset {
        /// Peer that sent the notification
        peer: PeerId,
    },
}

/// Receiving half handed to the application
pub type EventReceiver = mpsc::UnboundedReceiver<CoreEvent>;

/// Sending half shared by core components
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl EventSender {
    pub(crate) fn emit(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped, discarding event");
        }
    }
}

/// Create a connected event channel
pub(crate) fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, mut rx) = channel();
        let peer = PeerId::new("did:key:bob").unwrap();

        tx.emit(CoreEvent::SessionReset { peer: peer.clone() });
        tx.emit(CoreEvent::Read {
            peer: peer.clone(),
            ids: vec![Hash::sha256(b"m")],
        });

        assert!(matches!(rx.recv().await, Some(CoreEvent::SessionReset { .. })));
        assert!(matches!(rx.recv().await, Some(CoreEvent::Read { .. })));
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (tx, rx) = channel();
        drop(rx);
        tx.emit(CoreEvent::SessionReset {
            peer: PeerId::new("did:key:bob").unwrap(),
        });
    }
}
