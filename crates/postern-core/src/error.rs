//! Error types for the Postern core
//!
//! Errors are grouped the same way delivery treats them:
//!
//! - **Transient**: transport and session failures that the outbox retries
//!   locally with backoff and never surfaces before exhaustion.
//! - **Permanent**: malformed or unverifiable material (handshakes, endpoint
//!   signatures, split parts) that is rejected immediately for the specific
//!   operation.
//!
//! # Example
//!
//! ```
//! use postern_core::CoreError;
//!
//! fn on_flush_error(err: &CoreError) {
//!     if err.should_retry() {
//!         // schedule another attempt with backoff
//!     } else {
//!         // surface to the caller of send()
//!     }
//! }
//! # on_flush_error(&CoreError::transport("relay unreachable"));
//! ```

use crate::hash::Hash;
use std::borrow::Cow;
use thiserror::Error;

/// Errors produced by sessions, outboxes and the inbound middleware
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    // ============ Session Errors ============
    /// Session-establishment material is malformed or fails verification
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// Session id derived from the handshake disagrees with the claimed one
    #[error("Session id mismatch: claimed {}, derived {}", .claimed.short(), .derived.short())]
    SessionIdMismatch {
        /// Session id announced by the transport
        claimed: Hash,
        /// Session id derived from the embedded base key
        derived: Hash,
    },

    /// Ordinary ciphertext for a session that is not established locally
    #[error("Not a handshake message for session {}", .0.short())]
    NotHandshake(Hash),

    /// Decryption of a ciphertext failed
    #[error("Decryption failed: {0}")]
    Decryption(Cow<'static, str>),

    // ============ Identity Errors ============
    /// Resolved sender document carries a different identity key
    #[error("Identity key mismatch for {0}")]
    IdentityKeyMismatch(String),

    /// Propagated endpoint failed thumbprint or signature validation
    #[error("Endpoint validation failed for {url}: {reason}")]
    EndpointValidation {
        /// Relay URL of the rejected endpoint
        url: String,
        /// Which check failed
        reason: Cow<'static, str>,
    },

    /// Peer document could not be resolved
    #[error("Resolution failed: {0}")]
    Resolution(Cow<'static, str>),

    // ============ Delivery Errors ============
    /// Reassembly found a gap or an out-of-range part number
    #[error("Missing part {expected} of group {}", .group.short())]
    MissingPart {
        /// Original envelope sha256
        group: Hash,
        /// First part number that is not present
        expected: u32,
    },

    /// Outbound delivery gave up after the configured number of attempts
    #[error("Delivery to {peer} failed after {attempts} attempts")]
    RetryExhausted {
        /// Recipient DID
        peer: String,
        /// Failed flush attempts
        attempts: u32,
    },

    /// Relay transport failure
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    // ============ Peer Errors ============
    /// No outbox exists for the peer
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Outbox was closed while the operation was pending
    #[error("Peer closed: {0}")]
    PeerClosed(String),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state for the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),
}

impl CoreError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Transport(_)
                | CoreError::Timeout(_)
                | CoreError::Decryption(_)
                | CoreError::NotHandshake(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CoreError::Handshake(_)
                | CoreError::SessionIdMismatch { .. }
                | CoreError::IdentityKeyMismatch(_)
                | CoreError::EndpointValidation { .. }
                | CoreError::MissingPart { .. }
                | CoreError::RetryExhausted { .. }
                | CoreError::PeerClosed(_)
                | CoreError::InvalidConfig(_)
                | CoreError::InvalidState(_)
                | CoreError::Serialization(_)
        )
    }

    /// Returns true if a failed flush with this error should be rescheduled
    #[must_use]
    pub fn should_retry(&self) -> bool {
        !self.is_permanent()
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        CoreError::Transport(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        CoreError::Timeout(Cow::Borrowed(context))
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        CoreError::Handshake(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        CoreError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a serialization error with static context (zero allocation)
    #[must_use]
    pub const fn serialization(context: &'static str) -> Self {
        CoreError::Serialization(Cow::Borrowed(context))
    }

    /// Create an endpoint validation error
    #[must_use]
    pub fn endpoint_validation(url: &str, reason: &'static str) -> Self {
        CoreError::EndpointValidation {
            url: url.to_string(),
            reason: Cow::Borrowed(reason),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(Cow::Owned(err.to_string()))
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CoreError::timeout("deadline elapsed")
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(CoreError::transport("test").is_transient());
        assert!(CoreError::timeout("test").is_transient());
        assert!(CoreError::Decryption(Cow::Borrowed("bad tag")).is_transient());
        assert!(CoreError::NotHandshake(Hash::zero()).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(CoreError::handshake("test").is_permanent());
        assert!(
            CoreError::SessionIdMismatch {
                claimed: Hash::zero(),
                derived: Hash::sha256(b"x"),
            }
            .is_permanent()
        );
        assert!(CoreError::IdentityKeyMismatch("did:key:a".into()).is_permanent());
        assert!(CoreError::endpoint_validation("wss://relay", "bad signature").is_permanent());
        assert!(
            CoreError::MissingPart {
                group: Hash::zero(),
                expected: 2,
            }
            .is_permanent()
        );
        assert!(
            CoreError::RetryExhausted {
                peer: "did:key:a".into(),
                attempts: 3,
            }
            .is_permanent()
        );
    }

    #[test]
    fn test_should_retry() {
        assert!(CoreError::transport("relay down").should_retry());
        assert!(CoreError::timeout("send").should_retry());
        assert!(CoreError::PeerNotFound("did:key:a".into()).should_retry());

        assert!(!CoreError::handshake("bad bundle").should_retry());
        assert!(!CoreError::PeerClosed("did:key:a".into()).should_retry());
    }

    #[test]
    fn test_mutual_exclusivity() {
        let errors = [
            CoreError::transport("t"),
            CoreError::timeout("t"),
            CoreError::handshake("t"),
            CoreError::invalid_state("t"),
            CoreError::serialization("t"),
        ];

        for err in &errors {
            assert!(!(err.is_transient() && err.is_permanent()), "{err}");
        }
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::RetryExhausted {
            peer: "did:key:bob".into(),
            attempts: 4,
        };
        assert!(err.to_string().contains("did:key:bob"));
        assert!(err.to_string().contains('4'));

        let err = CoreError::endpoint_validation("wss://relay.example", "thumbprint mismatch");
        assert!(err.to_string().contains("wss://relay.example"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: CoreError = json_err.into();
        assert!(matches!(err, CoreError::Serialization(_)));
    }
}
