//! Message envelopes and protocol payloads.
//!
//! Wire shape (JSON):
//!
//! ```text
//! { "type": "...", "data": <any>, "sha256": "<hex>", "timestamp": "<ISO-8601>", "after": "<hex>|" }
//! ```
//!
//! `sha256` is the content-addressed id computed over `{type, data, after,
//! timestamp}`. It is the only key used for deduplication and
//! acknowledgement, and it never changes once the envelope is sealed.

use crate::error::{CoreError, Result};
use crate::hash::Hash;
use crate::identity::PeerDocument;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types produced or consumed by the core
pub mod kinds {
    /// Fragment of an oversized envelope
    pub const PART: &str = "part";
    /// Relay confirmed receipt
    pub const DELIVERED: &str = "delivered";
    /// Recipient decrypted and processed
    pub const RECEIVED: &str = "received";
    /// Recipient application marked as read
    pub const READ: &str = "read";
    /// Identity document announcement
    pub const IDENTITY: &str = "identity";
    /// Preferred endpoint announcement
    pub const PREFERRED_ENDPOINT: &str = "preferred-endpoint";
    /// Session reset notification
    pub const SESSION_RESET: &str = "session-reset";
}

/// A sealed, content-addressed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type
    #[serde(rename = "type")]
    pub kind: String,
    /// Application or protocol payload
    pub data: Value,
    /// Content-addressed id
    pub sha256: Hash,
    /// Encapsulation time, millisecond precision
    #[serde(with = "timestamp_millis")]
    pub timestamp: DateTime<Utc>,
    /// Causal pointer to a prior envelope
    #[serde(with = "after_field", default)]
    pub after: Option<Hash>,
}

impl Envelope {
    /// Seal a new envelope stamped with the current time
    pub fn new(kind: impl Into<String>, data: Value, after: Option<Hash>) -> Result<Self> {
        Self::with_timestamp(kind, data, after, Utc::now())
    }

    /// Seal a new envelope with an explicit timestamp
    ///
    /// The timestamp is truncated to milliseconds so that it survives a wire
    /// round trip unchanged.
    pub fn with_timestamp(
        kind: impl Into<String>,
        data: Value,
        after: Option<Hash>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let kind = kind.into();
        let timestamp = timestamp.trunc_subsecs(3);
        let sha256 = Self::content_hash(&kind, &data, after.as_ref(), &timestamp)?;
        Ok(Self {
            kind,
            data,
            sha256,
            timestamp,
            after,
        })
    }

    /// Seal an envelope whose payload is a serializable value
    pub fn encode<T: Serialize>(kind: &str, payload: &T, after: Option<Hash>) -> Result<Self> {
        Self::new(kind, serde_json::to_value(payload)?, after)
    }

    /// Compute the content id over `{type, data, after, timestamp}`
    pub fn content_hash(
        kind: &str,
        data: &Value,
        after: Option<&Hash>,
        timestamp: &DateTime<Utc>,
    ) -> Result<Hash> {
        // serde_json maps are ordered by key, so this encoding is canonical
        let canonical = serde_json::json!({
            "type": kind,
            "data": data,
            "after": after.map(Hash::to_hex).unwrap_or_default(),
            "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        Ok(Hash::sha256(&serde_json::to_vec(&canonical)?))
    }

    /// True if `sha256` matches the content
    #[must_use]
    pub fn verify(&self) -> bool {
        Self::content_hash(&self.kind, &self.data, self.after.as_ref(), &self.timestamp)
            .is_ok_and(|h| h == self.sha256)
    }

    /// True for `delivered`, `received` and `read` acknowledgements
    #[must_use]
    pub fn is_ack(&self) -> bool {
        AckKind::from_kind(&self.kind).is_some()
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Length of the wire encoding
    pub fn serialized_len(&self) -> Result<usize> {
        Ok(self.to_bytes()?.len())
    }

    /// Decode the payload as `T`
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Build an acknowledgement envelope
    pub fn ack(kind: AckKind, ids: Vec<Hash>) -> Result<Self> {
        Self::encode(kind.as_str(), &AckPayload { ids }, None)
    }

    /// Build an identity document announcement
    pub fn identity(document: &PeerDocument) -> Result<Self> {
        Self::encode(kinds::IDENTITY, document, None)
    }

    /// Build a preferred endpoint announcement
    pub fn preferred_endpoint(url: &str) -> Result<Self> {
        Self::encode(
            kinds::PREFERRED_ENDPOINT,
            &PreferredEndpointPayload {
                url: url.to_string(),
            },
            None,
        )
    }

    /// Build a session reset notification
    pub fn session_reset(reset_id: Hash) -> Result<Self> {
        Self::encode(kinds::SESSION_RESET, &SessionResetPayload { reset_id }, None)
    }
}

/// Acknowledgement flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    /// Relay confirmed receipt
    Delivered,
    /// Recipient decrypted and processed
    Received,
    /// Recipient application read
    Read,
}

impl AckKind {
    /// Message type string
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AckKind::Delivered => kinds::DELIVERED,
            AckKind::Received => kinds::RECEIVED,
            AckKind::Read => kinds::READ,
        }
    }

    /// Map a message type string to an ack kind
    #[must_use]
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            kinds::DELIVERED => Some(AckKind::Delivered),
            kinds::RECEIVED => Some(AckKind::Received),
            kinds::READ => Some(AckKind::Read),
            _ => None,
        }
    }
}

/// Payload of every acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Acknowledged envelope ids
    pub ids: Vec<Hash>,
}

/// Payload of a `part` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartPayload {
    /// Type of the original envelope
    pub original_type: String,
    /// Zero-based position of this part
    pub part_number: u32,
    /// Number of parts in the group
    pub total_parts: u32,
    /// Id of the original envelope
    pub original_sha256: Hash,
    /// Base64 slice of the serialized original
    pub content: String,
}

/// Payload of a `preferred-endpoint` announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredEndpointPayload {
    /// Relay URL the sender wants to be reached on
    pub url: String,
}

/// Payload of a `session-reset` notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResetPayload {
    /// Identifier making duplicate notifications idempotent
    pub reset_id: Hash,
}

mod timestamp_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

/// `after` is an empty string when absent
mod after_field {
    use crate::hash::Hash;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(after: &Option<Hash>, serializer: S) -> Result<S::Ok, S::Error> {
        match after {
            Some(hash) => serializer.serialize_str(&hash.to_hex()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Hash>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(None);
        }
        Hash::from_hex(&s).map(Some).map_err(D::Error::custom)
    }
}

/// Parse a batch plaintext into envelopes
pub(crate) fn decode_batch(plaintext: &[u8]) -> Result<Vec<Envelope>> {
    serde_json::from_slice(plaintext)
        .map_err(|e| CoreError::Serialization(format!("invalid batch: {e}").into()))
}

/// Encode envelopes as a batch plaintext
pub(crate) fn encode_batch(envelopes: &[&Envelope]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelopes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let a = Envelope::with_timestamp("text", json!({"body": "hi"}), None, fixed_time()).unwrap();
        let b = Envelope::with_timestamp("text", json!({"body": "hi"}), None, fixed_time()).unwrap();
        assert_eq!(a.sha256, b.sha256);

        let c = Envelope::with_timestamp("text", json!({"body": "hi!"}), None, fixed_time()).unwrap();
        assert_ne!(a.sha256, c.sha256);

        let d = Envelope::with_timestamp("text", json!({"body": "hi"}), Some(a.sha256), fixed_time())
            .unwrap();
        assert_ne!(a.sha256, d.sha256);
    }

    #[test]
    fn test_wire_shape() {
        let env = Envelope::with_timestamp("text", json!("hello"), None, fixed_time()).unwrap();
        let wire: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(wire["type"], "text");
        assert_eq!(wire["data"], "hello");
        assert_eq!(wire["after"], "");
        assert_eq!(wire["timestamp"], "2026-03-14T15:09:26.000Z");
        assert_eq!(wire["sha256"], env.sha256.to_hex());
    }

    #[test]
    fn test_wire_roundtrip_keeps_hash_valid() {
        let first = Envelope::new("text", json!({"n": 1}), None).unwrap();
        let second = Envelope::new("text", json!({"n": 2}), Some(first.sha256)).unwrap();

        let parsed = Envelope::from_bytes(&second.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, second);
        assert!(parsed.verify());
        assert_eq!(parsed.after, Some(first.sha256));
    }

    #[test]
    fn test_tampered_envelope_fails_verification() {
        let mut env = Envelope::new("text", json!("original"), None).unwrap();
        assert!(env.verify());
        env.data = json!("altered");
        assert!(!env.verify());
    }

    #[test]
    fn test_ack_envelopes() {
        let ids = vec![Hash::sha256(b"a"), Hash::sha256(b"b")];
        let ack = Envelope::ack(AckKind::Received, ids.clone()).unwrap();

        assert!(ack.is_ack());
        assert_eq!(ack.kind, kinds::RECEIVED);
        assert_eq!(ack.payload::<AckPayload>().unwrap().ids, ids);

        let text = Envelope::new("text", json!(null), None).unwrap();
        assert!(!text.is_ack());
    }

    #[test]
    fn test_ack_kind_mapping() {
        for kind in [AckKind::Delivered, AckKind::Received, AckKind::Read] {
            assert_eq!(AckKind::from_kind(kind.as_str()), Some(kind));
        }
        assert_eq!(AckKind::from_kind(kinds::PART), None);
    }

    #[test]
    fn test_batch_codec() {
        let a = Envelope::new("text", json!("a"), None).unwrap();
        let b = Envelope::new("text", json!("b"), None).unwrap();
        let bytes = encode_batch(&[&a, &b]).unwrap();
        assert_eq!(decode_batch(&bytes).unwrap(), vec![a, b]);
        assert!(decode_batch(b"{not a batch").is_err());
    }
}
