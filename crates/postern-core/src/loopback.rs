//! In-memory relay network and cipher suite
//!
//! Everything needed to run several [`Messenger`]s inside one process:
//!
//! - [`LoopbackNetwork`] plays the relays (mailboxes keyed by URL and
//!   pre-key) and the identifier directory. It implements [`Transport`],
//!   [`DocumentResolver`] and [`DocumentPublisher`].
//! - [`LoopbackConnector`] opens mailboxes for one local identity.
//! - [`LoopbackSuite`] is a single-step X25519 agreement with a BLAKE3
//!   keystream and MAC. It has no ratchet and no forward secrecy and must
//!   not be used outside tests and demos.
//!
//! Delivery is asynchronous: `send_data` only enqueues into the recipient's
//! inbox channel, and [`spawn_inbox`] drains that channel into
//! [`Messenger::incoming_data`].

use crate::cipher::{
    CipherError, CipherSuite, HandshakeBundle, InboundHandshake, OutboundHandshake,
    RatchetCipher,
};
use crate::error::{CoreError, Result};
use crate::hash::Hash;
use crate::identity::{EndpointConfig, IdentityKey, LocalIdentity, PeerDocument, PeerId, PreKey};
use crate::messenger::Messenger;
use crate::transport::{
    DeliveryAck, DocumentPublisher, DocumentResolver, RelayConnector, Transport,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use rand_core::{OsRng, RngCore};
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// One ciphertext handed to a mailbox
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Relay URL the ciphertext was sent through
    pub url: String,
    /// Session id announced by the sender
    pub session_id: Hash,
    /// Ciphertext
    pub ciphertext: Vec<u8>,
}

/// Inbox receiving every delivery for one identity
pub type Inbox = mpsc::UnboundedReceiver<Delivery>;

/// In-memory relays plus identifier directory
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    mailboxes: DashMap<(String, PreKey), mpsc::UnboundedSender<Delivery>>,
    documents: DashMap<PeerId, PeerDocument>,
    offline: DashSet<String>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl LoopbackNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connector and inbox for a new local identity
    #[must_use]
    pub fn attach(self: &Arc<Self>) -> (LoopbackConnector, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LoopbackConnector {
                network: self.clone(),
                inbox: tx,
            },
            rx,
        )
    }

    /// Make every send through `url` fail (or succeed again)
    pub fn set_offline(&self, url: &str, offline: bool) {
        if offline {
            self.offline.insert(url.to_string());
        } else {
            self.offline.remove(url);
        }
    }

    /// Directly publish or replace a document
    pub fn publish_document(&self, document: PeerDocument) {
        self.documents.insert(document.id.clone(), document);
    }

    /// Ciphertexts accepted by a mailbox so far
    #[must_use]
    pub fn delivered_sends(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Sends rejected so far
    #[must_use]
    pub fn failed_sends(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn reject(&self, reason: String) -> CoreError {
        self.failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Loopback relay rejected send: {}", reason);
        CoreError::Transport(Cow::Owned(reason))
    }
}

#[async_trait]
impl Transport for LoopbackNetwork {
    async fn send_data(
        &self,
        endpoint: &EndpointConfig,
        session_id: &Hash,
        ciphertext: Vec<u8>,
        message_ids: &[Hash],
    ) -> Result<DeliveryAck> {
        if self.offline.contains(&endpoint.url) {
            return Err(self.reject(format!("relay {} offline", endpoint.url)));
        }
        let Some(pre_key) = endpoint.pre_key else {
            return Err(self.reject(format!("no pre-key for mailbox at {}", endpoint.url)));
        };

        let key = (endpoint.url.clone(), pre_key);
        let Some(inbox) = self.mailboxes.get(&key).map(|entry| entry.value().clone()) else {
            return Err(self.reject(format!("no mailbox at {}", endpoint.url)));
        };

        let delivery = Delivery {
            url: endpoint.url.clone(),
            session_id: *session_id,
            ciphertext,
        };
        if inbox.send(delivery).is_err() {
            self.mailboxes.remove(&key);
            return Err(self.reject(format!("mailbox at {} closed", endpoint.url)));
        }

        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(DeliveryAck {
            message_ids: message_ids.to_vec(),
        })
    }
}

#[async_trait]
impl DocumentResolver for LoopbackNetwork {
    async fn resolve(&self, id: &PeerId) -> Result<PeerDocument> {
        self.documents
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::Resolution(Cow::Owned(format!("no document for {id}"))))
    }
}

#[async_trait]
impl DocumentPublisher for LoopbackNetwork {
    async fn publish(&self, document: &PeerDocument) -> Result<()> {
        self.publish_document(document.clone());
        Ok(())
    }
}

/// Opens mailboxes that deliver into one inbox
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    network: Arc<LoopbackNetwork>,
    inbox: mpsc::UnboundedSender<Delivery>,
}

#[async_trait]
impl RelayConnector for LoopbackConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<()> {
        let pre_key = endpoint
            .pre_key
            .ok_or_else(|| CoreError::transport("mailbox registration requires a pre-key"))?;
        self.network
            .mailboxes
            .insert((endpoint.url.clone(), pre_key), self.inbox.clone());
        Ok(())
    }

    async fn disconnect(&self, url: &str) -> Result<()> {
        self.network
            .mailboxes
            .retain(|(mailbox_url, _), tx| mailbox_url != url || !tx.same_channel(&self.inbox));
        Ok(())
    }
}

/// Feed every delivery of `inbox` into `messenger`
pub fn spawn_inbox(messenger: Messenger, mut inbox: Inbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = inbox.recv().await {
            if let Err(e) = messenger
                .incoming_data(delivery.session_id, &delivery.ciphertext)
                .await
            {
                tracing::warn!(
                    "Dropping delivery on session {} from {}: {}",
                    delivery.session_id.short(),
                    delivery.url,
                    e
                );
            }
        }
    })
}

const FRAME_HANDSHAKE: u8 = 1;
const FRAME_MESSAGE: u8 = 2;
const HANDSHAKE_HEADER: usize = 1 + 32 + 32;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Loopback cipher suite
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackSuite;

impl CipherSuite for LoopbackSuite {
    fn initiate(
        &self,
        local: &LocalIdentity,
        bundle: &HandshakeBundle,
    ) -> std::result::Result<OutboundHandshake, CipherError> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let base_key = X25519Public::from(&ephemeral).to_bytes();

        let dh1 = ephemeral.diffie_hellman(&X25519Public::from(*bundle.signed_pre_key.key.as_bytes()));
        let dh2 = ephemeral.diffie_hellman(&X25519Public::from(*bundle.exchange_key.as_bytes()));

        let mut header = Vec::with_capacity(HANDSHAKE_HEADER);
        header.push(FRAME_HANDSHAKE);
        header.extend_from_slice(&base_key);
        header.extend_from_slice(local.identity_key().as_bytes());

        Ok(OutboundHandshake {
            cipher: Box::new(LoopbackRatchet {
                keys: ChainKeys::derive(dh1.as_bytes(), dh2.as_bytes()),
                handshake_header: Some(header),
            }),
            base_key,
        })
    }

    fn accept(
        &self,
        local: &LocalIdentity,
        bytes: &[u8],
    ) -> std::result::Result<InboundHandshake, CipherError> {
        match bytes.first() {
            Some(&FRAME_HANDSHAKE) => {}
            Some(&FRAME_MESSAGE) => return Err(CipherError::NotHandshake),
            _ => return Err(CipherError::Handshake("unknown frame".into())),
        }
        if bytes.len() < HANDSHAKE_HEADER + NONCE_LEN + TAG_LEN {
            return Err(CipherError::Handshake("truncated handshake".into()));
        }

        let mut base_key = [0u8; 32];
        base_key.copy_from_slice(&bytes[1..33]);
        let mut identity = [0u8; 32];
        identity.copy_from_slice(&bytes[33..65]);

        let initiator = X25519Public::from(base_key);
        let dh1 = local.pre_key_secret().diffie_hellman(&initiator);
        let dh2 = local.exchange_secret().diffie_hellman(&initiator);

        let ratchet = LoopbackRatchet {
            keys: ChainKeys::derive(dh1.as_bytes(), dh2.as_bytes()),
            handshake_header: None,
        };
        let plaintext = ratchet
            .keys
            .open(&bytes[HANDSHAKE_HEADER..])
            .map_err(|_| CipherError::Handshake("handshake authentication failed".into()))?;

        Ok(InboundHandshake {
            cipher: Box::new(ratchet),
            base_key,
            peer_identity_key: IdentityKey::from_bytes(identity),
            plaintext,
        })
    }
}

struct ChainKeys {
    stream: [u8; 32],
    mac: [u8; 32],
}

impl ChainKeys {
    fn derive(dh1: &[u8; 32], dh2: &[u8; 32]) -> Self {
        let mut material = [0u8; 64];
        material[..32].copy_from_slice(dh1);
        material[32..].copy_from_slice(dh2);
        Self {
            stream: blake3::derive_key("postern loopback 2026-01 stream", &material),
            mac: blake3::derive_key("postern loopback 2026-01 mac", &material),
        }
    }

    fn tag(&self, nonce: &[u8], ciphertext: &[u8]) -> [u8; TAG_LEN] {
        let mut hasher = blake3::Hasher::new_keyed(&self.mac);
        hasher.update(nonce);
        hasher.update(ciphertext);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&hasher.finalize().as_bytes()[..TAG_LEN]);
        tag
    }

    fn apply_keystream(&self, nonce: &[u8], data: &mut [u8]) {
        let mut keystream = vec![0u8; data.len()];
        blake3::Hasher::new_keyed(&self.stream)
            .update(nonce)
            .finalize_xof()
            .fill(&mut keystream);
        for (byte, k) in data.iter_mut().zip(keystream) {
            *byte ^= k;
        }
    }

    /// `nonce || tag || ciphertext`
    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut body = plaintext.to_vec();
        self.apply_keystream(&nonce, &mut body);
        let tag = self.tag(&nonce, &body);

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + body.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&body);
        out
    }

    fn open(&self, sealed: &[u8]) -> std::result::Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Decrypt("truncated".into()));
        }
        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);
        if self.tag(nonce, body) != tag {
            return Err(CipherError::Decrypt("authentication tag mismatch".into()));
        }
        let mut plaintext = body.to_vec();
        self.apply_keystream(nonce, &mut plaintext);
        Ok(plaintext)
    }
}

struct LoopbackRatchet {
    keys: ChainKeys,
    /// Present until the first message (which carries the handshake) is sent
    handshake_header: Option<Vec<u8>>,
}

impl RatchetCipher for LoopbackRatchet {
    fn encrypt(&mut self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, CipherError> {
        let sealed = self.keys.seal(plaintext);
        let mut frame = match self.handshake_header.take() {
            Some(header) => header,
            None => vec![FRAME_MESSAGE],
        };
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> std::result::Result<Vec<u8>, CipherError> {
        match ciphertext.first() {
            Some(&FRAME_MESSAGE) => self.keys.open(&ciphertext[1..]),
            Some(&FRAME_HANDSHAKE) if ciphertext.len() >= HANDSHAKE_HEADER => {
                self.keys.open(&ciphertext[HANDSHAKE_HEADER..])
            }
            _ => Err(CipherError::Decrypt("unknown frame".into())),
        }
    }
}
