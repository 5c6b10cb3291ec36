//! Two-peer test fixture
//!
//! Runs two messengers over an in-memory relay network:
//! - each peer owns one mailbox on its own relay
//! - every delivery is recorded before it is fed to the messenger
//! - a peer can be restarted from its exported identity on a new relay
//!
//! # Example
//!
//! ```no_run
//! use postern_integration_tests::fixtures::{TwoPeerFixture, wait_for};
//! use postern_core::CoreEvent;
//! use std::time::Duration;
//!
//! #[tokio::test]
//! async fn test_hello() {
//!     let mut f = TwoPeerFixture::new().await.unwrap();
//!     let bob = f.bob.id.clone();
//!     f.alice.messenger.send(&bob, "text", "hi".into()).await.unwrap();
//!
//!     let event = wait_for(&mut f.bob.events, Duration::from_secs(5), |e| {
//!         matches!(e, CoreEvent::Message { .. })
//!     })
//!     .await;
//!     assert!(event.is_some());
//!     f.shutdown().await;
//! }
//! ```

use postern_core::loopback::{Delivery, LoopbackNetwork, LoopbackSuite};
use postern_core::{
    CoreConfig, CoreEvent, EndpointConfig, EventReceiver, LocalIdentity, Messenger, PeerId, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Relay of the first peer
pub const ALICE_RELAY: &str = "loop://relay-a";
/// Relay of the second peer
pub const BOB_RELAY: &str = "loop://relay-b";

/// One running peer
pub struct Peer {
    /// Messenger under test
    pub messenger: Messenger,
    /// Events emitted by the messenger
    pub events: EventReceiver,
    /// Identifier of the peer
    pub id: PeerId,
    /// Relay the peer's mailbox lives on
    pub relay: String,
    /// Every delivery the peer's inbox received, in arrival order
    pub tap: Arc<Mutex<Vec<Delivery>>>,
    config: CoreConfig,
    pump: Option<JoinHandle<()>>,
}

impl Peer {
    /// Start a peer with a mailbox on `relay`
    ///
    /// A fresh exportable identity is generated unless `identity` is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the messenger cannot be built or the mailbox
    /// cannot be registered.
    pub async fn start(
        network: &Arc<LoopbackNetwork>,
        config: CoreConfig,
        did: &str,
        relay: &str,
        identity: Option<LocalIdentity>,
    ) -> Result<Self> {
        let id = PeerId::new(did)?;
        let identity = identity.unwrap_or_else(|| LocalIdentity::generate(id.clone(), true));
        let (messenger, events) = Messenger::new(
            config.clone(),
            identity,
            Arc::new(LoopbackSuite),
            network.clone(),
            network.clone(),
        )?;

        let (connector, mut inbox) = network.attach();
        messenger
            .endpoint_registry(Arc::new(connector), network.clone())
            .reset(vec![EndpointConfig::new(relay)])
            .await?;

        let tap = Arc::new(Mutex::new(Vec::new()));
        let pump = {
            let messenger = messenger.clone();
            let tap = tap.clone();
            tokio::spawn(async move {
                while let Some(delivery) = inbox.recv().await {
                    tap.lock().await.push(delivery.clone());
                    if let Err(e) = messenger
                        .incoming_data(delivery.session_id, &delivery.ciphertext)
                        .await
                    {
                        tracing::warn!("Test peer dropped delivery: {}", e);
                    }
                }
            })
        };

        Ok(Self {
            messenger,
            events,
            id,
            relay: relay.to_string(),
            tap,
            config,
            pump: Some(pump),
        })
    }

    /// Stop reading the mailbox and shut the messenger down
    ///
    /// The mailbox channel is closed once this returns, so relay sends to it
    /// fail.
    pub async fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        self.messenger.shutdown().await;
    }

    /// Number of deliveries received so far
    pub async fn delivery_count(&self) -> usize {
        self.tap.lock().await.len()
    }
}

/// Two peers, alice and bob, on separate relays of one network
pub struct TwoPeerFixture {
    /// Shared relay network and identifier directory
    pub network: Arc<LoopbackNetwork>,
    /// First peer
    pub alice: Peer,
    /// Second peer
    pub bob: Peer,
}

impl TwoPeerFixture {
    /// Start both peers with the default configuration
    ///
    /// # Errors
    ///
    /// Returns an error if either peer fails to start.
    pub async fn new() -> Result<Self> {
        Self::with_config(CoreConfig::default(), CoreConfig::default()).await
    }

    /// Start both peers with their own configurations
    ///
    /// # Errors
    ///
    /// Returns an error if either peer fails to start.
    pub async fn with_config(alice: CoreConfig, bob: CoreConfig) -> Result<Self> {
        let network = LoopbackNetwork::new();
        let alice = Peer::start(&network, alice, "did:postern:alice", ALICE_RELAY, None).await?;
        let bob = Peer::start(&network, bob, "did:postern:bob", BOB_RELAY, None).await?;
        Ok(Self {
            network,
            alice,
            bob,
        })
    }

    /// Restart bob from the exported identity with a mailbox on `relay`
    ///
    /// # Errors
    ///
    /// Returns an error if the identity cannot be exported or the new peer
    /// fails to start.
    pub async fn restart_bob(&mut self, relay: &str) -> Result<()> {
        let exported = self.bob.messenger.export_identity().await.ok_or_else(|| {
            postern_core::CoreError::invalid_state("test identity is not exportable")
        })?;
        self.bob.stop().await;

        let identity = LocalIdentity::import(&exported)?;
        let did = self.bob.id.to_string();
        self.bob = Peer::start(
            &self.network,
            self.bob.config.clone(),
            &did,
            relay,
            Some(identity),
        )
        .await?;
        Ok(())
    }

    /// Shut both peers down
    pub async fn shutdown(&mut self) {
        self.alice.stop().await;
        self.bob.stop().await;
    }
}

/// Receive events until one matches `pred`, or `timeout` elapses
pub async fn wait_for<F>(
    events: &mut EventReceiver,
    timeout: Duration,
    mut pred: F,
) -> Option<CoreEvent>
where
    F: FnMut(&CoreEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
