//! Local relay endpoint reconciliation
//!
//! [`EndpointRegistry`] keeps the set of relays the local identity has
//! mailboxes on in line with the desired set, and republishes the local
//! document whenever that set changes.
//!
//! Endpoint configs come in two flavours:
//!
//! - **Self-generated**: only a URL. The registry binds it to the local
//!   signed pre-key before connecting.
//! - **Propagated**: carries a pre-key and the owner's signature over it
//!   (for example copied from a published document). These must pass
//!   [`validate_endpoint`] and are never registered otherwise.

use crate::error::{CoreError, Result};
use crate::identity::{EndpointConfig, IdentityKey, LocalIdentity, PreKey};
use crate::transport::{DocumentPublisher, RelayConnector};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Check the relay material of a propagated endpoint
///
/// The endpoint's pre-key must have the same thumbprint as the signed pre-key
/// on file, and its signature must verify against the owner's identity key.
///
/// # Errors
///
/// Returns [`CoreError::EndpointValidation`] naming the failed check.
pub fn validate_endpoint(
    endpoint: &EndpointConfig,
    identity_key: &IdentityKey,
    signed_pre_key: &PreKey,
) -> Result<()> {
    let (Some(pre_key), Some(signature)) = (endpoint.pre_key, endpoint.signature) else {
        return Err(CoreError::endpoint_validation(
            &endpoint.url,
            "incomplete relay key material",
        ));
    };

    if pre_key.thumbprint() != signed_pre_key.thumbprint() {
        return Err(CoreError::endpoint_validation(
            &endpoint.url,
            "pre-key thumbprint does not match signed pre-key",
        ));
    }

    if !identity_key.verifies(pre_key.as_bytes(), &signature) {
        return Err(CoreError::endpoint_validation(
            &endpoint.url,
            "pre-key signature does not verify",
        ));
    }

    Ok(())
}

/// Reconciles the local identity's relay mailboxes
pub struct EndpointRegistry {
    local: Arc<RwLock<LocalIdentity>>,
    connector: Arc<dyn RelayConnector>,
    publisher: Arc<dyn DocumentPublisher>,
    /// Connected endpoints by URL; held across awaits to serialize changes
    connected: Mutex<HashMap<String, EndpointConfig>>,
}

impl EndpointRegistry {
    /// Create a registry with nothing connected
    pub fn new(
        local: Arc<RwLock<LocalIdentity>>,
        connector: Arc<dyn RelayConnector>,
        publisher: Arc<dyn DocumentPublisher>,
    ) -> Self {
        Self {
            local,
            connector,
            publisher,
            connected: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile connected endpoints with `desired`
    ///
    /// Endpoints that are already connected with the same config are left
    /// alone. Every change is attempted; the first failure is returned after
    /// the document has been republished.
    ///
    /// # Errors
    ///
    /// Returns the first connect, disconnect or publish failure.
    pub async fn reset(&self, desired: Vec<EndpointConfig>) -> Result<()> {
        let mut connected = self.connected.lock().await;
        let mut first_error = None;

        let desired_urls: HashSet<&str> = desired.iter().map(|e| e.url.as_str()).collect();
        let stale: Vec<String> = connected
            .keys()
            .filter(|url| !desired_urls.contains(url.as_str()))
            .cloned()
            .collect();

        for url in stale {
            if let Err(e) = self.disconnect_locked(&mut connected, &url).await {
                tracing::warn!("Failed to disconnect {}: {}", url, e);
                first_error.get_or_insert(e);
            }
        }

        for endpoint in desired.iter() {
            if connected
                .get(&endpoint.url)
                .is_some_and(|current| !endpoint.is_propagated() || current == endpoint)
            {
                continue;
            }
            if let Err(e) = self.connect_locked(&mut connected, endpoint.clone()).await {
                tracing::warn!("Failed to connect {}: {}", endpoint.url, e);
                first_error.get_or_insert(e);
            }
        }

        // drop advertised endpoints nobody asked for (e.g. restored from an export)
        {
            let mut local = self.local.write().await;
            let advertised: Vec<String> =
                local.endpoints().iter().map(|e| e.url.clone()).collect();
            for url in advertised {
                if !connected.contains_key(&url) {
                    local.remove_endpoint(&url);
                }
            }
        }

        if let Err(e) = self.publish().await {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Connect one endpoint and publish the updated document
    ///
    /// Returns the config actually registered (self-generated configs come
    /// back bound to the local signed pre-key).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EndpointValidation`] for propagated configs that
    /// fail validation, or the connector/publisher error.
    pub async fn connect(&self, endpoint: EndpointConfig) -> Result<EndpointConfig> {
        let mut connected = self.connected.lock().await;
        let registered = self.connect_locked(&mut connected, endpoint).await?;
        self.publish().await?;
        Ok(registered)
    }

    /// Disconnect the endpoint at `url` and publish the updated document
    ///
    /// # Errors
    ///
    /// Returns the connector or publisher error.
    pub async fn disconnect(&self, url: &str) -> Result<bool> {
        let mut connected = self.connected.lock().await;
        let removed = self.disconnect_locked(&mut connected, url).await?;
        if removed {
            self.publish().await?;
        }
        Ok(removed)
    }

    /// Currently connected endpoints
    pub async fn connected(&self) -> Vec<EndpointConfig> {
        self.connected.lock().await.values().cloned().collect()
    }

    async fn connect_locked(
        &self,
        connected: &mut HashMap<String, EndpointConfig>,
        endpoint: EndpointConfig,
    ) -> Result<EndpointConfig> {
        let endpoint = {
            let local = self.local.read().await;
            let signed_pre_key = local.signed_pre_key();
            if endpoint.is_propagated() {
                if let Err(e) =
                    validate_endpoint(&endpoint, &local.identity_key(), &signed_pre_key.key)
                {
                    tracing::warn!("Rejecting endpoint {}: {}", endpoint.url, e);
                    return Err(e);
                }
                endpoint
            } else {
                EndpointConfig::propagated(
                    endpoint.url,
                    signed_pre_key.key,
                    signed_pre_key.signature,
                )
            }
        };

        self.connector.connect(&endpoint).await?;
        self.local.write().await.upsert_endpoint(endpoint.clone());
        connected.insert(endpoint.url.clone(), endpoint.clone());

        tracing::info!("Connected relay endpoint {}", endpoint.url);
        Ok(endpoint)
    }

    async fn disconnect_locked(
        &self,
        connected: &mut HashMap<String, EndpointConfig>,
        url: &str,
    ) -> Result<bool> {
        if connected.remove(url).is_none() {
            return Ok(false);
        }
        self.local.write().await.remove_endpoint(url);
        self.connector.disconnect(url).await?;
        tracing::info!("Disconnected relay endpoint {}", url);
        Ok(true)
    }

    async fn publish(&self) -> Result<()> {
        let document = self.local.read().await.document();
        self.publisher.publish(&document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::loopback::LoopbackNetwork;
    use crate::transport::DocumentResolver;
    use async_trait::async_trait;

    fn identity(name: &str) -> LocalIdentity {
        LocalIdentity::generate(PeerId::new(format!("did:key:{name}")).unwrap(), false)
    }

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RelayConnector for Recording {
        async fn connect(&self, endpoint: &EndpointConfig) -> Result<()> {
            self.calls.lock().await.push(format!("+{}", endpoint.url));
            Ok(())
        }

        async fn disconnect(&self, url: &str) -> Result<()> {
            self.calls.lock().await.push(format!("-{url}"));
            Ok(())
        }
    }

    #[test]
    fn test_validate_endpoint() {
        let bob = identity("bob");
        let mallory = identity("mallory");
        let spk = *bob.signed_pre_key();

        let good = EndpointConfig::propagated("wss://relay", spk.key, spk.signature);
        validate_endpoint(&good, &bob.identity_key(), &spk.key).unwrap();

        // signed by a different identity key
        let forged = EndpointConfig::propagated(
            "wss://relay",
            spk.key,
            mallory.sign(spk.key.as_bytes()),
        );
        let err = validate_endpoint(&forged, &bob.identity_key(), &spk.key).unwrap_err();
        assert!(matches!(err, CoreError::EndpointValidation { .. }));
        assert!(err.to_string().contains("signature"));

        // a key other than the signed pre-key on file
        let other = *mallory.signed_pre_key();
        let swapped = EndpointConfig::propagated("wss://relay", other.key, other.signature);
        let err = validate_endpoint(&swapped, &bob.identity_key(), &spk.key).unwrap_err();
        assert!(err.to_string().contains("thumbprint"));

        let bare = EndpointConfig::new("wss://relay");
        assert!(validate_endpoint(&bare, &bob.identity_key(), &spk.key).is_err());
    }

    #[tokio::test]
    async fn test_connect_self_generated_publishes_document() {
        let network = LoopbackNetwork::new();
        let (connector, _inbox) = network.attach();
        let local = Arc::new(RwLock::new(identity("alice")));
        let registry = EndpointRegistry::new(local.clone(), Arc::new(connector), network.clone());

        let registered = registry
            .connect(EndpointConfig::new("loopback://one"))
            .await
            .unwrap();
        assert!(registered.is_propagated());

        let id = local.read().await.id().clone();
        let published = network.resolve(&id).await.unwrap();
        assert_eq!(published.endpoints, vec![registered]);
    }

    #[tokio::test]
    async fn test_connect_rejects_foreign_signature() {
        let network = LoopbackNetwork::new();
        let recording = Arc::new(Recording::default());
        let local = Arc::new(RwLock::new(identity("bob")));
        let registry = EndpointRegistry::new(local.clone(), recording.clone(), network.clone());

        let mallory = identity("mallory");
        let spk = *local.read().await.signed_pre_key();
        let forged = EndpointConfig::propagated(
            "loopback://evil",
            spk.key,
            mallory.sign(spk.key.as_bytes()),
        );

        let err = registry.connect(forged).await.unwrap_err();
        assert!(matches!(err, CoreError::EndpointValidation { .. }));
        assert!(recording.calls.lock().await.is_empty());
        assert!(registry.connected().await.is_empty());
        assert!(local.read().await.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_reset_only_touches_changed_endpoints() {
        let network = LoopbackNetwork::new();
        let recording = Arc::new(Recording::default());
        let local = Arc::new(RwLock::new(identity("alice")));
        let registry = EndpointRegistry::new(local.clone(), recording.clone(), network.clone());

        registry
            .reset(vec![
                EndpointConfig::new("loopback://a"),
                EndpointConfig::new("loopback://b"),
            ])
            .await
            .unwrap();
        recording.calls.lock().await.clear();

        registry
            .reset(vec![
                EndpointConfig::new("loopback://b"),
                EndpointConfig::new("loopback://c"),
            ])
            .await
            .unwrap();

        let calls = recording.calls.lock().await.clone();
        assert_eq!(calls, vec!["-loopback://a".to_string(), "+loopback://c".to_string()]);

        let mut urls: Vec<String> = local
            .read()
            .await
            .endpoints()
            .iter()
            .map(|e| e.url.clone())
            .collect();
        urls.sort();
        assert_eq!(urls, vec!["loopback://b", "loopback://c"]);
    }

    #[tokio::test]
    async fn test_reset_drops_restored_endpoints() {
        let network = LoopbackNetwork::new();
        let (connector, _inbox) = network.attach();
        let mut restored = identity("alice");
        restored.upsert_endpoint(EndpointConfig::new("loopback://old"));
        let local = Arc::new(RwLock::new(restored));
        let registry = EndpointRegistry::new(local.clone(), Arc::new(connector), network.clone());

        registry
            .reset(vec![EndpointConfig::new("loopback://new")])
            .await
            .unwrap();

        let id = local.read().await.id().clone();
        let published = network.resolve(&id).await.unwrap();
        assert_eq!(published.endpoints.len(), 1);
        assert_eq!(published.endpoints[0].url, "loopback://new");
    }
}
