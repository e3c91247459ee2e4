//! Resolves a cluster ID into capability handles

use super::{ClusterConnector, ClusterHandles};
use crate::crypto::CredentialCipher;
use crate::error::{DeckhandError, Result};
use crate::store::CatalogStore;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Builds cluster handles from stored, encrypted kubeconfigs
///
/// A fresh connection is made for every call; nothing is cached.
#[derive(Clone)]
pub struct ClusterClientFactory {
    catalog: Arc<dyn CatalogStore>,
    connector: Arc<dyn ClusterConnector>,
    cipher: CredentialCipher,
}

impl ClusterClientFactory {
    /// Create a new factory
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        connector: Arc<dyn ClusterConnector>,
        cipher: CredentialCipher,
    ) -> Self {
        Self {
            catalog,
            connector,
            cipher,
        }
    }

    /// Load, decrypt and connect to a cluster
    pub async fn resolve(&self, cluster_id: &str) -> Result<ClusterHandles> {
        let cluster = self
            .catalog
            .cluster(cluster_id)
            .await?
            .ok_or_else(|| DeckhandError::ClusterNotFound(cluster_id.to_string()))?;

        let kubeconfig = Zeroizing::new(self.cipher.decrypt(&cluster.kubeconfig)?);
        debug!("Connecting to cluster {} ({})", cluster.name, cluster.id);

        self.connector.connect(&kubeconfig).await
    }
}
