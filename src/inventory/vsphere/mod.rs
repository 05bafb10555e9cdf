//! vSphere inventory
//!
//! SOAP client, property filter, adapter selector, collector and the
//! traversal library over the collected tree.

pub mod adapter;
pub mod client;
pub mod collector;
pub mod filter;
pub mod traversal;
pub mod xml;

pub use adapter::{Applied, Apply, Selector};
pub use client::{Credentials, VimClient, VimSessionFactory, VimSourceControl};
pub use collector::{Collector, CollectorConfig};

use crate::crd::{Provider, ProviderType};
use crate::domain::ports::{SourceControl, SourceControlFactory};
use crate::error::{Error, Result};
use crate::inventory::container::{provider_key, Reconciler, ReconcilerBuilder};
use crate::inventory::store::Store;
use k8s_openapi::api::core::v1::Secret;
use std::path::PathBuf;
use std::sync::Arc;

/// Builds vSphere collectors; other provider types get none.
#[derive(Debug, Clone, Default)]
pub struct CollectorBuilder {
    /// Directory for store snapshots; `None` keeps inventories in memory
    pub inventory_path: Option<PathBuf>,
    pub config: CollectorConfig,
}

impl CollectorBuilder {
    pub fn new(inventory_path: Option<PathBuf>) -> Self {
        Self {
            inventory_path,
            config: CollectorConfig::default(),
        }
    }

    fn store(&self, provider: &Provider) -> Store {
        let name = format!("{}/{}", provider.namespace(), provider.name());
        match &self.inventory_path {
            Some(dir) => Store::persistent(name, dir.join(format!("{}.json", provider_key(provider).replace('/', "_")))),
            None => Store::new(name),
        }
    }
}

impl ReconcilerBuilder for CollectorBuilder {
    fn build(&self, provider: &Provider, secret: &Secret) -> Result<Option<Arc<dyn Reconciler>>> {
        if provider.provider_type() != Some(ProviderType::VSphere) {
            return Ok(None);
        }
        let factory = Arc::new(VimSessionFactory::new(
            provider.spec.url.clone(),
            Credentials::from_secret(secret),
        ));
        let collector = Collector::with_config(
            format!("{}/{}", provider.namespace(), provider.name()),
            self.store(provider),
            factory,
            self.config.clone(),
        );
        Ok(Some(Arc::new(collector)))
    }
}

/// Builds VM controls for vSphere sources
#[derive(Debug, Clone, Default)]
pub struct VimControlFactory;

impl SourceControlFactory for VimControlFactory {
    fn build(&self, provider: &Provider, secret: &Secret) -> Result<Arc<dyn SourceControl>> {
        if provider.provider_type() != Some(ProviderType::VSphere) {
            return Err(Error::InvariantViolation(format!(
                "no source control for provider type '{}'",
                provider.provider_type().map(|t| t.to_string()).unwrap_or_default()
            )));
        }
        Ok(Arc::new(VimSourceControl::new(
            provider.spec.url.clone(),
            Credentials::from_secret(secret),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::container::tests::vsphere;

    #[test]
    fn test_builder_only_builds_vsphere() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CollectorBuilder::new(Some(dir.path().to_path_buf()));
        let provider = vsphere("vc", "0d7b5c1e", "https://vc/sdk");
        let built = builder.build(&provider, &Secret::default()).unwrap().unwrap();
        assert_eq!(built.name(), "konveyor/vc");
        assert!(built.db().is_persistent());

        let mut ovirt = provider.clone();
        ovirt.spec.provider_type = Some(ProviderType::OVirt);
        assert!(builder.build(&ovirt, &Secret::default()).unwrap().is_none());
    }

    #[test]
    fn test_control_factory_rejects_other_types() {
        let mut provider = vsphere("vc", "0d7b5c1e", "https://vc/sdk");
        assert!(VimControlFactory.build(&provider, &Secret::default()).is_ok());
        provider.spec.provider_type = Some(ProviderType::OVirt);
        assert!(VimControlFactory.build(&provider, &Secret::default()).is_err());
    }
}
