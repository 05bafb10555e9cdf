//! Collector container
//!
//! Registry of running collectors, one per Provider. Lookups are lock-free
//! reads on a concurrent map; membership changes (start, restart, stop) are
//! serialized so a provider never has two live collectors.

use crate::crd::{Provider, ProviderType};
use crate::error::Result;
use crate::inventory::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Reconciler
// =============================================================================

/// Collector statistics surfaced by the REST provider record
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerStats {
    pub object_count: usize,
    pub updates: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub consistent: bool,
}

/// A provider collector as seen by the container
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &str;

    /// The provider's inventory store
    fn db(&self) -> &Store;

    fn start(&self) -> Result<()>;

    /// Stop collecting. `purge` drops the inventory.
    async fn shutdown(&self, purge: bool) -> Result<()>;

    /// Clear the consistency flag ahead of a re-subscription.
    fn reset(&self);

    fn has_consistency(&self) -> bool;

    fn stats(&self) -> ReconcilerStats;
}

/// Builds a reconciler for a provider; `None` when the type has no collector.
pub trait ReconcilerBuilder: Send + Sync {
    fn build(&self, provider: &Provider, secret: &Secret) -> Result<Option<Arc<dyn Reconciler>>>;
}

// =============================================================================
// Container
// =============================================================================

/// Container key: the provider UID, or `namespace/name` before one is assigned
pub fn provider_key(provider: &Provider) -> String {
    if provider.uid().is_empty() {
        format!("{}/{}", provider.namespace(), provider.name())
    } else {
        provider.uid().to_string()
    }
}

/// What a running collector was built from; a change forces a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    url: String,
    provider_type: Option<ProviderType>,
    secret: String,
    secret_version: String,
}

impl Fingerprint {
    fn of(provider: &Provider, secret: &Secret) -> Self {
        Self {
            url: provider.spec.url.clone(),
            provider_type: provider.provider_type(),
            secret: provider.spec.secret.to_string(),
            secret_version: secret.metadata.resource_version.clone().unwrap_or_default(),
        }
    }
}

/// A registered provider and its collector
#[derive(Clone)]
pub struct Registration {
    pub provider: Provider,
    pub reconciler: Arc<dyn Reconciler>,
    fingerprint: Fingerprint,
}

/// Outcome of [`Container::ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    Started,
    Restarted,
    Unchanged,
    /// The provider type has no collector
    Unsupported,
}

/// Process-wide collector registry
pub struct Container {
    entries: DashMap<String, Registration>,
    membership: Mutex<()>,
    builder: Arc<dyn ReconcilerBuilder>,
}

impl Container {
    pub fn new(builder: Arc<dyn ReconcilerBuilder>) -> Self {
        Self {
            entries: DashMap::new(),
            membership: Mutex::new(()),
            builder,
        }
    }

    /// Collector of a provider.
    pub fn get(&self, provider: &Provider) -> Option<Arc<dyn Reconciler>> {
        self.entries
            .get(&provider_key(provider))
            .map(|e| e.reconciler.clone())
    }

    /// Look up by provider type and UID or name.
    pub fn find(&self, provider_type: &str, id: &str) -> Option<Registration> {
        if let Some(e) = self.entries.get(id) {
            return Some(e.clone()).filter(|r| type_matches(&r.provider, provider_type));
        }
        self.entries
            .iter()
            .find(|e| e.provider.name() == id && type_matches(&e.provider, provider_type))
            .map(|e| e.clone())
    }

    /// Every registration, ordered by namespace and name.
    pub fn list(&self) -> Vec<Registration> {
        let mut out: Vec<Registration> = self.entries.iter().map(|e| e.clone()).collect();
        out.sort_by(|a, b| {
            (a.provider.namespace(), a.provider.name()).cmp(&(b.provider.namespace(), b.provider.name()))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a collector for a newly observed provider, or restart it when
    /// its URL, type or secret changed.
    pub async fn ensure(&self, provider: &Provider, secret: &Secret) -> Result<Ensured> {
        let _guard = self.membership.lock().await;
        let key = provider_key(provider);
        let fingerprint = Fingerprint::of(provider, secret);

        let existing = self.entries.get(&key).map(|e| e.clone());
        let mut outcome = Ensured::Started;
        if let Some(existing) = existing {
            if existing.fingerprint == fingerprint {
                self.entries.insert(
                    key,
                    Registration {
                        provider: provider.clone(),
                        ..existing
                    },
                );
                return Ok(Ensured::Unchanged);
            }
            info!(provider = %key, "Provider changed, restarting collector");
            self.entries.remove(&key);
            existing.reconciler.reset();
            if let Err(e) = existing.reconciler.shutdown(false).await {
                warn!(provider = %key, error = %e, "Collector shutdown failed");
            }
            outcome = Ensured::Restarted;
        }

        let Some(reconciler) = self.builder.build(provider, secret)? else {
            debug!(provider = %key, "No collector for provider type");
            return Ok(Ensured::Unsupported);
        };
        reconciler.start()?;
        self.entries.insert(
            key,
            Registration {
                provider: provider.clone(),
                reconciler,
                fingerprint,
            },
        );
        Ok(outcome)
    }

    /// Stop and forget a provider's collector, dropping its inventory.
    pub async fn delete(&self, provider: &Provider) -> Result<bool> {
        let _guard = self.membership.lock().await;
        let key = provider_key(provider);
        let Some((_, registration)) = self.entries.remove(&key) else {
            return Ok(false);
        };
        registration.reconciler.shutdown(true).await?;
        info!(provider = %key, "Collector removed");
        Ok(true)
    }

    /// Stop every collector, keeping persisted inventories.
    pub async fn shutdown(&self) {
        let _guard = self.membership.lock().await;
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, registration)) = self.entries.remove(&key) {
                if let Err(e) = registration.reconciler.shutdown(false).await {
                    warn!(provider = %key, error = %e, "Collector shutdown failed");
                }
            }
        }
    }
}

fn type_matches(provider: &Provider, provider_type: &str) -> bool {
    provider
        .provider_type()
        .map(|t| t.as_str() == provider_type)
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::{ObjectRef, ProviderSpec};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Reconciler with settable consistency and call counters.
    pub(crate) struct FakeReconciler {
        pub name: String,
        pub store: Store,
        pub consistent: AtomicBool,
        pub starts: AtomicU32,
        pub shutdowns: AtomicU32,
        pub purged: AtomicBool,
        pub fail_shutdown: AtomicBool,
    }

    impl FakeReconciler {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                store: Store::new(name),
                consistent: AtomicBool::new(false),
                starts: AtomicU32::new(0),
                shutdowns: AtomicU32::new(0),
                purged: AtomicBool::new(false),
                fail_shutdown: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Reconciler for FakeReconciler {
        fn name(&self) -> &str {
            &self.name
        }

        fn db(&self) -> &Store {
            &self.store
        }

        fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self, purge: bool) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.purged.store(purge, Ordering::SeqCst);
            if self.fail_shutdown.load(Ordering::SeqCst) {
                return Err(crate::error::Error::Internal("collector stuck".into()));
            }
            Ok(())
        }

        fn reset(&self) {
            self.consistent.store(false, Ordering::SeqCst);
        }

        fn has_consistency(&self) -> bool {
            self.consistent.load(Ordering::SeqCst)
        }

        fn stats(&self) -> ReconcilerStats {
            ReconcilerStats {
                object_count: self.store.stats().object_count,
                consistent: self.has_consistency(),
                ..Default::default()
            }
        }
    }

    /// Hands out fresh fakes for vSphere providers and remembers them.
    #[derive(Default)]
    pub(crate) struct FakeBuilder {
        pub built: parking_lot::Mutex<Vec<Arc<FakeReconciler>>>,
    }

    impl ReconcilerBuilder for FakeBuilder {
        fn build(&self, provider: &Provider, _secret: &Secret) -> Result<Option<Arc<dyn Reconciler>>> {
            if provider.provider_type() != Some(ProviderType::VSphere) {
                return Ok(None);
            }
            let fake = FakeReconciler::new(provider.name());
            self.built.lock().push(fake.clone());
            Ok(Some(fake))
        }
    }

    pub(crate) fn vsphere(name: &str, uid: &str, url: &str) -> Provider {
        let mut p = Provider::new(
            name,
            ProviderSpec {
                provider_type: Some(ProviderType::VSphere),
                url: url.into(),
                secret: ObjectRef::new("konveyor", format!("{}-secret", name)),
                settings: Default::default(),
            },
        );
        p.metadata.namespace = Some("konveyor".into());
        p.metadata.uid = Some(uid.into());
        p
    }

    #[tokio::test]
    async fn test_ensure_starts_once_and_restarts_on_change() {
        let builder = Arc::new(FakeBuilder::default());
        let container = Container::new(builder.clone());
        let provider = vsphere("vc", "uid-1", "https://vc/sdk");
        let secret = Secret::default();

        assert_eq!(container.ensure(&provider, &secret).await.unwrap(), Ensured::Started);
        assert_eq!(container.ensure(&provider, &secret).await.unwrap(), Ensured::Unchanged);
        assert_eq!(container.len(), 1);

        let moved = vsphere("vc", "uid-1", "https://vc2/sdk");
        assert_eq!(container.ensure(&moved, &secret).await.unwrap(), Ensured::Restarted);
        assert_eq!(container.len(), 1);

        let built = builder.built.lock().clone();
        assert_eq!(built.len(), 2);
        assert_eq!(built[0].shutdowns.load(Ordering::SeqCst), 1);
        assert!(!built[0].purged.load(Ordering::SeqCst));
        assert_eq!(built[1].starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_replaces_collector_when_shutdown_fails() {
        let builder = Arc::new(FakeBuilder::default());
        let container = Container::new(builder.clone());
        let secret = Secret::default();
        container.ensure(&vsphere("vc", "uid-1", "https://vc/sdk"), &secret).await.unwrap();
        builder.built.lock()[0].fail_shutdown.store(true, Ordering::SeqCst);

        let moved = vsphere("vc", "uid-1", "https://vc2/sdk");
        assert_eq!(container.ensure(&moved, &secret).await.unwrap(), Ensured::Restarted);
        assert_eq!(container.ensure(&moved, &secret).await.unwrap(), Ensured::Unchanged);

        let built = builder.built.lock().clone();
        assert_eq!(built.len(), 2);
        assert_eq!(built[0].shutdowns.load(Ordering::SeqCst), 1);
        let current = container.get(&moved).unwrap();
        assert!(Arc::ptr_eq(&current.db().inner, &built[1].store.inner));
        assert_eq!(container.find("vsphere", "uid-1").unwrap().provider.spec.url, "https://vc2/sdk");
    }

    #[tokio::test]
    async fn test_find_by_uid_or_name_and_delete() {
        let builder = Arc::new(FakeBuilder::default());
        let container = Container::new(builder.clone());
        let provider = vsphere("vc", "uid-1", "https://vc/sdk");
        container.ensure(&provider, &Secret::default()).await.unwrap();

        assert!(container.find("vsphere", "uid-1").is_some());
        assert!(container.find("vsphere", "vc").is_some());
        assert!(container.find("ovirt", "vc").is_none());
        assert!(container.get(&provider).is_some());

        assert!(container.delete(&provider).await.unwrap());
        assert!(!container.delete(&provider).await.unwrap());
        assert!(container.is_empty());
        assert!(builder.built.lock()[0].purged.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unsupported_type_is_not_registered() {
        let container = Container::new(Arc::new(FakeBuilder::default()));
        let mut provider = vsphere("ova", "uid-2", "nfs://x");
        provider.spec.provider_type = Some(ProviderType::Ova);
        assert_eq!(
            container.ensure(&provider, &Secret::default()).await.unwrap(),
            Ensured::Unsupported
        );
        assert!(container.is_empty());
    }
}
