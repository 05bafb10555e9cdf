//! vSphere collector
//!
//! Long-running task that mirrors a vCenter into the provider's store. It
//! subscribes to the property collector, applies each update set in order
//! and flags the inventory consistent once vCenter reports a complete
//! (non-truncated) snapshot. A lost session is re-established with capped
//! backoff and resynchronised from scratch; objects not seen again are
//! pruned when the new snapshot completes.

use super::adapter::{Applied, Selector};
use crate::domain::ports::{ObjectUpdate, SessionFactory, SourceSession, UpdateAction};
use crate::error::Result;
use crate::inventory::container::{Reconciler, ReconcilerStats};
use crate::inventory::model::Ref;
use crate::inventory::store::Store;
use crate::metrics;
use crate::retry::RetryConfig;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on each cleanup call made while stopping
const STOP_CALL_TIMEOUT: Duration = Duration::from_millis(500);
/// Bound on waiting for the collector task to exit
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_CONFLICT_RETRIES: u32 = 5;

/// Collector tuning
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// `maxWaitSeconds` passed to each wait call
    pub max_wait: Duration,
    /// Delay before reapplying an update that hit a write conflict
    pub conflict_delay: Duration,
    /// Reconnect policy
    pub reconnect: RetryConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            conflict_delay: Duration::from_secs(1),
            reconnect: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    consistent: AtomicBool,
    updates: AtomicU64,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Collector for one vSphere provider
pub struct Collector {
    name: String,
    store: Store,
    factory: Arc<dyn SessionFactory>,
    config: CollectorConfig,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Collector {
    pub fn new(name: impl Into<String>, store: Store, factory: Arc<dyn SessionFactory>) -> Self {
        Self::with_config(name, store, factory, CollectorConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        store: Store,
        factory: Arc<dyn SessionFactory>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            factory,
            config,
            shared: Arc::new(Shared::default()),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Reconciler for Collector {
    fn name(&self) -> &str {
        &self.name
    }

    fn db(&self) -> &Store {
        &self.store
    }

    fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        self.store.open(true)?;

        let cancel = CancellationToken::new();
        let task = Task {
            name: self.name.clone(),
            store: self.store.clone(),
            factory: self.factory.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());
        *running = Some(Running { cancel, handle });
        info!(provider = %self.name, "Collector started");
        Ok(())
    }

    async fn shutdown(&self, purge: bool) -> Result<()> {
        let running = self.running.lock().take();
        if let Some(Running { cancel, mut handle }) = running {
            cancel.cancel();
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!(provider = %self.name, "Collector did not stop in time, aborting");
                handle.abort();
            }
            self.store.close()?;
        }
        self.shared.consistent.store(false, Ordering::Release);
        if purge {
            self.store.purge()?;
        }
        info!(provider = %self.name, purge, "Collector stopped");
        Ok(())
    }

    fn reset(&self) {
        self.shared.consistent.store(false, Ordering::Release);
        debug!(provider = %self.name, "Collector reset");
    }

    fn has_consistency(&self) -> bool {
        self.shared.consistent.load(Ordering::Acquire)
    }

    fn stats(&self) -> ReconcilerStats {
        let store = self.store.stats();
        ReconcilerStats {
            object_count: store.object_count,
            updates: self.shared.updates.load(Ordering::Relaxed),
            last_update: store.last_update,
            consistent: self.has_consistency(),
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// State owned by the spawned collector task
struct Task {
    name: String,
    store: Store,
    factory: Arc<dyn SessionFactory>,
    config: CollectorConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Task {
    async fn run(self) {
        let mut policy = self.config.reconnect.backoff();
        while !self.cancel.is_cancelled() {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.factory.connect() => r,
            };
            let session = match connected {
                Ok(session) => session,
                Err(e) => {
                    warn!(provider = %self.name, error = %e, "Source connection failed");
                    self.pause(policy.next_backoff()).await;
                    continue;
                }
            };

            match self.watch(session.as_ref()).await {
                Ok(()) => {
                    self.stop_session(session.as_ref()).await;
                    break;
                }
                Err(e) => {
                    warn!(provider = %self.name, error = %e, "Source session lost, reconnecting");
                    if let Ok(Err(e)) = tokio::time::timeout(STOP_CALL_TIMEOUT, session.logout()).await {
                        debug!(provider = %self.name, error = %e, "Logout after session loss failed");
                    }
                    self.pause(policy.next_backoff()).await;
                }
            }
        }
        debug!(provider = %self.name, "Collector task exited");
    }

    async fn pause(&self, delay: Option<Duration>) {
        let delay = delay.unwrap_or(self.config.reconnect.max_delay);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn stop_session(&self, session: &dyn SourceSession) {
        if let Ok(Err(e)) = tokio::time::timeout(STOP_CALL_TIMEOUT, session.cancel_wait()).await {
            debug!(provider = %self.name, error = %e, "CancelWaitForUpdates failed");
        }
        if let Ok(Err(e)) = tokio::time::timeout(STOP_CALL_TIMEOUT, session.logout()).await {
            debug!(provider = %self.name, error = %e, "Logout failed");
        }
    }

    /// Follow the update stream until canceled (`Ok`) or the session fails.
    async fn watch(&self, session: &dyn SourceSession) -> Result<()> {
        session.subscribe().await?;
        let mut version = String::new();
        let mut seen: Option<HashSet<Ref>> = Some(HashSet::new());

        loop {
            let waited = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = session.wait_for_updates(&version, self.config.max_wait) => r?,
            };
            let Some(set) = waited else {
                continue;
            };

            let mut applied = 0u64;
            for update in &set.updates {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                if self.apply(update, seen.as_mut()).await {
                    applied += 1;
                }
            }
            if applied > 0 {
                self.shared.updates.fetch_add(applied, Ordering::Relaxed);
                metrics::record_inventory_updates(&self.name, applied);
            }
            version = set.version;

            if !set.truncated {
                if let Some(seen) = seen.take() {
                    self.prune(&seen);
                }
                if !self.shared.consistent.swap(true, Ordering::AcqRel) {
                    info!(provider = %self.name, version = %version, "Inventory consistent");
                }
            }
        }
    }

    /// Apply one update; errors are logged and skipped.
    async fn apply(&self, update: &ObjectUpdate, seen: Option<&mut HashSet<Ref>>) -> bool {
        let Some(selector) = Selector::select(&update.kind) else {
            debug!(provider = %self.name, kind = %update.kind, id = %update.id, "Unknown kind ignored");
            return false;
        };
        if let Some(seen) = seen {
            let key = Ref::new(selector.kind(), &update.id);
            if update.action == UpdateAction::Leave {
                seen.remove(&key);
            } else {
                seen.insert(key);
            }
        }

        let mut attempt = 0;
        loop {
            match selector.apply(&self.store, update) {
                Ok(applied) => {
                    if applied == Applied::Created {
                        debug!(provider = %self.name, kind = selector.kind(), id = %update.id, "Object created");
                    }
                    return true;
                }
                Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(self.config.conflict_delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        provider = %self.name,
                        kind = %update.kind,
                        id = %update.id,
                        action = %update.action,
                        error = %e,
                        "Failed to apply update"
                    );
                    return false;
                }
            }
        }
    }

    /// Delete rows the completed snapshot did not mention.
    fn prune(&self, seen: &HashSet<Ref>) {
        let mut pruned = 0usize;
        for selector in Selector::ALL {
            let ids = match selector.ids(&self.store) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(provider = %self.name, kind = selector.kind(), error = %e, "Resync listing failed");
                    continue;
                }
            };
            for id in ids {
                if seen.contains(&Ref::new(selector.kind(), &id)) {
                    continue;
                }
                match selector.delete(&self.store, &id) {
                    Ok(()) => pruned += 1,
                    Err(e) => warn!(provider = %self.name, id = %id, error = %e, "Resync delete failed"),
                }
            }
        }
        if pruned > 0 {
            info!(provider = %self.name, pruned, "Removed objects missing after resync");
        }
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("name", &self.name)
            .field("consistent", &self.has_consistency())
            .finish()
    }
}
