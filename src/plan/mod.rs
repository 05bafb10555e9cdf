//! Plan execution engine
//!
//! A `Migration` is one run of a `Plan`. Each reconcile pass resolves the
//! plan's providers and maps, advances the selected VMs concurrently and
//! folds the per-VM outcomes into the migration's conditions.

pub mod cluster;
pub mod itinerary;
pub mod migrator;
pub mod pipeline;
pub mod scheduler;

pub use itinerary::{Deadlines, Itinerary, Phase};
pub use migrator::{MigrationContext, Migrator};
pub use scheduler::Scheduler;

use crate::crd::{
    condition::{CANCELED, EXECUTING, FAILED, SUCCEEDED},
    Category, Condition, Migration, MigrationStatus, ObjectRef, Outcome, PlanVm, ProviderType, VmStatus,
};
use crate::domain::ports::{ClusterLookup, DestinationFactory, SourceControl, SourceControlFactory};
use crate::error::{Error, Result};
use crate::inventory::{Container, Store};
use crate::metrics;
use crate::retry::RetryConfig;
use crate::settings::Settings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub deadlines: Deadlines,
    pub precopy_interval: Duration,
    pub max_concurrent_vms: usize,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            deadlines: Deadlines::from_settings(settings),
            precopy_interval: settings.precopy_interval,
            max_concurrent_vms: settings.max_concurrent_vms,
            retry: RetryConfig::default(),
        }
    }
}

/// Resolves everything a migration needs and drives it.
pub struct Engine {
    lookup: Arc<dyn ClusterLookup>,
    container: Arc<Container>,
    destinations: Arc<dyn DestinationFactory>,
    sources: Arc<dyn SourceControlFactory>,
    config: EngineConfig,
}

/// Stand-in for source types without VM control; every call fails.
struct Unsupported(String);

#[async_trait]
impl SourceControl for Unsupported {
    async fn power_off(&self, _vm_id: &str) -> Result<()> {
        Err(Error::InvariantViolation(self.0.clone()))
    }

    async fn create_snapshot(&self, _vm_id: &str) -> Result<String> {
        Err(Error::InvariantViolation(self.0.clone()))
    }

    async fn remove_snapshot(&self, _vm_id: &str, _snapshot_id: &str) -> Result<()> {
        Err(Error::InvariantViolation(self.0.clone()))
    }
}

/// Default an empty reference namespace to the referring object's.
fn in_namespace(r: &ObjectRef, namespace: &str) -> ObjectRef {
    if r.namespace.is_empty() {
        ObjectRef::new(namespace, r.name.clone())
    } else {
        r.clone()
    }
}

impl Engine {
    pub fn new(
        lookup: Arc<dyn ClusterLookup>,
        container: Arc<Container>,
        destinations: Arc<dyn DestinationFactory>,
        sources: Arc<dyn SourceControlFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            lookup,
            container,
            destinations,
            sources,
            config,
        }
    }

    /// Resolve plan, providers, maps, inventory and clients.
    pub async fn context(&self, migration: &Migration) -> Result<MigrationContext> {
        let ns = migration.namespace();
        let plan = self.lookup.plan(&in_namespace(&migration.spec.plan, ns)).await?;
        let plan_ns = plan.namespace().to_string();
        let source = self.lookup.provider(&in_namespace(&plan.spec.provider.source, &plan_ns)).await?;
        let destination = self
            .lookup
            .provider(&in_namespace(&plan.spec.provider.destination, &plan_ns))
            .await?;
        let storage_map = self.lookup.storage_map(&in_namespace(&plan.spec.map.storage, &plan_ns)).await?.spec;
        let network_map = self.lookup.network_map(&in_namespace(&plan.spec.map.network, &plan_ns)).await?.spec;

        let (inventory, source_control) = if source.provider_type() == Some(ProviderType::VSphere) {
            let reconciler = self.container.get(&source).ok_or_else(|| {
                Error::Transient(format!("inventory of provider {}/{} not started", source.namespace(), source.name()))
            })?;
            if !reconciler.has_consistency() {
                return Err(Error::Transient(format!(
                    "inventory of provider {}/{} not consistent",
                    source.namespace(),
                    source.name()
                )));
            }
            let secret = self.lookup.secret(&in_namespace(&source.spec.secret, source.namespace())).await?;
            (reconciler.db().clone(), self.sources.build(&source, &secret)?)
        } else {
            let message = format!(
                "unsupported source provider type '{}'",
                source.provider_type().map(|t| t.to_string()).unwrap_or_default()
            );
            let control: Arc<dyn SourceControl> = Arc::new(Unsupported(message));
            (Store::new(source.name()), control)
        };

        let destination_client = self.destinations.client_for(&destination).await?;
        Ok(MigrationContext {
            migration: migration.name().to_string(),
            plan,
            source,
            storage_map,
            network_map,
            inventory,
            source_control,
            destination: destination_client,
            deadlines: self.config.deadlines.clone(),
            precopy_interval: self.config.precopy_interval,
            cutover: migration.spec.cutover,
            retry: self.config.retry.clone(),
        })
    }

    /// One reconcile pass; returns the new status.
    pub async fn reconcile(&self, migration: &Migration) -> Result<MigrationStatus> {
        let mut status = migration.status.clone().unwrap_or_default();
        if status.completed.is_some() {
            return Ok(status);
        }
        let ctx = Arc::new(self.context(migration).await?);
        if status.started.is_none() && !ctx.plan.is_ready() {
            return Err(Error::Transient(format!("plan {}/{} is not ready", ctx.plan.namespace(), ctx.plan.name())));
        }
        execute(ctx, Scheduler::new(self.config.max_concurrent_vms), migration, &mut status).await;
        Ok(status)
    }

    /// Cancel every in-flight VM; used when the migration is deleted.
    pub async fn cancel(&self, migration: &Migration) -> Result<MigrationStatus> {
        let mut status = migration.status.clone().unwrap_or_default();
        if status.completed.is_some() || status.vms.is_empty() {
            return Ok(status);
        }
        let ctx = Arc::new(self.context(migration).await?);
        cancel_all(ctx, &mut status).await;
        Ok(status)
    }
}

// =============================================================================
// Execution
// =============================================================================

fn plan_vms(ctx: &MigrationContext) -> HashMap<String, PlanVm> {
    ctx.plan.spec.vms.iter().map(|vm| (vm.id.clone(), vm.clone())).collect()
}

/// Advance a migration by one pass.
pub async fn execute(
    ctx: Arc<MigrationContext>,
    scheduler: Scheduler,
    migration: &Migration,
    status: &mut MigrationStatus,
) {
    if status.started.is_none() {
        status.started = Some(Utc::now());
        info!(migration = %migration.name(), plan = %ctx.plan.name(), "Migration started");
    }
    for vm in &ctx.plan.spec.vms {
        if !status.vms.iter().any(|s| s.id == vm.id) {
            status.vms.push(VmStatus::new(vm.id.clone(), vm.name.clone()));
        }
    }

    let plan_vms = plan_vms(&ctx);
    let migrator = Migrator::new(ctx.clone());

    for vm in status.vms.iter_mut().filter(|vm| migration.is_canceled(&vm.id)) {
        if let Some(plan_vm) = plan_vms.get(&vm.id) {
            migrator.cancel(plan_vm, vm).await;
        }
    }

    let selected = scheduler.next(&status.vms);
    let passes = status
        .vms
        .iter_mut()
        .enumerate()
        .filter(|(i, _)| selected.contains(i))
        .filter_map(|(_, vm)| plan_vms.get(&vm.id).map(|plan_vm| (plan_vm, vm)))
        .map(|(plan_vm, vm)| {
            let migrator = migrator.clone();
            async move {
                if let Err(e) = migrator.run(plan_vm, vm).await {
                    warn!(vm = %vm.id, error = %e, "VM pass interrupted, will retry");
                }
            }
        });
    join_all(passes).await;

    aggregate(status, Utc::now());
}

async fn cancel_all(ctx: Arc<MigrationContext>, status: &mut MigrationStatus) {
    let plan_vms = plan_vms(&ctx);
    let migrator = Migrator::new(ctx);
    for vm in status.vms.iter_mut() {
        if let Some(plan_vm) = plan_vms.get(&vm.id) {
            migrator.cancel(plan_vm, vm).await;
        }
    }
    aggregate(status, Utc::now());
}

/// Fold per-VM outcomes into the migration conditions.
pub fn aggregate(status: &mut MigrationStatus, now: DateTime<Utc>) {
    let mut running = 0;
    let mut succeeded = 0;
    let mut canceled = 0;
    let mut failures = Vec::new();
    for vm in &status.vms {
        match vm.outcome() {
            None => running += 1,
            Some(Outcome::Failed) => {
                let reason = vm.conditions.find(FAILED).map(|c| c.message.clone()).unwrap_or_default();
                let name = if vm.name.is_empty() { &vm.id } else { &vm.name };
                failures.push(format!("VM {} failed: {}", name, reason));
            }
            Some(Outcome::Canceled) => canceled += 1,
            Some(Outcome::Succeeded) | Some(Outcome::Completed) => succeeded += 1,
        }
    }

    metrics::set_migration_vms("Running", running);
    metrics::set_migration_vms("Succeeded", succeeded);
    metrics::set_migration_vms("Failed", failures.len() as i64);
    metrics::set_migration_vms("Canceled", canceled);

    if running > 0 {
        status.conditions.set(
            Condition::new(EXECUTING, Category::Advisory, format!("The migration is EXECUTING. {} VMs running.", running)),
        );
        return;
    }

    status.conditions.delete(EXECUTING);
    if status.completed.is_none() {
        status.completed = Some(now);
    }
    if !failures.is_empty() {
        status
            .conditions
            .set(Condition::new(FAILED, Category::Error, failures.join("; ")).with_items(failures));
        info!(failed = status.vms.len() - succeeded as usize - canceled as usize, "Migration failed");
    } else if canceled > 0 && succeeded == 0 {
        status.conditions.set(Condition::new(CANCELED, Category::Advisory, "The migration has been CANCELED."));
        info!("Migration canceled");
    } else {
        status.conditions.set(Condition::new(SUCCEEDED, Category::Advisory, "The migration has SUCCEEDED."));
        info!(succeeded, canceled, "Migration succeeded");
    }
    debug!(vms = status.vms.len(), "Migration completed");
}
