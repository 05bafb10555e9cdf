//! Plan readiness controller
//!
//! A plan is `Ready` when both providers are ready, the source inventory is
//! consistent, its maps exist and every listed VM is in the inventory. Any
//! `Critical` or `Error` condition keeps it from becoming ready.

use crate::crd::{
    condition::{DESTINATION_NOT_READY, READY, SOURCE_NOT_READY, VALIDATION_FAILED},
    Category, Condition, ObjectRef, Plan, PlanStatus, Provider, ProviderType,
};
use crate::error::Result;
use crate::inventory::model::Vm;
use crate::inventory::{ListOptions, Store};
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{patch_status, Context};

pub const VM_NOT_FOUND: &str = "VMNotFound";

/// What one reconcile learned about a plan's references
#[derive(Debug, Clone, Default)]
pub struct PlanFacts {
    pub source: Option<Provider>,
    pub destination: Option<Provider>,
    /// Source inventory consistency; `None` when there is no collector
    pub source_consistent: Option<bool>,
    pub missing_maps: Vec<String>,
    pub missing_vms: Vec<String>,
}

fn provider_condition(kind: &str, provider: Option<&Provider>, r: &ObjectRef) -> Option<String> {
    match provider {
        None => Some(format!("The {} provider {} was not found.", kind, r)),
        Some(p) if !p.is_ready() => Some(format!("The {} provider {} is not ready.", kind, r)),
        Some(_) => None,
    }
}

/// Evaluate plan conditions. Conditions owned by other writers are kept.
pub fn plan_status(plan: &Plan, facts: &PlanFacts) -> PlanStatus {
    let mut conditions = plan.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();

    let source = provider_condition("source", facts.source.as_ref(), &plan.spec.provider.source).or_else(|| {
        (facts.source_consistent == Some(false))
            .then(|| format!("The inventory of provider {} is not loaded yet.", plan.spec.provider.source))
    });
    match source {
        Some(message) => conditions.set(Condition::new(SOURCE_NOT_READY, Category::Critical, message)),
        None => conditions.delete(SOURCE_NOT_READY),
    }

    match provider_condition("destination", facts.destination.as_ref(), &plan.spec.provider.destination) {
        Some(message) => conditions.set(Condition::new(DESTINATION_NOT_READY, Category::Critical, message)),
        None => conditions.delete(DESTINATION_NOT_READY),
    }

    if facts.missing_maps.is_empty() {
        conditions.delete(VALIDATION_FAILED);
    } else {
        conditions.set(
            Condition::new(VALIDATION_FAILED, Category::Critical, "Referenced maps not found.")
                .with_items(facts.missing_maps.clone()),
        );
    }

    if facts.missing_vms.is_empty() {
        conditions.delete(VM_NOT_FOUND);
    } else {
        conditions.set(
            Condition::new(VM_NOT_FOUND, Category::Critical, "VMs not found in the source inventory.")
                .with_items(facts.missing_vms.clone()),
        );
    }

    conditions.delete(READY);
    if !conditions.has_blocker() {
        conditions.set(Condition::new(READY, Category::Required, "The migration plan is ready."));
    }

    PlanStatus {
        observed_generation: plan.metadata.generation.unwrap_or_default(),
        conditions,
    }
}

/// VMs of the plan absent from the inventory.
pub fn missing_vms(plan: &Plan, store: &Store) -> Vec<String> {
    plan.spec
        .vms
        .iter()
        .filter(|vm| {
            if vm.id.is_empty() {
                store.count::<Vm>(&ListOptions::default().with_name(vm.name.clone())) == 0
            } else {
                store.find::<Vm>(&vm.id).is_err()
            }
        })
        .map(|vm| if vm.id.is_empty() { vm.name.clone() } else { vm.id.clone() })
        .collect()
}

fn in_namespace(r: &ObjectRef, namespace: &str) -> ObjectRef {
    if r.namespace.is_empty() {
        ObjectRef::new(namespace, r.name.clone())
    } else {
        r.clone()
    }
}

async fn gather(plan: &Plan, ctx: &Context) -> Result<PlanFacts> {
    let ns = plan.namespace();
    let mut facts = PlanFacts::default();

    for (slot, r) in [
        (&mut facts.source, &plan.spec.provider.source),
        (&mut facts.destination, &plan.spec.provider.destination),
    ] {
        *slot = match ctx.lookup.provider(&in_namespace(r, ns)).await {
            Ok(p) => Some(p),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
    }

    let storage = in_namespace(&plan.spec.map.storage, ns);
    match ctx.lookup.storage_map(&storage).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => facts.missing_maps.push(format!("StorageMap {}", storage)),
        Err(e) => return Err(e),
    }
    let network = in_namespace(&plan.spec.map.network, ns);
    match ctx.lookup.network_map(&network).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => facts.missing_maps.push(format!("NetworkMap {}", network)),
        Err(e) => return Err(e),
    }

    if let Some(source) = facts.source.as_ref().filter(|p| p.provider_type() == Some(ProviderType::VSphere)) {
        let reconciler = ctx.container.get(source);
        let consistent = reconciler.as_ref().map(|r| r.has_consistency()).unwrap_or(false);
        facts.source_consistent = Some(consistent);
        if let Some(reconciler) = reconciler.filter(|_| consistent) {
            facts.missing_vms = missing_vms(plan, reconciler.db());
        }
    }
    Ok(facts)
}

/// Reconcile a Plan
pub async fn reconcile(plan: Arc<Plan>, ctx: Arc<Context>) -> Result<Action> {
    let name = plan.name_any();
    let api: Api<Plan> = Api::namespaced(ctx.client.clone(), plan.namespace());

    if plan.spec.archived {
        debug!(plan = %name, "Plan archived, skipping");
        return Ok(Action::await_change());
    }

    let facts = gather(&plan, &ctx).await?;
    let status = plan_status(&plan, &facts);
    let ready = status.conditions.has(READY);

    let unchanged = plan
        .status
        .as_ref()
        .map(|s| s.conditions == status.conditions && s.observed_generation == status.observed_generation)
        .unwrap_or(false);
    if !unchanged {
        info!(plan = %name, ready, "Plan status updated");
        patch_status(&api, &name, serde_json::to_value(&status)?).await?;
    }

    if ready {
        return Ok(Action::requeue(Duration::from_secs(300)));
    }
    let age = plan
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| Utc::now().signed_duration_since(t.0).to_std().ok());
    if age.map(|a| a > ctx.settings.plan_timeout).unwrap_or(false) {
        warn!(plan = %name, timeout = ?ctx.settings.plan_timeout, "Plan not ready within timeout");
    }
    Ok(Action::requeue(Duration::from_secs(10)))
}
