//! Controllers
//!
//! kube-runtime controllers for the Forklift CRDs:
//! - Provider: connection test and inventory collector lifecycle
//! - Plan: readiness evaluation
//! - Migration: drives the plan execution engine

pub mod migration;
pub mod plan;
pub mod provider;

use crate::domain::ports::{ClusterLookup, ConnectorFactory};
use crate::error::{Error, ErrorAction, Result};
use crate::inventory::Container;
use crate::plan::Engine;
use crate::settings::Settings;
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::crd::{Migration, Plan, Provider};

/// Field manager for status and metadata patches
pub const FIELD_MANAGER: &str = "forklift-controller";

/// Watch timeout; must stay below the client read timeout (30s).
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Shared state of the controllers
pub struct Context {
    pub client: Client,
    pub lookup: Arc<dyn ClusterLookup>,
    pub container: Arc<Container>,
    pub connectors: Arc<dyn ConnectorFactory>,
    pub engine: Arc<Engine>,
    pub settings: Settings,
}

/// Map an error to a requeue action.
pub fn error_policy<K>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    warn!(
        kind = %K::kind(&()),
        name = %obj.name_any(),
        namespace = %obj.namespace().unwrap_or_default(),
        error = %error,
        "Reconciliation failed"
    );
    match error.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(Duration::from_secs(5)),
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Merge-patch the status subresource.
pub async fn patch_status<K>(api: &Api<K>, name: &str, status: serde_json::Value) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Add a finalizer when absent.
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut finalizers = obj.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&obj.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Remove the listed finalizers, if any are present.
pub async fn remove_finalizers<K>(api: &Api<K>, obj: &K, remove: &[&str]) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| !remove.contains(&f.as_str()))
        .cloned()
        .collect();
    if finalizers.len() == obj.finalizers().len() {
        return Ok(());
    }
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&obj.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

/// Build the Provider, Plan and Migration controller futures.
pub fn build_controllers(ctx: Arc<Context>) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let providers: Api<Provider> = Api::all(ctx.client.clone());
    let plans: Api<Plan> = Api::all(ctx.client.clone());
    let migrations: Api<Migration> = Api::all(ctx.client.clone());

    let provider_ctrl = Controller::new(providers, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(provider::reconcile, error_policy::<Provider>, ctx.clone())
        .for_each(log_reconcile_result("Provider"));

    let plan_ctrl = Controller::new(plans, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(plan::reconcile, error_policy::<Plan>, ctx.clone())
        .for_each(log_reconcile_result("Plan"));

    let migration_ctrl = Controller::new(migrations, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(migration::reconcile, error_policy::<Migration>, ctx)
        .for_each(log_reconcile_result("Migration"));

    info!("- Provider controller");
    info!("- Plan controller");
    info!("- Migration controller");

    vec![Box::pin(provider_ctrl), Box::pin(plan_ctrl), Box::pin(migration_ctrl)]
}
