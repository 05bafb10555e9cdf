//! Provider controller
//!
//! Tests the provider's credentials, starts or restarts its inventory
//! collector and reports readiness. Deleting a provider stops its collector.

use crate::crd::{
    condition::{CONNECTION_TEST_FAILED, CONNECTION_TEST_SUCCEEDED, INVENTORY_CREATED, READY},
    Category, Condition, Provider, ProviderStatus,
};
use crate::error::Result;
use crate::inventory::Ensured;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{add_finalizer, patch_status, remove_finalizers, Context};

/// Held while the provider's collector runs
pub const INVENTORY_FINALIZER: &str = "forklift.konveyor.io/inventory";

pub const PHASE_READY: &str = "Ready";
pub const PHASE_STAGING: &str = "Staging";
pub const PHASE_CONNECTION_FAILED: &str = "ConnectionFailed";

/// Inventory state seen by one reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inventory {
    /// The provider type has no collector
    Unsupported,
    /// Collector running; `true` once consistent
    Collecting(bool),
}

/// Compute the provider status from a connection test result and the
/// collector state. Existing conditions keep their transition times.
pub fn provider_status(
    current: Option<&ProviderStatus>,
    generation: i64,
    connection: std::result::Result<(), String>,
    inventory: Inventory,
) -> ProviderStatus {
    let mut conditions = current.map(|s| s.conditions.clone()).unwrap_or_default();
    let phase = match connection {
        Err(message) => {
            conditions.delete(CONNECTION_TEST_SUCCEEDED);
            conditions.delete(INVENTORY_CREATED);
            conditions.set(Condition::new(CONNECTION_TEST_FAILED, Category::Critical, message));
            PHASE_CONNECTION_FAILED
        }
        Ok(()) => {
            conditions.delete(CONNECTION_TEST_FAILED);
            conditions.set(Condition::new(
                CONNECTION_TEST_SUCCEEDED,
                Category::Required,
                "Connection test, succeeded.",
            ));
            match inventory {
                Inventory::Collecting(false) => {
                    conditions.delete(INVENTORY_CREATED);
                    PHASE_STAGING
                }
                Inventory::Collecting(true) => {
                    conditions.set(Condition::new(
                        INVENTORY_CREATED,
                        Category::Required,
                        "The inventory has been loaded.",
                    ));
                    PHASE_READY
                }
                Inventory::Unsupported => PHASE_READY,
            }
        }
    };

    if phase == PHASE_READY && !conditions.has_blocker() {
        conditions.set(Condition::new(READY, Category::Required, "The provider is ready."));
    } else {
        conditions.delete(READY);
    }

    ProviderStatus {
        phase: phase.to_string(),
        observed_generation: generation,
        conditions,
    }
}

fn requeue(phase: &str) -> Action {
    match phase {
        PHASE_READY => Action::requeue(Duration::from_secs(300)),
        PHASE_STAGING => Action::requeue(Duration::from_secs(10)),
        _ => Action::requeue(Duration::from_secs(60)),
    }
}

async fn evaluate(provider: &Provider, ctx: &Context) -> Result<ProviderStatus> {
    let generation = provider.metadata.generation.unwrap_or_default();
    if provider.is_host() {
        return Ok(provider_status(provider.status.as_ref(), generation, Ok(()), Inventory::Unsupported));
    }

    let secret = match ctx.lookup.secret(&provider.spec.secret).await {
        Ok(secret) => secret,
        Err(e) if e.is_not_found() => {
            let message = format!("Secret {} not found.", provider.spec.secret);
            return Ok(provider_status(provider.status.as_ref(), generation, Err(message), Inventory::Unsupported));
        }
        Err(e) => return Err(e),
    };

    let tested = match ctx.connectors.build(provider, &secret) {
        Ok(connector) => connector.test().await,
        Err(e) => Err(e),
    };
    if let Err(e) = tested {
        if e.is_transient() {
            return Err(e);
        }
        warn!(provider = %provider.name(), error = %e, "Connection test failed");
        return Ok(provider_status(
            provider.status.as_ref(),
            generation,
            Err(e.to_string()),
            Inventory::Unsupported,
        ));
    }

    let inventory = match ctx.container.ensure(provider, &secret).await? {
        Ensured::Unsupported => Inventory::Unsupported,
        ensured => {
            if ensured != Ensured::Unchanged {
                info!(provider = %provider.name(), ?ensured, "Inventory collector started");
            }
            let consistent = ctx.container.get(provider).map(|r| r.has_consistency()).unwrap_or(false);
            Inventory::Collecting(consistent)
        }
    };
    Ok(provider_status(provider.status.as_ref(), generation, Ok(()), inventory))
}

/// Reconcile a Provider
pub async fn reconcile(provider: Arc<Provider>, ctx: Arc<Context>) -> Result<Action> {
    let name = provider.name_any();
    let namespace = provider.namespace().to_string();
    let api: Api<Provider> = Api::namespaced(ctx.client.clone(), &namespace);

    if provider.metadata.deletion_timestamp.is_some() {
        if ctx.container.delete(&provider).await? {
            info!(provider = %name, "Inventory collector stopped");
        }
        let mut finalizers = vec![INVENTORY_FINALIZER];
        finalizers.extend(provider.provider_type().and_then(|t| t.finalizer()));
        remove_finalizers(&api, provider.as_ref(), &finalizers).await?;
        return Ok(Action::await_change());
    }

    add_finalizer(&api, provider.as_ref(), INVENTORY_FINALIZER).await?;

    let status = evaluate(&provider, &ctx).await?;
    let unchanged = provider
        .status
        .as_ref()
        .map(|s| s.phase == status.phase && s.conditions == status.conditions && s.observed_generation == status.observed_generation)
        .unwrap_or(false);
    if unchanged {
        debug!(provider = %name, "Status unchanged, skipping update");
    } else {
        info!(provider = %name, phase = %status.phase, "Provider status updated");
        patch_status(&api, &name, serde_json::to_value(&status)?).await?;
    }
    Ok(requeue(&status.phase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_after_inventory_loaded() {
        let staging = provider_status(None, 1, Ok(()), Inventory::Collecting(false));
        assert_eq!(staging.phase, PHASE_STAGING);
        assert!(!staging.conditions.has(READY));
        assert!(staging.conditions.has(CONNECTION_TEST_SUCCEEDED));

        let ready = provider_status(Some(&staging), 1, Ok(()), Inventory::Collecting(true));
        assert_eq!(ready.phase, PHASE_READY);
        assert!(ready.conditions.has(INVENTORY_CREATED));
        assert!(ready.conditions.has(READY));
        assert_eq!(
            ready.conditions.find(CONNECTION_TEST_SUCCEEDED).unwrap().last_transition_time,
            staging.conditions.find(CONNECTION_TEST_SUCCEEDED).unwrap().last_transition_time
        );
    }

    #[test]
    fn test_connection_failure_blocks_ready() {
        let ready = provider_status(None, 1, Ok(()), Inventory::Unsupported);
        assert!(ready.conditions.has(READY));

        let failed = provider_status(Some(&ready), 2, Err("401 Unauthorized".into()), Inventory::Unsupported);
        assert_eq!(failed.phase, PHASE_CONNECTION_FAILED);
        assert!(!failed.conditions.has(READY));
        assert!(!failed.conditions.has(CONNECTION_TEST_SUCCEEDED));
        let cond = failed.conditions.find(CONNECTION_TEST_FAILED).unwrap();
        assert_eq!(cond.category, Category::Critical);
        assert_eq!(cond.message, "401 Unauthorized");
        assert_eq!(failed.observed_generation, 2);
    }
}
