//! Migration controller
//!
//! Drives the plan execution engine one pass per reconcile. Deleting a
//! running migration cancels its in-flight VMs before the finalizer is
//! released.

use crate::crd::{Migration, MigrationStatus};
use crate::error::{Error, Result};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{add_finalizer, patch_status, remove_finalizers, Context};

/// Held until in-flight VMs are canceled
pub const MIGRATION_FINALIZER: &str = "forklift.konveyor.io/migration";

/// Poll interval while VMs are in flight
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Next action after a pass.
pub fn next_action(status: &MigrationStatus) -> Action {
    if status.completed.is_some() {
        Action::await_change()
    } else {
        Action::requeue(POLL_INTERVAL)
    }
}

/// Reconcile a Migration
pub async fn reconcile(migration: Arc<Migration>, ctx: Arc<Context>) -> Result<Action> {
    let name = migration.name_any();
    let api: Api<Migration> = Api::namespaced(ctx.client.clone(), migration.namespace());

    if migration.metadata.deletion_timestamp.is_some() {
        if !migration.is_completed() {
            match ctx.engine.cancel(&migration).await {
                Ok(status) => info!(migration = %name, vms = status.vms.len(), "Migration canceled on delete"),
                Err(e) => warn!(migration = %name, error = %e, "Cancel on delete failed"),
            }
        }
        remove_finalizers(&api, migration.as_ref(), &[MIGRATION_FINALIZER]).await?;
        return Ok(Action::await_change());
    }

    if migration.is_completed() {
        debug!(migration = %name, "Migration completed, nothing to do");
        return Ok(Action::await_change());
    }

    add_finalizer(&api, migration.as_ref(), MIGRATION_FINALIZER).await?;

    let mut status = tokio::time::timeout(ctx.settings.migration_timeout, ctx.engine.reconcile(&migration))
        .await
        .map_err(|_| Error::Timeout(format!("migration {} pass exceeded {:?}", name, ctx.settings.migration_timeout)))??;
    status.observed_generation = migration.metadata.generation.unwrap_or_default();

    if status.completed.is_some() {
        info!(migration = %name, vms = status.vms.len(), "Migration finished");
    }
    patch_status(&api, &name, serde_json::to_value(&status)?).await?;
    Ok(next_action(&status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_next_action() {
        let mut status = MigrationStatus::default();
        assert_eq!(next_action(&status), Action::requeue(POLL_INTERVAL));
        status.completed = Some(Utc::now());
        assert_eq!(next_action(&status), Action::await_change());
    }
}
