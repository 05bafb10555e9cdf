//! Migration validator
//!
//! Starting a migration acts on the plan's providers and VMs, so the
//! requesting user must pass the same delegated RBAC checks as for the
//! plan itself.

use super::plan::check_access;
use super::{decode, Admitter, Request, Verdict};
use crate::crd::Migration;
use crate::domain::ports::{AccessReviewer, ClusterLookup};
use async_trait::async_trait;
use kube::core::admission::Operation;
use std::sync::Arc;
use tracing::debug;

pub struct MigrationValidator {
    lookup: Arc<dyn ClusterLookup>,
    reviewer: Arc<dyn AccessReviewer>,
}

impl MigrationValidator {
    pub fn new(lookup: Arc<dyn ClusterLookup>, reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self { lookup, reviewer }
    }
}

#[async_trait]
impl Admitter for MigrationValidator {
    async fn admit(&self, req: &Request) -> Verdict {
        if req.operation == Operation::Delete {
            return Verdict::Allow;
        }
        let migration: Migration = match decode(req) {
            Ok(m) => m,
            Err(e) => return Verdict::invalid(format!("invalid migration: {}", e)),
        };

        let mut plan_ref = migration.spec.plan.clone();
        if plan_ref.namespace.is_empty() {
            plan_ref.namespace = migration.namespace().to_string();
        }
        let plan = match self.lookup.plan(&plan_ref).await {
            Ok(p) => p,
            Err(e) => return Verdict::deny(format!("cannot resolve plan {}: {}", plan_ref, e)),
        };
        let source = match self.lookup.provider(&plan.spec.provider.source).await {
            Ok(p) => p,
            Err(e) => return Verdict::deny(format!("cannot resolve source provider: {}", e)),
        };
        let destination = match self.lookup.provider(&plan.spec.provider.destination).await {
            Ok(p) => p,
            Err(e) => return Verdict::deny(format!("cannot resolve destination provider: {}", e)),
        };

        debug!(migration = %migration.name(), plan = %plan_ref, "Checking migration access");
        check_access(self.reviewer.as_ref(), &req.user_info, &plan, &source, &destination)
            .await
            .unwrap_or(Verdict::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::plan::tests::{cluster, plan_object};
    use crate::admission::tests::{message, request, FakeReviewer};
    use crate::crd::{Plan, ProviderType};
    use crate::domain::ports::AccessCheck;
    use serde_json::json;

    fn migration(plan: &str) -> serde_json::Value {
        json!({
            "apiVersion": "forklift.konveyor.io/v1beta1",
            "kind": "Migration",
            "metadata": {"name": "m-1", "namespace": "konveyor"},
            "spec": {"plan": {"name": plan}}
        })
    }

    fn with_plan() -> crate::admission::tests::FakeLookup {
        let mut lookup = cluster(ProviderType::VSphere);
        let plan: Plan = serde_json::from_value(plan_object(false)).unwrap();
        lookup.plans.insert("konveyor/plan-1".into(), plan);
        lookup
    }

    #[tokio::test]
    async fn test_allows_permitted_user() {
        let v = MigrationValidator::new(Arc::new(with_plan()), Arc::new(FakeReviewer::default()));
        assert_eq!(v.admit(&request("Migration", "CREATE", migration("plan-1"))).await, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_denies_missing_plan_or_access() {
        let v = MigrationValidator::new(Arc::new(with_plan()), Arc::new(FakeReviewer::default()));
        let verdict = v.admit(&request("Migration", "CREATE", migration("other"))).await;
        assert!(message(&verdict).contains("cannot resolve plan konveyor/other"));

        let reviewer = FakeReviewer {
            denied: vec![AccessCheck::new("get", "forklift.konveyor.io", "providers", "konveyor", "source")],
            ..Default::default()
        };
        let v = MigrationValidator::new(Arc::new(with_plan()), Arc::new(reviewer));
        let verdict = v.admit(&request("Migration", "CREATE", migration("plan-1"))).await;
        assert!(message(&verdict).contains("not allowed to get providers konveyor/source"));
    }
}
