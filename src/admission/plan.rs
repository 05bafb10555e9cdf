//! Plan admitters
//!
//! The mutator defaults the transfer network from the destination
//! provider's annotation and marks new plans for populator labelling. The
//! validator checks, in order: provider resolution, delegated RBAC, static
//! storage classes, warm support and LUKS support.

use super::{decode, diff_patch, Admitter, Request, Verdict};
use crate::crd::{
    ObjectRef, Plan, Provider, ProviderType, DEFAULT_TRANSFER_NETWORK_ANNOTATION, POPULATOR_LABELS_ANNOTATION,
};
use crate::domain::ports::{AccessCheck, AccessReviewer, ClusterLookup, DestinationFactory};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::UserInfo;
use kube::core::admission::Operation;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PATCHED_PATHS: &[&str] = &["/spec", "/metadata/annotations"];

/// Storage classes with this provisioner are statically provisioned
pub const NO_PROVISIONER: &str = "kubernetes.io/no-provisioner";

const FORKLIFT_GROUP: &str = "forklift.konveyor.io";
const KUBEVIRT_GROUP: &str = "kubevirt.io";

// =============================================================================
// Mutator
// =============================================================================

/// Parse `namespace/name` or `name`, defaulting the namespace.
fn parse_network(value: &str, default_namespace: &str) -> ObjectRef {
    match value.split_once('/') {
        Some((ns, name)) => ObjectRef::new(ns, name),
        None => ObjectRef::new(default_namespace, value),
    }
}

/// Defaults the transfer network and populator annotation
pub struct PlanMutator {
    lookup: Arc<dyn ClusterLookup>,
    destinations: Arc<dyn DestinationFactory>,
}

impl PlanMutator {
    pub fn new(lookup: Arc<dyn ClusterLookup>, destinations: Arc<dyn DestinationFactory>) -> Self {
        Self { lookup, destinations }
    }

    /// Transfer network named by the destination provider, when it exists.
    async fn default_transfer_network(&self, plan: &Plan) -> Result<Option<ObjectRef>> {
        let destination = self.lookup.provider(&plan.spec.provider.destination).await?;
        let Some(value) = destination
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(DEFAULT_TRANSFER_NETWORK_ANNOTATION))
            .filter(|v| !v.is_empty())
        else {
            return Ok(None);
        };

        let network = parse_network(value, &plan.spec.target_namespace);
        let client = self.destinations.client_for(&destination).await?;
        if client.network_attachment_exists(&network.namespace, &network.name).await? {
            info!(plan = %plan.name(), network = %network, "Defaulting transfer network");
            Ok(Some(network))
        } else {
            warn!(plan = %plan.name(), network = %network, "Default transfer network not found");
            Ok(None)
        }
    }

    async fn mutate(&self, plan: &Plan, create: bool) -> Result<Option<json_patch::Patch>> {
        let mut mutated = plan.clone();

        if plan.spec.transfer_network.as_ref().map(|n| !n.is_set()).unwrap_or(true) {
            if let Some(network) = self.default_transfer_network(plan).await? {
                mutated.spec.transfer_network = Some(network);
            }
        }

        if create {
            mutated
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .entry(POPULATOR_LABELS_ANNOTATION.to_string())
                .or_insert_with(|| "True".to_string());
        }

        diff_patch(
            &serde_json::to_value(plan)?,
            &serde_json::to_value(&mutated)?,
            PATCHED_PATHS,
        )
    }
}

#[async_trait]
impl Admitter for PlanMutator {
    async fn admit(&self, req: &Request) -> Verdict {
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return Verdict::Allow;
        }
        let plan: Plan = match decode(req) {
            Ok(p) => p,
            Err(e) => return Verdict::invalid(e.to_string()),
        };
        match self.mutate(&plan, req.operation == Operation::Create).await {
            Ok(patch) => Verdict::patched(patch),
            Err(e) => Verdict::failed(&e),
        }
    }
}

// =============================================================================
// RBAC delegation
// =============================================================================

/// Checks that `user` may use both providers and the VMs a plan touches.
/// Returns the first refused check as a deny verdict.
pub(crate) async fn check_access(
    reviewer: &dyn AccessReviewer,
    user: &UserInfo,
    plan: &Plan,
    source: &Provider,
    destination: &Provider,
) -> Option<Verdict> {
    let mut checks = vec![
        AccessCheck::new("get", FORKLIFT_GROUP, "providers", source.namespace(), source.name()),
        AccessCheck::new("get", FORKLIFT_GROUP, "providers", destination.namespace(), destination.name()),
    ];
    if destination.is_host() {
        checks.push(AccessCheck::new(
            "create",
            KUBEVIRT_GROUP,
            "virtualmachines",
            &plan.spec.target_namespace,
            "",
        ));
    }
    if source.is_host() {
        for vm in &plan.spec.vms {
            let namespace = vm.namespace.as_deref().unwrap_or(plan.namespace());
            checks.push(AccessCheck::new("get", KUBEVIRT_GROUP, "virtualmachines", namespace, &vm.name));
        }
    }

    let username = user.username.as_deref().unwrap_or("unknown");
    for check in checks {
        match reviewer.allowed(user, &check).await {
            Ok(true) => {}
            Ok(false) => {
                return Some(Verdict::deny(format!("user {} is not allowed to {}", username, check)));
            }
            Err(e) => return Some(Verdict::failed(&e)),
        }
    }
    None
}

// =============================================================================
// Validator
// =============================================================================

/// Validates plans against their providers, maps and the caller's RBAC.
///
/// The static storage check applies only to cold plans that move vSphere
/// VMs into the local cluster. Other source types populate their disks in
/// ways that tolerate statically provisioned classes, so they are not
/// checked.
pub struct PlanValidator {
    lookup: Arc<dyn ClusterLookup>,
    reviewer: Arc<dyn AccessReviewer>,
}

impl PlanValidator {
    pub fn new(lookup: Arc<dyn ClusterLookup>, reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self { lookup, reviewer }
    }

    /// Names of storage classes in the plan's storage map that are static.
    async fn static_storage_classes(&self, plan: &Plan) -> Result<Vec<String>> {
        let map = self.lookup.storage_map(&plan.spec.map.storage).await?;
        let mut names: Vec<String> = Vec::new();
        for pair in &map.spec.map {
            let name = &pair.destination.storage_class;
            if name.is_empty() || names.contains(name) {
                continue;
            }
            let class = self.lookup.storage_class(name).await?;
            if class.provisioner == NO_PROVISIONER {
                names.push(name.clone());
            }
        }
        Ok(names)
    }

    async fn validate(&self, plan: &Plan, user: &UserInfo) -> Verdict {
        let providers = futures::future::try_join(
            self.lookup.provider(&plan.spec.provider.source),
            self.lookup.provider(&plan.spec.provider.destination),
        )
        .await;
        let (source, destination) = match providers {
            Ok(p) => p,
            Err(e) if plan.spec.archived => {
                debug!(plan = %plan.name(), error = %e, "Archived plan with missing provider");
                return Verdict::Allow;
            }
            Err(e) => return Verdict::deny(format!("cannot resolve providers: {}", e)),
        };

        if let Some(denied) = check_access(self.reviewer.as_ref(), user, plan, &source, &destination).await {
            return denied;
        }

        let source_type = source.provider_type();
        if !plan.is_warm() && destination.is_host() && source_type == Some(ProviderType::VSphere) {
            match self.static_storage_classes(plan).await {
                Ok(names) if !names.is_empty() => {
                    return Verdict::deny(format!(
                        "Static storage class(es) found: [{}]. Cold migration requires storage classes with a dynamic provisioner",
                        names.join(" ")
                    ));
                }
                Ok(_) => {}
                Err(e) => return Verdict::failed(&e),
            }
        }

        if plan.is_warm() && source_type == Some(ProviderType::OpenStack) {
            return Verdict::deny("warm migration is not supported by OpenStack providers");
        }

        if plan.has_luks() && !matches!(source_type, Some(ProviderType::VSphere | ProviderType::Ova)) {
            return Verdict::deny(format!(
                "LUKS encrypted disks are not supported for {} providers",
                source_type.map(|t| t.as_str()).unwrap_or("unknown")
            ));
        }

        Verdict::Allow
    }
}

#[async_trait]
impl Admitter for PlanValidator {
    async fn admit(&self, req: &Request) -> Verdict {
        if req.operation == Operation::Delete {
            return Verdict::Allow;
        }
        match decode::<Plan>(req) {
            Ok(plan) => self.validate(&plan, &req.user_info).await,
            Err(e) => Verdict::invalid(format!("invalid plan: {}", e)),
        }
    }
}
