//! Admission Webhooks
//!
//! Validating and mutating admitters for Secret, Provider, Plan and
//! Migration objects. Each admitter inspects one `AdmissionRequest` and
//! returns a [`Verdict`]; the router turns verdicts into `AdmissionReview`
//! responses.
//!
//! Mutations are expressed as JSON patches over a fixed set of top-level
//! paths (`/spec`, `/data`, `/metadata/labels`, ...). A path is only
//! patched when its value actually changed, so admitting an already
//! mutated object yields no patch.

pub mod cluster;
pub mod migration;
pub mod plan;
pub mod provider;
pub mod secret;
pub mod server;

pub use cluster::{KubeAccessReviewer, KubeClusterLookup};
pub use migration::MigrationValidator;
pub use plan::{PlanMutator, PlanValidator};
pub use provider::{ProviderMutator, ProviderValidator};
pub use secret::{SecretMutator, SecretValidator};
pub use server::{webhook_router, WebhookServer, WebhookServerConfig, WebhookState};

use crate::error::{Error, Result};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, error};

/// Request type handled by every admitter
pub type Request = AdmissionRequest<DynamicObject>;

// =============================================================================
// Verdict
// =============================================================================

/// Outcome of an admission decision
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Deny { code: u16, message: String },
    Patch(json_patch::Patch),
}

impl Verdict {
    /// Policy rejection.
    pub fn deny(message: impl Into<String>) -> Self {
        Verdict::Deny {
            code: 403,
            message: message.into(),
        }
    }

    /// Rejection caused by a malformed object.
    pub fn invalid(message: impl Into<String>) -> Self {
        Verdict::Deny {
            code: 400,
            message: message.into(),
        }
    }

    /// Rejection caused by a lookup or transport failure.
    pub fn failed(err: &Error) -> Self {
        Verdict::Deny {
            code: 500,
            message: err.to_string(),
        }
    }

    /// Allow, patching when there is anything to patch.
    pub fn patched(patch: Option<json_patch::Patch>) -> Self {
        match patch {
            Some(p) => Verdict::Patch(p),
            None => Verdict::Allow,
        }
    }

    pub fn is_allowed(&self) -> bool {
        !matches!(self, Verdict::Deny { .. })
    }

    /// Build the admission response for `req`.
    pub fn into_response(self, req: &Request) -> AdmissionResponse {
        let response = AdmissionResponse::from(req);
        match self {
            Verdict::Allow => response,
            Verdict::Deny { code, message } => {
                let mut denied = response.deny(message);
                denied.result.code = code;
                denied
            }
            Verdict::Patch(patch) => match AdmissionResponse::from(req).with_patch(patch) {
                Ok(patched) => patched,
                Err(e) => {
                    error!(uid = %req.uid, error = %e, "Failed to serialize patch");
                    let mut denied = AdmissionResponse::from(req).deny(format!("patch serialization error: {}", e));
                    denied.result.code = 500;
                    denied
                }
            },
        }
    }
}

/// A single admission webhook
#[async_trait]
pub trait Admitter: Send + Sync {
    async fn admit(&self, req: &Request) -> Verdict;
}

// =============================================================================
// Helpers
// =============================================================================

/// Decode the request object (or the old object on delete) as `T`.
pub fn decode<T: DeserializeOwned>(req: &Request) -> Result<T> {
    let obj = req
        .object
        .as_ref()
        .or(req.old_object.as_ref())
        .ok_or_else(|| Error::InvariantViolation("admission request carries no object".into()))?;
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

/// Patch turning `before` into `after` at the given top-level paths.
///
/// Paths present in both are replaced, new paths added, vanished paths
/// removed. Returns `None` when nothing differs.
pub fn diff_patch(before: &Value, after: &Value, paths: &[&str]) -> Result<Option<json_patch::Patch>> {
    let mut ops = Vec::new();
    for path in paths {
        let old = before.pointer(path);
        let new = after.pointer(path);
        match (old, new) {
            (Some(o), Some(n)) if o == n => {}
            (Some(_), Some(n)) => ops.push(json!({"op": "replace", "path": path, "value": n})),
            (None, Some(n)) => ops.push(json!({"op": "add", "path": path, "value": n})),
            (Some(_), None) => ops.push(json!({"op": "remove", "path": path})),
            (None, None) => {}
        }
    }
    if ops.is_empty() {
        return Ok(None);
    }
    debug!(ops = ops.len(), "Built admission patch");
    Ok(Some(serde_json::from_value(Value::Array(ops))?))
}
