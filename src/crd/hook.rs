//! Hook CRD
//!
//! A container image run before or after a VM migration.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;

/// Hook runs a user supplied image around a migration step.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Hook",
    plural = "hooks",
    namespaced,
    status = "HookStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    /// Image to run
    pub image: String,

    /// Base64 encoded Ansible playbook
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub playbook: String,

    /// Service account the hook job runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Job deadline in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Conditions,
}
