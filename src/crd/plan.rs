//! Plan CRD
//!
//! A migration plan: which VMs move from which source to which destination,
//! using which storage and network maps.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{Conditions, READY};
use super::{ObjectRef, ProviderPair};

/// Annotation marking plans created after populator labelling was introduced
pub const POPULATOR_LABELS_ANNOTATION: &str = "populatorLabels";

// =============================================================================
// Plan CRD
// =============================================================================

/// Plan declares a set of VMs to migrate between two providers.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Plan",
    plural = "plans",
    namespaced,
    status = "PlanStatus",
    printcolumn = r#"{"name": "Ready", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name": "Archived", "type": "boolean", "jsonPath": ".spec.archived"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// Free form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Source and destination providers
    pub provider: ProviderPair,

    /// Namespace the VMs are migrated into
    pub target_namespace: String,

    /// Storage and network maps
    #[serde(default)]
    pub map: PlanMaps,

    /// VMs to migrate
    #[serde(default)]
    pub vms: Vec<PlanVm>,

    /// Migration type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub migration_type: Option<MigrationType>,

    /// Legacy warm flag, equivalent to `type: warm`
    #[serde(default)]
    pub warm: bool,

    /// Archived plans are observed read-only
    #[serde(default)]
    pub archived: bool,

    /// Network used for disk transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_network: Option<ObjectRef>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Cold or warm migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    #[default]
    Cold,
    Warm,
}

impl std::fmt::Display for MigrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationType::Cold => write!(f, "cold"),
            MigrationType::Warm => write!(f, "warm"),
        }
    }
}

/// References to the maps used by a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanMaps {
    #[serde(default)]
    pub network: ObjectRef,
    #[serde(default)]
    pub storage: ObjectRef,
}

/// A VM listed in a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanVm {
    /// Source inventory id
    #[serde(default)]
    pub id: String,

    /// Source name
    #[serde(default)]
    pub name: String,

    /// Namespace of the VM when the source is the local cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Secret holding LUKS passphrases for the VM disks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub luks: Option<ObjectRef>,

    /// Name for the target VM (defaults to the source name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,

    /// Hooks run around the migration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRef>,
}

/// A hook bound to a migration step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookRef {
    /// `PreHook` or `PostHook`
    pub step: String,
    pub hook: ObjectRef,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Plan
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Conditions,
}

// =============================================================================
// Implementations
// =============================================================================

impl Plan {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Whether this is a warm migration
    pub fn is_warm(&self) -> bool {
        self.spec.warm || self.spec.migration_type == Some(MigrationType::Warm)
    }

    pub fn migration_type(&self) -> MigrationType {
        if self.is_warm() {
            MigrationType::Warm
        } else {
            MigrationType::Cold
        }
    }

    /// Whether any VM carries LUKS metadata
    pub fn has_luks(&self) -> bool {
        self.spec.vms.iter().any(|vm| vm.luks.as_ref().map(|l| !l.name.is_empty()).unwrap_or(false))
    }

    /// A plan is ready when `Ready=True` and nothing blocks it.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.has(READY) && !s.conditions.has_blocker())
            .unwrap_or(false)
    }
}
