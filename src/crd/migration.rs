//! Migration CRD
//!
//! A one-shot execution of a plan. Its status records per-VM progress as an
//! ordered pipeline of steps.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::condition::{Conditions, CANCELED, FAILED, SUCCEEDED};
use super::ObjectRef;

// =============================================================================
// Migration CRD
// =============================================================================

/// Migration runs a plan.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Migration",
    plural = "migrations",
    namespaced,
    status = "MigrationStatus",
    printcolumn = r#"{"name": "Plan", "type": "string", "jsonPath": ".spec.plan.name"}"#,
    printcolumn = r#"{"name": "Succeeded", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Succeeded\")].status"}"#,
    printcolumn = r#"{"name": "Failed", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Failed\")].status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// Plan to execute
    pub plan: ObjectRef,

    /// Cutover time for warm migrations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub cutover: Option<DateTime<Utc>>,

    /// VMs to cancel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<VmRef>,
}

/// Reference to a VM by id or name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Migration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub started: Option<DateTime<Utc>>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub completed: Option<DateTime<Utc>>,

    #[serde(default)]
    pub vms: Vec<VmStatus>,

    #[serde(default)]
    pub conditions: Conditions,
}

/// Per-VM progress record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Current itinerary phase
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub completed: Option<DateTime<Utc>>,
    /// Ordered pipeline steps
    #[serde(default)]
    pub pipeline: Vec<Step>,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<WarmStatus>,
    /// When the current phase was entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub phase_started: Option<DateTime<Utc>>,
}

/// Terminal outcome of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Outcome {
    Succeeded,
    Failed,
    Canceled,
    Completed,
}

impl VmStatus {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether the VM has reached a terminal state
    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }

    /// Outcome of a completed VM
    pub fn outcome(&self) -> Option<Outcome> {
        if !self.is_completed() {
            return None;
        }
        if self.conditions.has(CANCELED) {
            Some(Outcome::Canceled)
        } else if self.conditions.has(FAILED) {
            Some(Outcome::Failed)
        } else if self.conditions.has(SUCCEEDED) {
            Some(Outcome::Succeeded)
        } else {
            Some(Outcome::Completed)
        }
    }

    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.pipeline.iter().find(|s| s.name == name)
    }

    pub fn find_step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.pipeline.iter_mut().find(|s| s.name == name)
    }
}

/// Phase of a pipeline step or task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StepPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl StepPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepPhase::Completed | StepPhase::Failed | StepPhase::Canceled)
    }
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepPhase::Pending => "Pending",
            StepPhase::Running => "Running",
            StepPhase::Completed => "Completed",
            StepPhase::Failed => "Failed",
            StepPhase::Canceled => "Canceled",
        };
        write!(f, "{}", s)
    }
}

/// Progress counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed: i64,
    pub total: i64,
}

/// Error recorded on a step or VM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub phase: String,
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// A pipeline step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phase: StepPhase,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Per-disk tasks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,
}

/// A unit of work within a step, e.g. one disk transfer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub phase: StepPhase,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// Warm migration bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarmStatus {
    #[serde(default)]
    pub successes: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub next_precopy_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub precopies: Vec<Precopy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Precopy {
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snapshot: String,
}

// =============================================================================
// Implementations
// =============================================================================

impl Migration {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Whether the VM is listed for cancellation
    pub fn is_canceled(&self, vm_id: &str) -> bool {
        self.spec.cancel.iter().any(|r| r.id == vm_id)
    }

    /// Whether the migration reached a terminal state
    pub fn is_completed(&self) -> bool {
        self.status.as_ref().and_then(|s| s.completed).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::condition::{Category, Condition};

    #[test]
    fn test_outcome() {
        let mut vm = VmStatus::new("vm-1", "one");
        assert_eq!(vm.outcome(), None);

        vm.completed = Some(Utc::now());
        assert_eq!(vm.outcome(), Some(Outcome::Completed));

        vm.conditions.set(Condition::new(FAILED, Category::Error, "x"));
        assert_eq!(vm.outcome(), Some(Outcome::Failed));

        vm.conditions.set(Condition::new(CANCELED, Category::Advisory, "y"));
        assert_eq!(vm.outcome(), Some(Outcome::Canceled));
    }

    #[test]
    fn test_spec_cutover_parse() {
        let spec: MigrationSpec = serde_json::from_value(serde_json::json!({
            "plan": {"namespace": "ns", "name": "p"},
            "cutover": "2026-01-01T10:00:00Z",
            "cancel": [{"id": "vm-2"}]
        }))
        .unwrap();
        assert!(spec.cutover.is_some());
        let m = Migration::new("m", spec);
        assert!(m.is_canceled("vm-2"));
        assert!(!m.is_canceled("vm-1"));
    }
}
