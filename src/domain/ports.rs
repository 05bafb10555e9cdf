//! Domain Ports - Trait definitions at the side-effect seams
//!
//! These traits define the boundaries between the controller logic and the
//! systems it talks to: source platforms, the destination cluster and the
//! local Kubernetes API. Adapters implement them; tests supply fakes.

use crate::crd::{ObjectRef, Plan, Provider, StorageMap, NetworkMap};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::UserInfo;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Source Update Stream
// =============================================================================

/// Action carried by an object update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    Enter,
    Modify,
    Leave,
}

impl std::fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateAction::Enter => write!(f, "enter"),
            UpdateAction::Modify => write!(f, "modify"),
            UpdateAction::Leave => write!(f, "leave"),
        }
    }
}

/// Operation of a single property change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOp {
    Assign,
    Add,
    Remove,
    IndirectRemove,
}

/// A property change within an object update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Property path, e.g. `summary.runtime.inMaintenanceMode`
    pub name: String,
    pub op: ChangeOp,
    /// Decoded value; `Null` for removals
    pub value: serde_json::Value,
}

impl PropertyChange {
    pub fn assign(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            op: ChangeOp::Assign,
            value,
        }
    }
}

/// Update of one source object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    /// Raw source type, e.g. `HostSystem`
    pub kind: String,
    /// Source-stable id, e.g. `host-12`
    pub id: String,
    pub action: UpdateAction,
    pub changes: Vec<PropertyChange>,
}

/// A batch of updates returned by one wait call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateSet {
    /// Version token to pass to the next wait
    pub version: String,
    /// `false` once the source declares the snapshot complete
    pub truncated: bool,
    pub updates: Vec<ObjectUpdate>,
}

/// A logged-in session to a source platform that streams object updates.
#[async_trait]
pub trait SourceSession: Send + Sync {
    /// Install the property filter covering the watched object tree.
    async fn subscribe(&self) -> Result<()>;

    /// Block until updates newer than `version` are available. Returns
    /// `None` when `max_wait` elapses without changes.
    async fn wait_for_updates(&self, version: &str, max_wait: Duration) -> Result<Option<UpdateSet>>;

    /// Unblock a pending `wait_for_updates`.
    async fn cancel_wait(&self) -> Result<()>;

    /// End the session.
    async fn logout(&self) -> Result<()>;
}

/// Opens source sessions; called again after a session is lost.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SourceSession>>;
}

// =============================================================================
// Source Control
// =============================================================================

/// Operations on a source VM needed during migration
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Power the VM off. Powering off a stopped VM is not an error.
    async fn power_off(&self, vm_id: &str) -> Result<()>;

    /// Create a snapshot used as a change-tracking checkpoint; returns its id.
    async fn create_snapshot(&self, vm_id: &str) -> Result<String>;

    /// Remove a snapshot created by `create_snapshot`.
    async fn remove_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<()>;
}

/// Builds source controls from a provider and its secret
pub trait SourceControlFactory: Send + Sync {
    fn build(&self, provider: &Provider, secret: &Secret) -> Result<Arc<dyn SourceControl>>;
}

// =============================================================================
// Connectors
// =============================================================================

/// Outcome of a best-effort transfer probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The probe completed
    Passed,
    /// The endpoint presented a certificate the supplied CA does not trust
    CertificateRejected(String),
    /// Anything else; treated as transient
    Inconclusive(String),
}

/// Live credential test against a source or destination platform
#[async_trait]
pub trait Connector: Send + Sync {
    /// Authenticate against the platform. HTTP rejections surface as
    /// `Error::SourceApi { code, .. }`.
    async fn test(&self) -> Result<()>;

    /// Extra probe exercising the data path (oVirt image transfer).
    async fn probe_transfer(&self) -> ProbeResult {
        ProbeResult::Passed
    }
}

/// Builds connectors from a provider and its secret
pub trait ConnectorFactory: Send + Sync {
    fn build(&self, provider: &Provider, secret: &Secret) -> Result<Box<dyn Connector>>;
}

/// Fetches a PEM encoded CA bundle over HTTPS
#[async_trait]
pub trait CaFetcher: Send + Sync {
    /// GET `url`, trusting only `trusted` when present.
    async fn fetch(&self, url: &str, trusted: Option<&str>) -> Result<String>;
}

// =============================================================================
// Kubernetes Lookups
// =============================================================================

/// A delegated permission check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessCheck {
    pub verb: String,
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl AccessCheck {
    pub fn new(verb: &str, group: &str, resource: &str, namespace: &str, name: &str) -> Self {
        Self {
            verb: verb.into(),
            group: group.into(),
            resource: resource.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for AccessCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{} {} in {}", self.verb, self.resource, self.namespace)
        } else {
            write!(f, "{} {} {}/{}", self.verb, self.resource, self.namespace, self.name)
        }
    }
}

/// Answers whether a user may perform an action
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn allowed(&self, user: &UserInfo, check: &AccessCheck) -> Result<bool>;
}

/// Reads Forklift and core objects from the local cluster
#[async_trait]
pub trait ClusterLookup: Send + Sync {
    async fn provider(&self, r: &ObjectRef) -> Result<Provider>;
    async fn secret(&self, r: &ObjectRef) -> Result<Secret>;
    async fn plan(&self, r: &ObjectRef) -> Result<Plan>;
    async fn storage_map(&self, r: &ObjectRef) -> Result<StorageMap>;
    async fn network_map(&self, r: &ObjectRef) -> Result<NetworkMap>;
    async fn storage_class(&self, name: &str) -> Result<StorageClass>;
}

// =============================================================================
// Destination Cluster
// =============================================================================

/// Path used to move one disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// `VSphereXcopyVolumePopulator` routed by a storage offload plugin
    Xcopy,
    /// CDI `DataVolume`
    DataVolume,
}

/// Request to transfer one source disk into a PVC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskTransfer {
    pub kind: TransferKind,
    /// Name of the populator or DataVolume object
    pub name: String,
    pub namespace: String,
    /// Target PVC
    pub pvc: String,
    pub storage_class: String,
    pub access_mode: Option<String>,
    pub volume_mode: Option<String>,
    pub capacity_bytes: i64,
    /// Source VM id
    pub vm_id: String,
    /// Source disk file, e.g. `[ds1] vm/vm.vmdk`
    pub source_path: String,
    /// Offload plugin settings when `kind` is `Xcopy`
    pub xcopy: Option<(String, String)>,
    /// Provider URL and secret used by the importer
    pub source_url: String,
    pub source_secret: String,
    pub labels: BTreeMap<String, String>,
    /// Warm migration checkpoints
    pub checkpoints: Vec<Checkpoint>,
    pub final_checkpoint: bool,
}

/// A warm migration checkpoint pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub previous: String,
    pub current: String,
}

/// Phase reported by a transfer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPhase {
    Pending,
    Running,
    /// Warm checkpoint copied; waiting for the next one
    Paused,
    Succeeded,
    Failed,
}

/// Status read back from a populator or DataVolume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub phase: TransferPhase,
    /// PVC named by the status, when known
    pub pvc: Option<String>,
    pub completed: i64,
    pub total: i64,
}

/// The KubeVirt VM materialised on the destination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetVm {
    pub name: String,
    pub namespace: String,
    pub cpus: i64,
    pub memory_mb: i64,
    pub firmware: String,
    /// PVCs in boot order
    pub pvcs: Vec<String>,
    pub networks: Vec<TargetNetwork>,
    pub labels: BTreeMap<String, String>,
}

/// A NIC on the target VM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetNetwork {
    pub name: String,
    /// `pod` or `multus`
    pub network_type: String,
    /// `namespace/name` of the attachment definition for multus
    pub attachment: Option<String>,
    pub mac: Option<String>,
}

/// Client scoped to the destination cluster of a plan
#[async_trait]
pub trait DestinationClient: Send + Sync {
    /// Whether a NetworkAttachmentDefinition exists.
    async fn network_attachment_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Create the transfer object (and PVC) when absent; update checkpoints
    /// otherwise.
    async fn ensure_transfer(&self, transfer: &DiskTransfer) -> Result<()>;

    /// Read transfer status; `None` when the object is gone.
    async fn transfer_status(&self, transfer: &DiskTransfer) -> Result<Option<TransferStatus>>;

    /// Delete the transfer object. Absent objects are ignored.
    async fn delete_transfer(&self, transfer: &DiskTransfer) -> Result<()>;

    /// Delete a PVC. Absent PVCs are ignored.
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create the target VM stopped. Existing VMs are left untouched.
    async fn create_vm(&self, vm: &TargetVm) -> Result<()>;

    /// Start the target VM.
    async fn start_vm(&self, namespace: &str, name: &str) -> Result<()>;

    /// Whether the target VM reports ready.
    async fn vm_ready(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// Builds destination clients from a provider
#[async_trait]
pub trait DestinationFactory: Send + Sync {
    async fn client_for(&self, provider: &Provider) -> Result<Arc<dyn DestinationClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_action_display() {
        assert_eq!(UpdateAction::Enter.to_string(), "enter");
        assert_eq!(UpdateAction::Leave.to_string(), "leave");
    }

    #[test]
    fn test_access_check_display() {
        let check = AccessCheck::new("get", "forklift.konveyor.io", "providers", "ns", "vsphere");
        assert_eq!(check.to_string(), "get providers ns/vsphere");
        let check = AccessCheck::new("create", "kubevirt.io", "virtualmachines", "target", "");
        assert_eq!(check.to_string(), "create virtualmachines in target");
    }
}
