//! StorageMap and NetworkMap CRDs
//!
//! Ordered source → destination mappings consumed by plans.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;
use super::ProviderPair;

// =============================================================================
// StorageMap CRD
// =============================================================================

/// Maps source storage (datastores, storage domains, volume types) to
/// destination storage classes.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "StorageMap",
    plural = "storagemaps",
    namespaced,
    status = "MapStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct StorageMapSpec {
    /// Source and destination providers
    #[serde(default)]
    pub provider: ProviderPair,

    /// Ordered storage pairs
    #[serde(default)]
    pub map: Vec<StoragePair>,
}

/// A single storage mapping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoragePair {
    /// Source storage reference
    pub source: SourceRef,
    /// Destination storage
    pub destination: DestinationStorage,
    /// Optional routing to an offload plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_plugin: Option<OffloadPlugin>,
}

/// Reference to a source inventory object by id and/or name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub ref_type: String,
}

/// Destination storage class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStorage {
    pub storage_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
}

/// Offload plugin routing. Only used to select the populator path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OffloadPlugin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere_xcopy_config: Option<VSphereXcopyConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VSphereXcopyConfig {
    pub secret_ref: String,
    pub storage_vendor_product: String,
}

// =============================================================================
// NetworkMap CRD
// =============================================================================

/// Maps source networks to destination networks.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "NetworkMap",
    plural = "networkmaps",
    namespaced,
    status = "MapStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMapSpec {
    #[serde(default)]
    pub provider: ProviderPair,

    #[serde(default)]
    pub map: Vec<NetworkPair>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPair {
    pub source: SourceRef,
    pub destination: DestinationNetwork,
}

/// Destination network selector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationNetwork {
    /// `pod`, `multus` or `ignored`
    #[serde(rename = "type")]
    pub network_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Status shared by both map kinds
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MapStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Conditions,
}

impl StorageMapSpec {
    /// Find the pair for a source datastore id.
    pub fn find(&self, source_id: &str) -> Option<&StoragePair> {
        self.map.iter().find(|p| p.source.id == source_id)
    }
}

impl NetworkMapSpec {
    pub fn find(&self, source_id: &str) -> Option<&NetworkPair> {
        self.map.iter().find(|p| p.source.id == source_id)
    }
}
