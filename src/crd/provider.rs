//! Provider CRD
//!
//! A source or destination virtualization platform together with a
//! reference to the secret holding its credentials.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::condition::Conditions;
use super::ObjectRef;

// =============================================================================
// Provider CRD
// =============================================================================

/// Provider describes a virtualization platform Forklift can migrate from or to.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Provider",
    plural = "providers",
    namespaced,
    status = "ProviderStatus",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.type"}"#,
    printcolumn = r#"{"name": "Url", "type": "string", "jsonPath": ".spec.url"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Provider type
    #[serde(rename = "type", default)]
    pub provider_type: Option<ProviderType>,

    /// Platform API endpoint; empty for the local host cluster
    #[serde(default)]
    pub url: String,

    /// Credentials secret
    #[serde(default)]
    pub secret: ObjectRef,

    /// Provider specific settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Supported provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[serde(rename = "openshift")]
    OpenShift,
    #[serde(rename = "vsphere")]
    VSphere,
    #[serde(rename = "ovirt")]
    OVirt,
    #[serde(rename = "openstack")]
    OpenStack,
    #[serde(rename = "ova")]
    Ova,
    #[serde(rename = "ec2")]
    Ec2,
    #[serde(rename = "hyperv")]
    HyperV,
}

impl ProviderType {
    pub const ALL: [ProviderType; 7] = [
        ProviderType::OpenShift,
        ProviderType::VSphere,
        ProviderType::OVirt,
        ProviderType::OpenStack,
        ProviderType::Ova,
        ProviderType::Ec2,
        ProviderType::HyperV,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenShift => "openshift",
            ProviderType::VSphere => "vsphere",
            ProviderType::OVirt => "ovirt",
            ProviderType::OpenStack => "openstack",
            ProviderType::Ova => "ova",
            ProviderType::Ec2 => "ec2",
            ProviderType::HyperV => "hyperv",
        }
    }

    /// Finalizer added on create, when the type needs one.
    pub fn finalizer(&self) -> Option<&'static str> {
        match self {
            ProviderType::Ova => Some(OVA_PROVIDER_FINALIZER),
            ProviderType::HyperV => Some(HYPERV_PROVIDER_FINALIZER),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProviderType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| {
                crate::error::Error::InvariantViolation(format!("unknown provider type: {}", s))
            })
    }
}

// =============================================================================
// Settings keys
// =============================================================================

pub const SDK_ENDPOINT: &str = "sdkEndpoint";
pub const SDK_ENDPOINT_VCENTER: &str = "vcenter";
pub const SDK_ENDPOINT_ESXI: &str = "esxi";
pub const VDDK_IMAGE: &str = "vddkImage";
pub const USE_VDDK_AIO_OPTIMIZATION: &str = "useVddkAioOptimization";
pub const VDDK_CONFIG: &str = "vddkConfig";

pub const OVA_PROVIDER_FINALIZER: &str = "forklift.konveyor.io/ova-provider";
pub const HYPERV_PROVIDER_FINALIZER: &str = "forklift.konveyor.io/hyperv-provider";

/// Annotation naming the default transfer network of a destination provider
pub const DEFAULT_TRANSFER_NETWORK_ANNOTATION: &str = "forklift.konveyor.io/defaultTransferNetwork";

// =============================================================================
// Status
// =============================================================================

/// Status of the Provider
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Current phase
    #[serde(default)]
    pub phase: String,

    /// Last observed generation
    #[serde(default)]
    pub observed_generation: i64,

    /// Conditions
    #[serde(default)]
    pub conditions: Conditions,
}

// =============================================================================
// Implementations
// =============================================================================

impl Provider {
    /// Get the provider name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Provider type, when set
    pub fn provider_type(&self) -> Option<ProviderType> {
        self.spec.provider_type
    }

    /// The local host provider is an OpenShift provider without a URL.
    pub fn is_host(&self) -> bool {
        self.spec.provider_type == Some(ProviderType::OpenShift) && self.spec.url.is_empty()
    }

    /// Whether the vSphere provider talks to ESXi directly
    pub fn is_esxi(&self) -> bool {
        self.spec.settings.get(SDK_ENDPOINT).map(String::as_str) == Some(SDK_ENDPOINT_ESXI)
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or("")
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.has(super::condition::READY))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(t: ProviderType, url: &str) -> Provider {
        Provider::new(
            "p",
            ProviderSpec {
                provider_type: Some(t),
                url: url.into(),
                secret: ObjectRef::default(),
                settings: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn test_type_round_trip() {
        for t in ProviderType::ALL {
            let parsed: ProviderType = t.as_str().parse().unwrap();
            assert_eq!(parsed, t);
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, t.as_str());
        }
        assert!("xen".parse::<ProviderType>().is_err());
    }

    #[test]
    fn test_is_host() {
        assert!(provider(ProviderType::OpenShift, "").is_host());
        assert!(!provider(ProviderType::OpenShift, "https://remote:6443").is_host());
        assert!(!provider(ProviderType::VSphere, "").is_host());
    }

    #[test]
    fn test_finalizers() {
        assert_eq!(ProviderType::Ova.finalizer(), Some(OVA_PROVIDER_FINALIZER));
        assert_eq!(ProviderType::HyperV.finalizer(), Some(HYPERV_PROVIDER_FINALIZER));
        assert_eq!(ProviderType::VSphere.finalizer(), None);
    }
}
