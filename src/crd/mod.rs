//! Custom Resource Definitions for Forklift
//!
//! This module contains all CRD types:
//! - Provider: a source or destination platform
//! - StorageMap / NetworkMap: source → destination mappings
//! - Plan: which VMs to migrate and how
//! - Migration: one execution of a plan, with per-VM pipelines
//! - Hook: image run around a migration step

pub mod condition;
pub mod hook;
pub mod mapping;
pub mod migration;
pub mod plan;
pub mod provider;

pub use condition::{Category, Condition, Conditions};
pub use hook::*;
pub use mapping::*;
pub use migration::*;
pub use plan::*;
pub use provider::*;

use kube::CustomResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespaced object reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_set(&self) -> bool {
        !self.name.is_empty()
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Source and destination provider references
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPair {
    #[serde(default)]
    pub source: ObjectRef,
    #[serde(default)]
    pub destination: ObjectRef,
}

/// Render every CRD as a multi-document YAML stream.
pub fn crd_yaml() -> std::result::Result<String, serde_yaml::Error> {
    let crds = [
        Provider::crd(),
        StorageMap::crd(),
        NetworkMap::crd(),
        Plan::crd(),
        Migration::crd(),
        Hook::crd(),
    ];
    let mut out = String::new();
    for crd in crds.iter() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(crd)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_yaml_contains_all_kinds() {
        let yaml = crd_yaml().unwrap();
        for kind in ["Provider", "StorageMap", "NetworkMap", "Plan", "Migration", "Hook"] {
            assert!(yaml.contains(&format!("kind: {}", kind)), "missing {}", kind);
        }
    }
}
