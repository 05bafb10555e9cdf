//! Reference envelope
//!
//! A cross-kind reference is a `(kind, id)` pair encoded as JSON. Decoding
//! never fails: malformed input yields the empty reference.

use serde::{Deserialize, Serialize};

// =============================================================================
// Kinds
// =============================================================================

pub const FOLDER: &str = "Folder";
pub const DATACENTER: &str = "Datacenter";
pub const CLUSTER: &str = "Cluster";
pub const HOST: &str = "Host";
pub const NETWORK: &str = "Network";
pub const DATASTORE: &str = "Datastore";
pub const VM: &str = "VM";

/// Map a raw vSphere managed object type to a reference kind. Unknown types
/// pass through verbatim.
pub fn vsphere_kind(raw: &str) -> &str {
    match raw {
        "ClusterComputeResource" => CLUSTER,
        "HostSystem" => HOST,
        "VirtualMachine" => VM,
        "DistributedVirtualPortgroup" => NETWORK,
        other => other,
    }
}

// =============================================================================
// Ref
// =============================================================================

/// Typed reference to an inventory entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub id: String,
}

impl Ref {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Reference built from a raw vSphere type.
    pub fn vsphere(raw_kind: &str, id: impl Into<String>) -> Self {
        Self::new(vsphere_kind(raw_kind), id)
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() && self.id.is_empty()
    }

    /// Encode as JSON.
    pub fn encode(&self) -> String {
        encode_ref(&self.kind, &self.id)
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Encode a reference.
pub fn encode_ref(kind: &str, id: &str) -> String {
    serde_json::json!({ "kind": kind, "id": id }).to_string()
}

/// Decode a reference; malformed input yields `Ref::default()`.
pub fn decode_ref(s: &str) -> Ref {
    serde_json::from_str(s).unwrap_or_default()
}

// =============================================================================
// RefList
// =============================================================================

/// Ordered list of references without duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefList(Vec<Ref>);

impl RefList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless already present. Returns whether the list changed.
    pub fn push(&mut self, r: Ref) -> bool {
        if self.0.contains(&r) {
            return false;
        }
        self.0.push(r);
        true
    }

    pub fn remove(&mut self, r: &Ref) -> bool {
        let before = self.0.len();
        self.0.retain(|x| x != r);
        before != self.0.len()
    }

    pub fn contains(&self, r: &Ref) -> bool {
        self.0.contains(r)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Ref> {
        self.0.iter()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    /// Decode a list; malformed input yields an empty list.
    pub fn decode(s: &str) -> Self {
        serde_json::from_str::<Vec<Ref>>(s)
            .map(Self::from_iter)
            .unwrap_or_default()
    }
}

impl FromIterator<Ref> for RefList {
    fn from_iter<I: IntoIterator<Item = Ref>>(iter: I) -> Self {
        let mut list = RefList::new();
        for r in iter {
            list.push(r);
        }
        list
    }
}

impl<'a> IntoIterator for &'a RefList {
    type Item = &'a Ref;
    type IntoIter = std::slice::Iter<'a, Ref>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
