//! Inventory object model
//!
//! Every entity carries a [`Base`]: primary key, display name, parent
//! reference, store revision and the opaque payload. Kinds add their
//! distinguished fields on top.

pub mod object;
pub mod reference;
pub mod vsphere;

pub use object::{decode_object, encode_object, Object};
pub use reference::{decode_ref, encode_ref, vsphere_kind, Ref, RefList};
pub use vsphere::{Cluster, Datacenter, Datastore, Folder, Host, Network, Vm};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Fields shared by every inventory entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Base {
    /// Provider-stable primary key
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Containing entity; empty at the root
    #[serde(default, skip_serializing_if = "Ref::is_empty")]
    pub parent: Ref,
    /// Store revision, bumped on every write
    #[serde(default)]
    pub revision: u64,
    /// Opaque payload
    #[serde(default)]
    pub object: Object,
}

impl Base {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// An entity kind stored in the inventory
pub trait Model: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {
    /// Collection name, also the reference kind
    const KIND: &'static str;

    fn base(&self) -> &Base;

    fn base_mut(&mut self) -> &mut Base;

    /// Entity seeded with its primary key
    fn with_id(id: &str) -> Self {
        let mut m = Self::default();
        m.base_mut().id = id.to_string();
        m
    }

    fn pk(&self) -> &str {
        &self.base().id
    }

    /// Reference to this entity
    fn reference(&self) -> Ref {
        Ref::new(Self::KIND, self.pk())
    }

    /// List record: id, name, parent and distinguished fields; no payload.
    fn summary(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("object");
            map.remove("revision");
        }
        value
    }
}
