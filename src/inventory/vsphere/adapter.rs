//! Adapter selector
//!
//! Picks the entity kind for a raw managed object type and folds the
//! update's property changes into that entity: `name` and `parent` into the
//! base, distinguished properties into typed fields, everything else into
//! the opaque payload under its property path.

use crate::domain::ports::{ChangeOp, ObjectUpdate, PropertyChange, UpdateAction};
use crate::error::Result;
use crate::inventory::model::vsphere::{as_bool, as_i64};
use crate::inventory::model::{Cluster, Datacenter, Datastore, Folder, Host, Model, Network, Ref, RefList, Vm};
use crate::inventory::store::Store;
use serde_json::Value;

// =============================================================================
// Value decoding
// =============================================================================

fn to_ref(value: &Value) -> Ref {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

fn to_refs(value: &Value) -> RefList {
    match value {
        Value::Array(items) => items.iter().map(to_ref).filter(|r| !r.is_empty()).collect(),
        Value::Object(_) => std::iter::once(to_ref(value)).filter(|r| !r.is_empty()).collect(),
        _ => RefList::new(),
    }
}

/// Apply a list-valued change to a reference list.
fn with_refs(list: &mut RefList, change: &PropertyChange) {
    match change.op {
        ChangeOp::Assign => *list = to_refs(&change.value),
        ChangeOp::Add => {
            for r in &to_refs(&change.value) {
                list.push(r.clone());
            }
        }
        ChangeOp::Remove | ChangeOp::IndirectRemove => {
            if change.value.is_null() {
                *list = RefList::new();
            } else {
                for r in &to_refs(&change.value) {
                    list.remove(r);
                }
            }
        }
    }
}

fn is_removal(change: &PropertyChange) -> bool {
    matches!(change.op, ChangeOp::Remove | ChangeOp::IndirectRemove)
}

/// First tag key; network tags arrive as `Tag` objects.
fn first_tag(value: &Value) -> String {
    let tag = match value {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    match tag {
        Some(Value::Object(map)) => map.get("key").and_then(Value::as_str).unwrap_or_default().to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

// =============================================================================
// Apply
// =============================================================================

/// Folds property changes into an entity
pub trait Apply: Model {
    /// Apply a distinguished property; `false` when the property is not one.
    fn field(&mut self, change: &PropertyChange) -> bool;

    /// Apply one change to the base, a typed field or the payload.
    fn with(&mut self, change: &PropertyChange) {
        match change.name.as_str() {
            "name" => {
                self.base_mut().name = change.value.as_str().unwrap_or_default().to_string();
            }
            "parent" => {
                self.base_mut().parent = if is_removal(change) {
                    Ref::default()
                } else {
                    to_ref(&change.value)
                };
            }
            _ => {
                if self.field(change) {
                    return;
                }
                let object = &mut self.base_mut().object;
                if is_removal(change) {
                    object.remove(&change.name);
                } else {
                    object.insert(change.name.clone(), change.value.clone());
                }
            }
        }
    }

    /// Apply every change of an update.
    fn with_update(&mut self, update: &ObjectUpdate) {
        for change in &update.changes {
            self.with(change);
        }
    }
}

impl Apply for Folder {
    fn field(&mut self, change: &PropertyChange) -> bool {
        match change.name.as_str() {
            "childEntity" => with_refs(&mut self.children, change),
            _ => return false,
        }
        true
    }
}

impl Apply for Datacenter {
    fn field(&mut self, change: &PropertyChange) -> bool {
        let target = match change.name.as_str() {
            "vmFolder" => &mut self.vm_folder,
            "hostFolder" => &mut self.host_folder,
            "networkFolder" => &mut self.net_folder,
            "datastoreFolder" => &mut self.ds_folder,
            _ => return false,
        };
        *target = if is_removal(change) {
            Ref::default()
        } else {
            to_ref(&change.value)
        };
        true
    }
}

impl Apply for Cluster {
    fn field(&mut self, change: &PropertyChange) -> bool {
        match change.name.as_str() {
            "host" => with_refs(&mut self.hosts, change),
            _ => return false,
        }
        true
    }
}

impl Apply for Host {
    fn field(&mut self, change: &PropertyChange) -> bool {
        match change.name.as_str() {
            "summary.runtime.inMaintenanceMode" => {
                self.maintenance = as_bool(&change.value).unwrap_or(false);
            }
            "vm" => with_refs(&mut self.vms, change),
            _ => return false,
        }
        true
    }
}

impl Apply for Network {
    fn field(&mut self, change: &PropertyChange) -> bool {
        match change.name.as_str() {
            "tag" => self.tag = first_tag(&change.value),
            _ => return false,
        }
        true
    }
}

impl Apply for Datastore {
    fn field(&mut self, change: &PropertyChange) -> bool {
        match change.name.as_str() {
            "summary.type" => self.ds_type = change.value.as_str().unwrap_or_default().to_string(),
            "summary.capacity" => self.capacity_bytes = as_i64(&change.value).unwrap_or_default(),
            "summary.freeSpace" => self.free_bytes = as_i64(&change.value).unwrap_or_default(),
            "summary.maintenanceMode" => {
                self.maintenance = change.value.as_str().unwrap_or_default().to_string()
            }
            _ => return false,
        }
        true
    }
}

impl Apply for Vm {
    fn field(&mut self, change: &PropertyChange) -> bool {
        match change.name.as_str() {
            // A VM inside a vApp has no folder parent.
            "parentVApp" => {
                if !is_removal(change) {
                    self.base.parent = to_ref(&change.value);
                }
            }
            _ => return false,
        }
        true
    }
}

// =============================================================================
// Selector
// =============================================================================

/// What an update did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Deleted,
}

/// Entity kind selected for a raw managed object type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Folder,
    Datacenter,
    Cluster,
    Host,
    Network,
    Datastore,
    Vm,
}

impl Selector {
    pub const ALL: [Selector; 7] = [
        Selector::Folder,
        Selector::Datacenter,
        Selector::Cluster,
        Selector::Host,
        Selector::Network,
        Selector::Datastore,
        Selector::Vm,
    ];

    /// Adapter for a raw type; `None` for kinds the inventory does not model.
    pub fn select(raw_kind: &str) -> Option<Self> {
        match raw_kind {
            "Folder" => Some(Selector::Folder),
            "Datacenter" => Some(Selector::Datacenter),
            "ClusterComputeResource" | "ComputeResource" => Some(Selector::Cluster),
            "HostSystem" => Some(Selector::Host),
            "Network" | "DistributedVirtualPortgroup" => Some(Selector::Network),
            "Datastore" => Some(Selector::Datastore),
            "VirtualMachine" => Some(Selector::Vm),
            _ => None,
        }
    }

    /// Collection the adapter writes to
    pub fn kind(&self) -> &'static str {
        match self {
            Selector::Folder => Folder::KIND,
            Selector::Datacenter => Datacenter::KIND,
            Selector::Cluster => Cluster::KIND,
            Selector::Host => Host::KIND,
            Selector::Network => Network::KIND,
            Selector::Datastore => Datastore::KIND,
            Selector::Vm => Vm::KIND,
        }
    }

    /// Apply an update to the store in one transaction.
    pub fn apply(&self, store: &Store, update: &ObjectUpdate) -> Result<Applied> {
        match self {
            Selector::Folder => apply::<Folder>(store, update),
            Selector::Datacenter => apply::<Datacenter>(store, update),
            Selector::Cluster => apply::<Cluster>(store, update),
            Selector::Host => apply::<Host>(store, update),
            Selector::Network => apply::<Network>(store, update),
            Selector::Datastore => apply::<Datastore>(store, update),
            Selector::Vm => apply::<Vm>(store, update),
        }
    }

    /// Ids currently stored for this kind.
    pub fn ids(&self, store: &Store) -> Result<Vec<String>> {
        match self {
            Selector::Folder => ids::<Folder>(store),
            Selector::Datacenter => ids::<Datacenter>(store),
            Selector::Cluster => ids::<Cluster>(store),
            Selector::Host => ids::<Host>(store),
            Selector::Network => ids::<Network>(store),
            Selector::Datastore => ids::<Datastore>(store),
            Selector::Vm => ids::<Vm>(store),
        }
    }

    /// Delete one row of this kind.
    pub fn delete(&self, store: &Store, id: &str) -> Result<()> {
        match self {
            Selector::Folder => store.delete(&Folder::with_id(id)),
            Selector::Datacenter => store.delete(&Datacenter::with_id(id)),
            Selector::Cluster => store.delete(&Cluster::with_id(id)),
            Selector::Host => store.delete(&Host::with_id(id)),
            Selector::Network => store.delete(&Network::with_id(id)),
            Selector::Datastore => store.delete(&Datastore::with_id(id)),
            Selector::Vm => store.delete(&Vm::with_id(id)),
        }
    }
}

/// Enter and modify upsert; a modify for an unseen object seeds it.
fn apply<M: Apply>(store: &Store, update: &ObjectUpdate) -> Result<Applied> {
    let mut tx = store.begin();
    let mut m = M::with_id(&update.id);
    if update.action == UpdateAction::Leave {
        tx.delete(&m);
        tx.commit()?;
        return Ok(Applied::Deleted);
    }

    let exists = match tx.get(&mut m) {
        Ok(()) => true,
        Err(e) if e.is_not_found() => false,
        Err(e) => return Err(e),
    };
    m.with_update(update);
    if exists {
        tx.update(&mut m)?;
    } else {
        tx.insert(&mut m)?;
    }
    tx.commit()?;
    Ok(if exists { Applied::Updated } else { Applied::Created })
}

fn ids<M: Model>(store: &Store) -> Result<Vec<String>> {
    Ok(store
        .list::<M>(&Default::default())?
        .into_iter()
        .map(|m| m.base().id.clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(kind: &str, id: &str, action: UpdateAction, changes: Vec<PropertyChange>) -> ObjectUpdate {
        ObjectUpdate {
            kind: kind.into(),
            id: id.into(),
            action,
            changes,
        }
    }

    #[test]
    fn test_select_maps_raw_kinds() {
        assert_eq!(Selector::select("HostSystem"), Some(Selector::Host));
        assert_eq!(Selector::select("ComputeResource"), Some(Selector::Cluster));
        assert_eq!(Selector::select("DistributedVirtualPortgroup").map(|s| s.kind()), Some("Network"));
        assert_eq!(Selector::select("VirtualApp"), None);
    }

    #[test]
    fn test_vm_in_vapp_takes_vapp_parent() {
        let mut vm = Vm::with_id("vm-7");
        vm.with_update(&update(
            "VirtualMachine",
            "vm-7",
            UpdateAction::Enter,
            vec![
                PropertyChange::assign("name", json!("app-db")),
                PropertyChange::assign("parentVApp", json!({"kind": "VirtualApp", "id": "resgroup-v9"})),
            ],
        ));
        assert_eq!(vm.base.parent, Ref::new("VirtualApp", "resgroup-v9"));
        assert!(vm.base.object.get("parentVApp").is_none());
    }

    #[test]
    fn test_host_fields_and_payload() {
        let mut host = Host::with_id("host-1");
        host.with_update(&update(
            "HostSystem",
            "host-1",
            UpdateAction::Enter,
            vec![
                PropertyChange::assign("name", json!("esx1")),
                PropertyChange::assign("parent", json!({"kind": "Cluster", "id": "domain-c7"})),
                PropertyChange::assign("summary.runtime.inMaintenanceMode", json!(true)),
                PropertyChange::assign("vm", json!([{"kind": "VM", "id": "vm-1"}, {"kind": "VM", "id": "vm-2"}])),
                PropertyChange::assign("config.product.version", json!("8.0.2")),
            ],
        ));
        assert_eq!(host.base.name, "esx1");
        assert_eq!(host.base.parent, Ref::new("Cluster", "domain-c7"));
        assert!(host.maintenance);
        assert_eq!(host.vms.len(), 2);
        assert_eq!(host.base.object["config.product.version"], "8.0.2");
        assert!(!host.base.object.contains_key("vm"));

        host.with(&PropertyChange {
            name: "config.product.version".into(),
            op: ChangeOp::Remove,
            value: Value::Null,
        });
        assert!(!host.base.object.contains_key("config.product.version"));
    }

    #[test]
    fn test_datastore_and_network_fields() {
        let mut ds = Datastore::with_id("datastore-1");
        ds.with(&PropertyChange::assign("summary.type", json!("VMFS")));
        ds.with(&PropertyChange::assign("summary.capacity", json!("107374182400")));
        ds.with(&PropertyChange::assign("summary.freeSpace", json!(1024)));
        ds.with(&PropertyChange::assign("summary.maintenanceMode", json!("normal")));
        assert_eq!(ds.ds_type, "VMFS");
        assert_eq!(ds.capacity_bytes, 107374182400);
        assert_eq!(ds.free_bytes, 1024);
        assert_eq!(ds.maintenance, "normal");

        let mut net = Network::with_id("dvportgroup-1");
        net.with(&PropertyChange::assign(
            "tag",
            json!([{"_type": "Tag", "key": "SYSTEM/DVS.UPLINKPG"}]),
        ));
        assert_eq!(net.tag, "SYSTEM/DVS.UPLINKPG");
    }

    #[test]
    fn test_apply_upserts_and_deletes() {
        let store = Store::new("test");
        let selector = Selector::select("Folder").unwrap();

        let enter = update(
            "Folder",
            "group-d1",
            UpdateAction::Enter,
            vec![PropertyChange::assign("name", json!("Datacenters"))],
        );
        assert_eq!(selector.apply(&store, &enter).unwrap(), Applied::Created);
        assert_eq!(selector.apply(&store, &enter).unwrap(), Applied::Updated);

        let modify = update(
            "Folder",
            "group-d1",
            UpdateAction::Modify,
            vec![PropertyChange::assign("childEntity", json!([{"kind": "Datacenter", "id": "datacenter-1"}]))],
        );
        selector.apply(&store, &modify).unwrap();
        let folder: Folder = store.find("group-d1").unwrap();
        assert_eq!(folder.base.name, "Datacenters");
        assert_eq!(folder.children.len(), 1);
        assert_eq!(folder.base.revision, 3);

        let modify_unseen = update("Folder", "group-v2", UpdateAction::Modify, vec![]);
        assert_eq!(selector.apply(&store, &modify_unseen).unwrap(), Applied::Created);

        let leave = update("Folder", "group-d1", UpdateAction::Leave, vec![]);
        assert_eq!(selector.apply(&store, &leave).unwrap(), Applied::Deleted);
        assert!(store.find::<Folder>("group-d1").unwrap_err().is_not_found());
        assert_eq!(selector.ids(&store).unwrap(), vec!["group-v2".to_string()]);
    }

    #[test]
    fn test_list_add_and_remove_ops() {
        let mut cluster = Cluster::with_id("domain-c1");
        cluster.with(&PropertyChange::assign("host", json!([{"kind": "Host", "id": "host-1"}])));
        cluster.with(&PropertyChange {
            name: "host".into(),
            op: ChangeOp::Add,
            value: json!({"kind": "Host", "id": "host-2"}),
        });
        assert_eq!(cluster.hosts.len(), 2);
        cluster.with(&PropertyChange {
            name: "host".into(),
            op: ChangeOp::Remove,
            value: json!({"kind": "Host", "id": "host-1"}),
        });
        assert_eq!(cluster.hosts.len(), 1);
        assert!(cluster.hosts.contains(&Ref::new("Host", "host-2")));
    }
}
