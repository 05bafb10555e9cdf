//! vSphere entity kinds
//!
//! Only the distinguished fields are typed; everything else the collector
//! sees is kept in the opaque payload under its property path.

use super::reference::{self, Ref, RefList};
use super::{Base, Model};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub children: RefList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datacenter {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub vm_folder: Ref,
    #[serde(default)]
    pub host_folder: Ref,
    #[serde(default)]
    pub net_folder: Ref,
    #[serde(default)]
    pub ds_folder: Ref,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub hosts: RefList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub vms: RefList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datastore {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default, rename = "type")]
    pub ds_type: String,
    #[serde(default)]
    pub capacity_bytes: i64,
    #[serde(default)]
    pub free_bytes: i64,
    #[serde(default)]
    pub maintenance: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    #[serde(flatten)]
    pub base: Base,
}

macro_rules! impl_model {
    ($ty:ty, $kind:expr) => {
        impl Model for $ty {
            const KIND: &'static str = $kind;

            fn base(&self) -> &Base {
                &self.base
            }

            fn base_mut(&mut self) -> &mut Base {
                &mut self.base
            }
        }
    };
}

impl_model!(Folder, reference::FOLDER);
impl_model!(Datacenter, reference::DATACENTER);
impl_model!(Cluster, reference::CLUSTER);
impl_model!(Host, reference::HOST);
impl_model!(Network, reference::NETWORK);
impl_model!(Datastore, reference::DATASTORE);
impl_model!(Vm, reference::VM);

// =============================================================================
// VM payload accessors
// =============================================================================

pub const VM_DEVICES: &str = "config.hardware.device";
pub const VM_CPUS: &str = "config.hardware.numCPU";
pub const VM_MEMORY_MB: &str = "config.hardware.memoryMB";
pub const VM_FIRMWARE: &str = "config.firmware";
pub const VM_UUID: &str = "config.uuid";
pub const VM_POWER_STATE: &str = "runtime.powerState";
pub const VM_TEMPLATE: &str = "config.template";

/// A virtual disk as seen in the VM payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub key: i64,
    pub label: String,
    pub file: String,
    pub datastore: Ref,
    pub capacity_bytes: i64,
}

/// A NIC as seen in the VM payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nic {
    pub mac: String,
    pub network: Ref,
}

/// Numbers arrive either typed or as text depending on nesting depth.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_ref(value: &Value) -> Option<Ref> {
    serde_json::from_value::<Ref>(value.clone()).ok().filter(|r| !r.is_empty())
}

fn devices(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other @ Value::Object(_)) => vec![other],
        _ => Vec::new(),
    }
}

impl Vm {
    fn prop(&self, name: &str) -> Option<&Value> {
        self.base.object.get(name)
    }

    pub fn cpus(&self) -> i64 {
        self.prop(VM_CPUS).and_then(as_i64).unwrap_or(1)
    }

    pub fn memory_mb(&self) -> i64 {
        self.prop(VM_MEMORY_MB).and_then(as_i64).unwrap_or(0)
    }

    pub fn firmware(&self) -> String {
        self.prop(VM_FIRMWARE)
            .and_then(Value::as_str)
            .unwrap_or("bios")
            .to_string()
    }

    pub fn power_state(&self) -> Option<&str> {
        self.prop(VM_POWER_STATE).and_then(Value::as_str)
    }

    pub fn is_template(&self) -> bool {
        self.prop(VM_TEMPLATE).and_then(as_bool).unwrap_or(false)
    }

    /// Virtual disks in device order.
    pub fn disks(&self) -> Vec<Disk> {
        devices(self.prop(VM_DEVICES))
            .into_iter()
            .filter(|d| d.get("_type").and_then(Value::as_str) == Some("VirtualDisk"))
            .map(|d| {
                let backing = d.get("backing");
                Disk {
                    key: d.get("key").and_then(as_i64).unwrap_or_default(),
                    label: d
                        .pointer("/deviceInfo/label")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    file: backing
                        .and_then(|b| b.get("fileName"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    datastore: backing
                        .and_then(|b| b.get("datastore"))
                        .and_then(as_ref)
                        .unwrap_or_default(),
                    capacity_bytes: d.get("capacityInBytes").and_then(as_i64).unwrap_or_default(),
                }
            })
            .collect()
    }

    /// NICs in device order.
    pub fn nics(&self) -> Vec<Nic> {
        devices(self.prop(VM_DEVICES))
            .into_iter()
            .filter_map(|d| {
                let mac = d.get("macAddress")?.as_str()?.to_string();
                let backing = d.get("backing");
                let network = backing
                    .and_then(|b| b.get("network"))
                    .and_then(as_ref)
                    .or_else(|| {
                        backing
                            .and_then(|b| b.pointer("/port/portgroupKey"))
                            .and_then(Value::as_str)
                            .map(|key| Ref::new(reference::NETWORK, key))
                    })
                    .unwrap_or_default();
                Some(Nic { mac, network })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vm_with_devices(devices: Value) -> Vm {
        let mut vm = Vm::with_id("vm-1");
        vm.base.object.insert(VM_DEVICES.into(), devices);
        vm
    }

    #[test]
    fn test_vm_disks_and_nics() {
        let vm = vm_with_devices(json!([
            {"_type": "VirtualIDEController", "key": "200"},
            {
                "_type": "VirtualDisk",
                "key": "2000",
                "deviceInfo": {"label": "Hard disk 1"},
                "backing": {
                    "_type": "VirtualDiskFlatVer2BackingInfo",
                    "fileName": "[ds1] vm-1/vm-1.vmdk",
                    "datastore": {"kind": "Datastore", "id": "datastore-1"}
                },
                "capacityInBytes": "1073741824"
            },
            {
                "_type": "VirtualVmxnet3",
                "key": "4000",
                "macAddress": "00:50:56:aa:bb:cc",
                "backing": {"port": {"portgroupKey": "dvportgroup-7"}}
            }
        ]));

        let disks = vm.disks();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].key, 2000);
        assert_eq!(disks[0].capacity_bytes, 1073741824);
        assert_eq!(disks[0].datastore, Ref::new("Datastore", "datastore-1"));

        let nics = vm.nics();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].network, Ref::new("Network", "dvportgroup-7"));
    }

    #[test]
    fn test_flatten_round_trip_keeps_base() {
        let mut host = Host::with_id("host-1");
        host.base.name = "esx1".into();
        host.base.parent = Ref::new("Cluster", "domain-c1");
        host.maintenance = true;
        host.vms.push(Ref::new("VM", "vm-1"));

        let json = serde_json::to_value(&host).unwrap();
        assert_eq!(json["id"], "host-1");
        assert_eq!(json["parent"]["kind"], "Cluster");

        let back: Host = serde_json::from_value(json).unwrap();
        assert_eq!(back, host);

        let summary = host.summary();
        assert!(summary.get("object").is_none());
        assert_eq!(summary["maintenance"], true);
    }

    #[test]
    fn test_defaults_for_missing_hardware() {
        let vm = Vm::with_id("vm-2");
        assert_eq!(vm.cpus(), 1);
        assert_eq!(vm.firmware(), "bios");
        assert!(vm.disks().is_empty());
    }
}
