//! Kubernetes destination adapter
//!
//! Materialises disk transfers (XCOPY populators or CDI DataVolumes), PVCs
//! and KubeVirt VMs on a destination cluster through dynamic objects.

use crate::domain::ports::{
    DestinationClient, DiskTransfer, TargetVm, TransferKind, TransferPhase, TransferStatus,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

pub const POPULATOR_GROUP: &str = "forklift.konveyor.io";
pub const POPULATOR_KIND: &str = "VSphereXcopyVolumePopulator";

/// Disk bus and NIC model of migrated devices
const VIRTIO: &str = "virtio";

fn resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
}

fn network_attachment() -> ApiResource {
    resource("k8s.cni.cncf.io", "v1", "NetworkAttachmentDefinition", "network-attachment-definitions")
}

fn populator() -> ApiResource {
    resource(POPULATOR_GROUP, "v1beta1", POPULATOR_KIND, "vspherexcopyvolumepopulators")
}

fn data_volume() -> ApiResource {
    resource("cdi.kubevirt.io", "v1beta1", "DataVolume", "datavolumes")
}

fn virtual_machine() -> ApiResource {
    resource("kubevirt.io", "v1", "VirtualMachine", "virtualmachines")
}

fn api_error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}

/// Treat `AlreadyExists` as success.
fn created<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if api_error_code(&e) == Some(409) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Treat `NotFound` as success.
fn deleted<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if api_error_code(&e) == Some(404) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Manifests
// =============================================================================

fn storage_request(transfer: &DiskTransfer) -> Value {
    let mut storage = json!({
        "storageClassName": transfer.storage_class,
        "resources": {"requests": {"storage": transfer.capacity_bytes.max(0).to_string()}}
    });
    if let Some(mode) = &transfer.access_mode {
        storage["accessModes"] = json!([mode]);
    }
    if let Some(mode) = &transfer.volume_mode {
        storage["volumeMode"] = json!(mode);
    }
    storage
}

/// The XCOPY populator CR for a transfer.
pub fn populator_manifest(transfer: &DiskTransfer) -> Value {
    let (secret_ref, vendor) = transfer.xcopy.clone().unwrap_or_default();
    json!({
        "metadata": {"labels": transfer.labels},
        "spec": {
            "vmId": transfer.vm_id,
            "vmdkPath": transfer.source_path,
            "secretName": secret_ref,
            "storageVendorProduct": vendor,
            "targetPVC": transfer.pvc
        }
    })
}

/// The PVC filled by the XCOPY populator.
pub fn populator_pvc(transfer: &DiskTransfer) -> Result<PersistentVolumeClaim> {
    let mut spec = storage_request(transfer);
    spec["dataSourceRef"] = json!({
        "apiGroup": POPULATOR_GROUP,
        "kind": POPULATOR_KIND,
        "name": transfer.name
    });
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": transfer.pvc,
            "namespace": transfer.namespace,
            "labels": transfer.labels
        },
        "spec": spec
    }))?)
}

/// The CDI DataVolume importing a disk over VDDK.
pub fn data_volume_manifest(transfer: &DiskTransfer) -> Value {
    let mut spec = json!({
        "source": {
            "vddk": {
                "backingFile": transfer.source_path,
                "url": transfer.source_url,
                "uuid": transfer.vm_id,
                "secretRef": transfer.source_secret
            }
        },
        "storage": storage_request(transfer)
    });
    if !transfer.checkpoints.is_empty() {
        spec["checkpoints"] = json!(transfer.checkpoints);
        spec["finalCheckpoint"] = json!(transfer.final_checkpoint);
    }
    json!({
        "metadata": {"labels": transfer.labels},
        "spec": spec
    })
}

/// Read a `{completed,total}` pair or a `"45.5%"` string.
fn parse_progress(value: Option<&Value>) -> (i64, i64) {
    match value {
        Some(Value::Object(map)) => {
            let completed = map.get("completed").and_then(Value::as_i64).unwrap_or(0);
            let total = map.get("total").and_then(Value::as_i64).unwrap_or(0);
            (completed, total)
        }
        Some(Value::String(s)) => {
            let percent = s.trim().trim_end_matches('%').parse::<f64>().unwrap_or(0.0);
            (percent.floor() as i64, 100)
        }
        _ => (0, 0),
    }
}

/// Transfer status from a populator or DataVolume body.
pub fn parse_transfer_status(kind: TransferKind, data: &Value) -> TransferStatus {
    let status = data.get("status");
    let phase_text = status
        .and_then(|s| s.get("phase"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let phase = match (kind, phase_text) {
        (_, "Succeeded") => TransferPhase::Succeeded,
        (_, "Failed") => TransferPhase::Failed,
        (TransferKind::DataVolume, "Paused") => TransferPhase::Paused,
        (_, "" | "Pending" | "PendingPopulation" | "WaitForFirstConsumer" | "ImportScheduled") => {
            TransferPhase::Pending
        }
        _ => TransferPhase::Running,
    };
    let (completed, total) = parse_progress(status.and_then(|s| s.get("progress")));
    let pvc = status
        .and_then(|s| s.get("pvc").or_else(|| s.get("claimName")))
        .and_then(Value::as_str)
        .map(str::to_string);
    TransferStatus {
        phase,
        pvc,
        completed,
        total,
    }
}

/// The KubeVirt VirtualMachine body, created halted.
pub fn vm_manifest(vm: &TargetVm) -> Value {
    let bootloader = if vm.firmware == "efi" {
        json!({"efi": {}})
    } else {
        json!({"bios": {}})
    };
    let disks: Vec<Value> = vm
        .pvcs
        .iter()
        .enumerate()
        .map(|(i, _)| json!({"name": format!("disk-{}", i), "disk": {"bus": VIRTIO}, "bootOrder": i + 1}))
        .collect();
    let volumes: Vec<Value> = vm
        .pvcs
        .iter()
        .enumerate()
        .map(|(i, pvc)| json!({"name": format!("disk-{}", i), "persistentVolumeClaim": {"claimName": pvc}}))
        .collect();

    let mut interfaces = Vec::new();
    let mut networks = Vec::new();
    for nic in &vm.networks {
        let mut interface = json!({"name": nic.name, "model": VIRTIO});
        if let Some(mac) = &nic.mac {
            interface["macAddress"] = json!(mac);
        }
        match (nic.network_type.as_str(), &nic.attachment) {
            ("multus", Some(attachment)) => {
                interface["bridge"] = json!({});
                networks.push(json!({"name": nic.name, "multus": {"networkName": attachment}}));
            }
            _ => {
                interface["masquerade"] = json!({});
                networks.push(json!({"name": nic.name, "pod": {}}));
            }
        }
        interfaces.push(interface);
    }

    json!({
        "metadata": {"labels": vm.labels},
        "spec": {
            "runStrategy": "Halted",
            "template": {
                "metadata": {"labels": vm.labels},
                "spec": {
                    "domain": {
                        "cpu": {"cores": vm.cpus.max(1)},
                        "memory": {"guest": format!("{}Mi", vm.memory_mb)},
                        "firmware": {"bootloader": bootloader},
                        "devices": {"disks": disks, "interfaces": interfaces}
                    },
                    "networks": networks,
                    "volumes": volumes
                }
            }
        }
    })
}

// =============================================================================
// Client
// =============================================================================

/// Destination client backed by a kube `Client`
#[derive(Clone)]
pub struct KubeDestination {
    client: Client,
}

impl KubeDestination {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, namespace: &str, ar: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }

    fn transfer_api(&self, transfer: &DiskTransfer) -> (Api<DynamicObject>, ApiResource) {
        let ar = match transfer.kind {
            TransferKind::Xcopy => populator(),
            TransferKind::DataVolume => data_volume(),
        };
        (self.dynamic(&transfer.namespace, &ar), ar)
    }
}

#[async_trait]
impl DestinationClient for KubeDestination {
    async fn network_attachment_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api = self.dynamic(namespace, &network_attachment());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn ensure_transfer(&self, transfer: &DiskTransfer) -> Result<()> {
        let (api, ar) = self.transfer_api(transfer);
        let body = match transfer.kind {
            TransferKind::Xcopy => populator_manifest(transfer),
            TransferKind::DataVolume => data_volume_manifest(transfer),
        };

        match api.get_opt(&transfer.name).await? {
            None => {
                let mut obj = DynamicObject::new(&transfer.name, &ar)
                    .within(&transfer.namespace)
                    .data(json!({"spec": body["spec"]}));
                obj.metadata.labels = Some(transfer.labels.clone());
                info!(transfer = %transfer.name, pvc = %transfer.pvc, kind = ?transfer.kind, "Creating disk transfer");
                created(api.create(&PostParams::default(), &obj).await)?;
            }
            Some(existing) if transfer.kind == TransferKind::DataVolume => {
                let current = existing.data.pointer("/spec/checkpoints").cloned().unwrap_or(Value::Null);
                let wanted = body.pointer("/spec/checkpoints").cloned().unwrap_or(Value::Null);
                let final_now = existing.data.pointer("/spec/finalCheckpoint").and_then(Value::as_bool);
                let changed = !wanted.is_null() && (current != wanted || final_now != Some(transfer.final_checkpoint));
                if changed {
                    debug!(transfer = %transfer.name, final_checkpoint = transfer.final_checkpoint, "Updating checkpoints");
                    let patch = json!({"spec": {"checkpoints": wanted, "finalCheckpoint": transfer.final_checkpoint}});
                    api.patch(&transfer.name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                }
            }
            Some(_) => {}
        }

        if transfer.kind == TransferKind::Xcopy {
            let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &transfer.namespace);
            if pvcs.get_opt(&transfer.pvc).await?.is_none() {
                created(pvcs.create(&PostParams::default(), &populator_pvc(transfer)?).await)?;
            }
        }
        Ok(())
    }

    async fn transfer_status(&self, transfer: &DiskTransfer) -> Result<Option<TransferStatus>> {
        let (api, _) = self.transfer_api(transfer);
        Ok(api
            .get_opt(&transfer.name)
            .await?
            .map(|obj| parse_transfer_status(transfer.kind, &obj.data)))
    }

    async fn delete_transfer(&self, transfer: &DiskTransfer) -> Result<()> {
        let (api, _) = self.transfer_api(transfer);
        deleted(api.delete(&transfer.name, &DeleteParams::default()).await)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        deleted(pvcs.delete(name, &DeleteParams::default()).await)
    }

    async fn create_vm(&self, vm: &TargetVm) -> Result<()> {
        let ar = virtual_machine();
        let body = vm_manifest(vm);
        let mut obj = DynamicObject::new(&vm.name, &ar)
            .within(&vm.namespace)
            .data(json!({"spec": body["spec"]}));
        obj.metadata.labels = Some(vm.labels.clone());
        info!(vm = %vm.name, namespace = %vm.namespace, disks = vm.pvcs.len(), "Creating target VM");
        created(self.dynamic(&vm.namespace, &ar).create(&PostParams::default(), &obj).await)
    }

    async fn start_vm(&self, namespace: &str, name: &str) -> Result<()> {
        let patch = json!({"spec": {"runStrategy": "Always"}});
        self.dynamic(namespace, &virtual_machine())
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn vm_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        let vm = self
            .dynamic(namespace, &virtual_machine())
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("VirtualMachine", format!("{}/{}", namespace, name)))?;
        Ok(vm.data.pointer("/status/ready").and_then(Value::as_bool).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Checkpoint, TargetNetwork};
    use std::collections::BTreeMap;

    fn transfer(kind: TransferKind) -> DiskTransfer {
        DiskTransfer {
            kind,
            name: "plan-1-v1-disk-0".into(),
            namespace: "target".into(),
            pvc: "v1-disk-0".into(),
            storage_class: "ceph-rbd".into(),
            access_mode: Some("ReadWriteOnce".into()),
            volume_mode: None,
            capacity_bytes: 1024,
            vm_id: "vm-1".into(),
            source_path: "[ds1] v1/v1.vmdk".into(),
            xcopy: Some(("xcopy-secret".into(), "ontap".into())),
            source_url: "https://vc/sdk".into(),
            source_secret: "vsphere-secret".into(),
            labels: BTreeMap::from([("plan".to_string(), "plan-1".to_string())]),
            checkpoints: Vec::new(),
            final_checkpoint: false,
        }
    }

    #[test]
    fn test_populator_pvc_references_populator() {
        let pvc = populator_pvc(&transfer(TransferKind::Xcopy)).unwrap();
        assert_eq!(pvc.metadata.name.as_deref(), Some("v1-disk-0"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("ceph-rbd"));
        let source = spec.data_source_ref.unwrap();
        assert_eq!(source.kind, POPULATOR_KIND);
        assert_eq!(source.name, "plan-1-v1-disk-0");
    }

    #[test]
    fn test_data_volume_checkpoints() {
        let mut t = transfer(TransferKind::DataVolume);
        let body = data_volume_manifest(&t);
        assert!(body["spec"].get("checkpoints").is_none());
        assert_eq!(body["spec"]["source"]["vddk"]["backingFile"], "[ds1] v1/v1.vmdk");

        t.checkpoints = vec![Checkpoint {
            previous: String::new(),
            current: "snapshot-1".into(),
        }];
        t.final_checkpoint = true;
        let body = data_volume_manifest(&t);
        assert_eq!(body["spec"]["checkpoints"][0]["current"], "snapshot-1");
        assert_eq!(body["spec"]["finalCheckpoint"], true);
    }

    #[test]
    fn test_parse_status() {
        let populator = json!({"status": {"phase": "Running", "pvc": "v1-disk-0", "progress": {"completed": 40, "total": 100}}});
        let status = parse_transfer_status(TransferKind::Xcopy, &populator);
        assert_eq!(status.phase, TransferPhase::Running);
        assert_eq!(status.pvc.as_deref(), Some("v1-disk-0"));
        assert_eq!((status.completed, status.total), (40, 100));

        let dv = json!({"status": {"phase": "ImportInProgress", "progress": "45.7%"}});
        let status = parse_transfer_status(TransferKind::DataVolume, &dv);
        assert_eq!(status.phase, TransferPhase::Running);
        assert_eq!((status.completed, status.total), (45, 100));

        let dv = json!({"status": {"phase": "Paused"}});
        assert_eq!(parse_transfer_status(TransferKind::DataVolume, &dv).phase, TransferPhase::Paused);
        assert_eq!(parse_transfer_status(TransferKind::Xcopy, &json!({})).phase, TransferPhase::Pending);
        assert_eq!(
            parse_transfer_status(TransferKind::Xcopy, &json!({"status": {"phase": "Failed"}})).phase,
            TransferPhase::Failed
        );
    }

    #[test]
    fn test_vm_manifest() {
        let vm = TargetVm {
            name: "v1".into(),
            namespace: "target".into(),
            cpus: 2,
            memory_mb: 4096,
            firmware: "efi".into(),
            pvcs: vec!["v1-disk-0".into(), "v1-disk-1".into()],
            networks: vec![
                TargetNetwork {
                    name: "net-0".into(),
                    network_type: "pod".into(),
                    attachment: None,
                    mac: Some("00:50:56:aa:bb:cc".into()),
                },
                TargetNetwork {
                    name: "net-1".into(),
                    network_type: "multus".into(),
                    attachment: Some("net-ns/vlan-10".into()),
                    mac: None,
                },
            ],
            labels: BTreeMap::new(),
        };
        let body = vm_manifest(&vm);
        let spec = &body["spec"]["template"]["spec"];
        assert_eq!(body["spec"]["runStrategy"], "Halted");
        assert_eq!(spec["domain"]["memory"]["guest"], "4096Mi");
        assert!(spec["domain"]["firmware"]["bootloader"].get("efi").is_some());
        assert_eq!(spec["volumes"][1]["persistentVolumeClaim"]["claimName"], "v1-disk-1");
        assert_eq!(spec["domain"]["devices"]["disks"][0]["bootOrder"], 1);
        assert_eq!(spec["networks"][0], json!({"name": "net-0", "pod": {}}));
        assert_eq!(spec["networks"][1]["multus"]["networkName"], "net-ns/vlan-10");
        assert_eq!(spec["domain"]["devices"]["interfaces"][0]["macAddress"], "00:50:56:aa:bb:cc");
    }
}
