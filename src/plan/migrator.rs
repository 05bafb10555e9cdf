//! Per-VM migrator
//!
//! Walks one VM through its itinerary. Each call to [`Migrator::run`]
//! advances as far as it can without blocking and returns when the VM has
//! to wait on an external transfer, a boot, or a precopy interval. All
//! state lives on the `VmStatus`, so a restarted controller picks up where
//! the last pass stopped.

use crate::crd::{
    condition::{CANCELED, FAILED, SUCCEEDED},
    Category, Condition, NetworkMapSpec, Plan, PlanVm, Precopy, Progress, Provider, ProviderType, StepError, StepPhase,
    StorageMapSpec, VmStatus, WarmStatus,
};
use crate::domain::ports::{
    Checkpoint, DestinationClient, DiskTransfer, SourceControl, TargetNetwork, TargetVm, TransferKind,
    TransferPhase,
};
use crate::error::{Error, Result};
use crate::inventory::model::vsphere::Vm;
use crate::inventory::store::Store;
use crate::retry::{is_fatal, retry_transient, RetryConfig};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::itinerary::{Deadlines, Itinerary, Phase};
use super::pipeline;

/// Message of a failed phase deadline
pub const TIMED_OUT: &str = "timed out";

/// Label keys stamped on destination objects
pub const LABEL_PLAN: &str = "plan";
pub const LABEL_MIGRATION: &str = "migration";
pub const LABEL_VM_ID: &str = "vmID";

/// Step annotation recording that the target VM was started
const ANNOTATION_STARTED: &str = "started";

const MIB: i64 = 1024 * 1024;

/// Everything a migrator needs about the migration it belongs to
pub struct MigrationContext {
    pub plan: Plan,
    pub migration: String,
    pub source: Provider,
    pub storage_map: StorageMapSpec,
    pub network_map: NetworkMapSpec,
    /// Source inventory
    pub inventory: Store,
    pub source_control: Arc<dyn SourceControl>,
    pub destination: Arc<dyn DestinationClient>,
    pub deadlines: Deadlines,
    pub precopy_interval: Duration,
    /// Warm cutover time
    pub cutover: Option<DateTime<Utc>>,
    pub retry: RetryConfig,
}

/// Result of executing one phase
#[derive(Debug, Clone, PartialEq, Eq)]
enum Flow {
    /// Phase done, move on
    Next,
    /// Waiting on something external
    Wait,
    /// Terminal failure with a user-facing reason
    Fail(String),
}

/// Drives VMs of one migration
#[derive(Clone)]
pub struct Migrator {
    ctx: Arc<MigrationContext>,
    itinerary: Itinerary,
}

impl Migrator {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        let itinerary = Itinerary::new(ctx.plan.is_warm());
        Self { ctx, itinerary }
    }

    pub fn context(&self) -> &MigrationContext {
        &self.ctx
    }

    fn phase(vm: &VmStatus) -> Phase {
        vm.phase.parse().unwrap_or(Phase::Started)
    }

    fn enter(vm: &mut VmStatus, phase: Phase) {
        debug!(vm = %vm.id, phase = %phase, "Entering phase");
        vm.phase = phase.to_string();
        vm.phase_started = Some(Utc::now());
    }

    /// Advance the VM as far as possible.
    pub async fn run(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<()> {
        if vm.is_completed() {
            return Ok(());
        }
        if vm.pipeline.is_empty() {
            vm.pipeline = pipeline::build(self.itinerary.warm);
            vm.started = Some(Utc::now());
            Self::enter(vm, Phase::Started);
            info!(vm = %vm.id, plan = %self.ctx.plan.name(), "VM migration started");
        }

        loop {
            let phase = Self::phase(vm);
            if phase.is_terminal() {
                return Ok(());
            }
            if self.deadline_passed(vm, phase) {
                warn!(vm = %vm.id, phase = %phase, "Phase deadline passed");
                self.fail(plan_vm, vm, TIMED_OUT).await;
                return Ok(());
            }

            let flow = match self.execute(phase, plan_vm, vm).await {
                Ok(flow) => flow,
                Err(e) if is_fatal(&e) => Flow::Fail(e.to_string()),
                Err(e) => {
                    warn!(vm = %vm.id, phase = %phase, error = %e, "Phase failed, will retry");
                    return Err(e);
                }
            };

            match flow {
                Flow::Wait => return Ok(()),
                Flow::Fail(reason) => {
                    self.fail(plan_vm, vm, &reason).await;
                    return Ok(());
                }
                Flow::Next => match self.itinerary.next(phase) {
                    Some(Phase::Succeeded) | None => {
                        self.succeed(plan_vm, vm).await;
                        return Ok(());
                    }
                    Some(next) => Self::enter(vm, next),
                },
            }
        }
    }

    fn deadline_passed(&self, vm: &VmStatus, phase: Phase) -> bool {
        let (Some(deadline), Some(started)) = (self.ctx.deadlines.for_phase(phase), vm.phase_started) else {
            return false;
        };
        let elapsed = Utc::now().signed_duration_since(started);
        elapsed.to_std().map(|e| e > deadline).unwrap_or(false)
    }

    async fn execute(&self, phase: Phase, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<Flow> {
        if let Some(step) = phase.step().and_then(|name| vm.find_step_mut(name)) {
            pipeline::start(step);
        }
        match phase {
            Phase::Started => Ok(Flow::Next),
            Phase::Validated => self.validate(plan_vm, vm),
            Phase::PowerOffSource => {
                retry_transient(&self.ctx.retry, "power off", || self.ctx.source_control.power_off(&vm.id)).await?;
                self.complete_step(vm, pipeline::INITIALIZE);
                Ok(Flow::Next)
            }
            Phase::CopyDisks => self.copy_disks(plan_vm, vm).await,
            Phase::Precopy => self.precopy(plan_vm, vm).await,
            Phase::Cutover => self.cutover(plan_vm, vm).await,
            Phase::CreateTargetVM => {
                let target = self.target_vm(plan_vm, &self.source_vm(vm)?)?;
                retry_transient(&self.ctx.retry, "create vm", || self.ctx.destination.create_vm(&target)).await?;
                self.complete_step(vm, pipeline::CREATE_TARGET_VM);
                Ok(Flow::Next)
            }
            Phase::PowerOn => self.power_on(plan_vm, vm).await,
            Phase::Succeeded | Phase::Failed | Phase::Canceled => Ok(Flow::Wait),
        }
    }

    fn complete_step(&self, vm: &mut VmStatus, name: &str) {
        if let Some(step) = vm.find_step_mut(name) {
            pipeline::complete(step);
        }
    }

    // =========================================================================
    // Phases
    // =========================================================================

    fn source_vm(&self, vm: &VmStatus) -> Result<Vm> {
        self.ctx.inventory.find::<Vm>(&vm.id)
    }

    fn validate(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<Flow> {
        if self.ctx.source.provider_type() != Some(ProviderType::VSphere) {
            let kind = self.ctx.source.provider_type().map(|t| t.to_string()).unwrap_or_default();
            return Ok(Flow::Fail(format!("unsupported source provider type '{}'", kind)));
        }
        let source = match self.source_vm(vm) {
            Ok(source) => source,
            Err(e) if e.is_not_found() => {
                return Ok(Flow::Fail(format!("VM {} not found in the source inventory", vm.id)))
            }
            Err(e) => return Err(e),
        };
        if vm.name.is_empty() {
            vm.name = source.base.name.clone();
        }
        if let Err(e) = self.transfers(plan_vm, vm, &source, false) {
            return Ok(Flow::Fail(e.to_string()));
        }
        if let Err(e) = self.networks(&source) {
            return Ok(Flow::Fail(e.to_string()));
        }
        if self.itinerary.warm {
            self.complete_step(vm, pipeline::INITIALIZE);
        }
        Ok(Flow::Next)
    }

    async fn copy_disks(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<Flow> {
        let source = self.source_vm(vm)?;
        if self.itinerary.warm && vm.warm.as_ref().map(|w| w.precopies.is_empty()).unwrap_or(true) {
            self.snapshot(vm).await?;
        }
        let transfers = self.transfers(plan_vm, vm, &source, false)?;
        self.ensure(&transfers).await?;

        let done: &[TransferPhase] = if self.itinerary.warm {
            &[TransferPhase::Paused, TransferPhase::Succeeded]
        } else {
            &[TransferPhase::Succeeded]
        };
        match self.poll(vm, &transfers, done).await? {
            Flow::Next if self.itinerary.warm => {
                self.precopy_done(vm).await;
                Ok(Flow::Next)
            }
            Flow::Next => {
                self.complete_step(vm, pipeline::DISK_TRANSFER);
                Ok(Flow::Next)
            }
            other => Ok(other),
        }
    }

    async fn precopy(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<Flow> {
        let source = self.source_vm(vm)?;
        let in_flight = vm
            .warm
            .as_ref()
            .and_then(|w| w.precopies.last())
            .map(|p| p.end.is_none())
            .unwrap_or(false);
        if in_flight {
            let transfers = self.transfers(plan_vm, vm, &source, false)?;
            match self.poll(vm, &transfers, &[TransferPhase::Paused, TransferPhase::Succeeded]).await? {
                Flow::Next => self.precopy_done(vm).await,
                other => return Ok(other),
            }
        }

        let now = Utc::now();
        if self.ctx.cutover.map(|at| now >= at).unwrap_or(false) {
            info!(vm = %vm.id, "Cutover time reached");
            return Ok(Flow::Next);
        }

        let due = vm
            .warm
            .as_ref()
            .and_then(|w| w.next_precopy_at)
            .map(|at| now >= at)
            .unwrap_or(true);
        if due {
            self.snapshot(vm).await?;
            let transfers = self.transfers(plan_vm, vm, &source, false)?;
            self.ensure(&transfers).await?;
        }
        Ok(Flow::Wait)
    }

    async fn cutover(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<Flow> {
        let source = self.source_vm(vm)?;
        let final_taken = vm
            .find_step(pipeline::CUTOVER)
            .map(|s| s.annotations.contains_key("snapshot"))
            .unwrap_or(false);
        if !final_taken {
            retry_transient(&self.ctx.retry, "power off", || self.ctx.source_control.power_off(&vm.id)).await?;
            let snapshot = self.snapshot(vm).await?;
            if let Some(step) = vm.find_step_mut(pipeline::CUTOVER) {
                step.annotations.insert("snapshot".into(), snapshot);
            }
        }

        let transfers = self.transfers(plan_vm, vm, &source, true)?;
        self.ensure(&transfers).await?;
        match self.poll(vm, &transfers, &[TransferPhase::Succeeded]).await? {
            Flow::Next => {
                self.precopy_done(vm).await;
                self.complete_step(vm, pipeline::DISK_TRANSFER);
                self.complete_step(vm, pipeline::CUTOVER);
                Ok(Flow::Next)
            }
            other => Ok(other),
        }
    }

    async fn power_on(&self, plan_vm: &PlanVm, vm: &mut VmStatus) -> Result<Flow> {
        let name = self.target_name(plan_vm, vm);
        let namespace = self.ctx.plan.spec.target_namespace.clone();
        let started = vm
            .find_step(pipeline::POWER_ON)
            .map(|s| s.annotations.contains_key(ANNOTATION_STARTED))
            .unwrap_or(false);
        if !started {
            retry_transient(&self.ctx.retry, "start vm", || self.ctx.destination.start_vm(&namespace, &name)).await?;
            if let Some(step) = vm.find_step_mut(pipeline::POWER_ON) {
                step.annotations.insert(ANNOTATION_STARTED.into(), Utc::now().to_rfc3339());
            }
        }
        if self.ctx.destination.vm_ready(&namespace, &name).await? {
            self.complete_step(vm, pipeline::POWER_ON);
            Ok(Flow::Next)
        } else {
            Ok(Flow::Wait)
        }
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    async fn ensure(&self, transfers: &[DiskTransfer]) -> Result<()> {
        for transfer in transfers {
            retry_transient(&self.ctx.retry, "ensure transfer", || self.ctx.destination.ensure_transfer(transfer))
                .await?;
        }
        Ok(())
    }

    /// Record transfer progress; `Next` once every transfer is in `done`.
    async fn poll(&self, vm: &mut VmStatus, transfers: &[DiskTransfer], done: &[TransferPhase]) -> Result<Flow> {
        let mut finished = 0;
        for transfer in transfers {
            let status = match self.ctx.destination.transfer_status(transfer).await? {
                Some(status) => status,
                None => {
                    debug!(transfer = %transfer.name, "Transfer missing, recreating");
                    self.ctx.destination.ensure_transfer(transfer).await?;
                    continue;
                }
            };
            if status.phase == TransferPhase::Failed {
                let pvc = status.pvc.as_deref().unwrap_or(&transfer.pvc);
                return Ok(Flow::Fail(format!("populator pod failed for PVC {}", pvc)));
            }

            let total = (transfer.capacity_bytes / MIB).max(1);
            let completed = if done.contains(&status.phase) {
                total
            } else if status.total > 0 {
                total * status.completed.clamp(0, status.total) / status.total
            } else {
                0
            };
            if let Some(step) = vm.find_step_mut(pipeline::DISK_TRANSFER) {
                let task = pipeline::task(step, &transfer.pvc);
                if task.started.is_none() {
                    task.started = Some(Utc::now());
                    task.phase = StepPhase::Running;
                }
                task.progress = pipeline::advance(task.progress, Progress { completed, total });
                pipeline::sum_tasks(step);
            }
            if done.contains(&status.phase) {
                finished += 1;
            }
        }
        Ok(if finished == transfers.len() { Flow::Next } else { Flow::Wait })
    }

    fn target_name(&self, plan_vm: &PlanVm, vm: &VmStatus) -> String {
        let name = plan_vm
            .target_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| if vm.name.is_empty() { vm.id.clone() } else { vm.name.clone() });
        dns_label(&name)
    }

    fn labels(&self, vm: &VmStatus) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_PLAN.to_string(), self.ctx.plan.name().to_string()),
            (LABEL_MIGRATION.to_string(), self.ctx.migration.clone()),
            (LABEL_VM_ID.to_string(), vm.id.clone()),
        ])
    }

    fn checkpoints(vm: &VmStatus) -> Vec<Checkpoint> {
        let precopies = vm.warm.as_ref().map(|w| w.precopies.as_slice()).unwrap_or_default();
        precopies
            .iter()
            .enumerate()
            .map(|(i, p)| Checkpoint {
                previous: if i == 0 { String::new() } else { precopies[i - 1].snapshot.clone() },
                current: p.snapshot.clone(),
            })
            .collect()
    }

    /// One transfer per disk, in device order.
    fn transfers(&self, plan_vm: &PlanVm, vm: &VmStatus, source: &Vm, final_checkpoint: bool) -> Result<Vec<DiskTransfer>> {
        let target = self.target_name(plan_vm, vm);
        let checkpoints = Self::checkpoints(vm);
        source
            .disks()
            .into_iter()
            .enumerate()
            .map(|(index, disk)| {
                let pair = self.ctx.storage_map.find(&disk.datastore.id).ok_or_else(|| {
                    Error::InvariantViolation(format!("datastore {} of disk {} is not mapped", disk.datastore.id, disk.file))
                })?;
                let xcopy = pair
                    .offload_plugin
                    .as_ref()
                    .and_then(|o| o.vsphere_xcopy_config.as_ref())
                    .filter(|_| !self.itinerary.warm)
                    .map(|c| (c.secret_ref.clone(), c.storage_vendor_product.clone()));
                let pvc = format!("{}-disk-{}", target, index);
                let (kind, name) = match xcopy {
                    Some(_) => (TransferKind::Xcopy, format!("{}-{}", self.ctx.plan.name(), pvc)),
                    None => (TransferKind::DataVolume, pvc.clone()),
                };
                Ok(DiskTransfer {
                    kind,
                    name,
                    namespace: self.ctx.plan.spec.target_namespace.clone(),
                    pvc,
                    storage_class: pair.destination.storage_class.clone(),
                    access_mode: pair.destination.access_mode.clone(),
                    volume_mode: pair.destination.volume_mode.clone(),
                    capacity_bytes: disk.capacity_bytes,
                    vm_id: vm.id.clone(),
                    source_path: disk.file,
                    xcopy,
                    source_url: self.ctx.source.spec.url.clone(),
                    source_secret: self.ctx.source.spec.secret.name.clone(),
                    labels: self.labels(vm),
                    checkpoints: checkpoints.clone(),
                    final_checkpoint,
                })
            })
            .collect()
    }

    fn networks(&self, source: &Vm) -> Result<Vec<TargetNetwork>> {
        let mut networks = Vec::new();
        for (index, nic) in source.nics().into_iter().enumerate() {
            let pair = self.ctx.network_map.find(&nic.network.id).ok_or_else(|| {
                Error::InvariantViolation(format!("network {} of NIC {} is not mapped", nic.network.id, nic.mac))
            })?;
            let destination = &pair.destination;
            let attachment = match destination.network_type.as_str() {
                "ignored" => continue,
                "multus" => Some(format!(
                    "{}/{}",
                    destination.namespace.as_deref().unwrap_or(&self.ctx.plan.spec.target_namespace),
                    destination.name.as_deref().unwrap_or_default()
                )),
                _ => None,
            };
            networks.push(TargetNetwork {
                name: format!("net-{}", index),
                network_type: destination.network_type.clone(),
                attachment,
                mac: Some(nic.mac),
            });
        }
        Ok(networks)
    }

    fn target_vm(&self, plan_vm: &PlanVm, source: &Vm) -> Result<TargetVm> {
        let status = VmStatus::new(source.base.id.clone(), source.base.name.clone());
        let pvcs = self
            .transfers(plan_vm, &status, source, false)?
            .into_iter()
            .map(|t| t.pvc)
            .collect();
        Ok(TargetVm {
            name: self.target_name(plan_vm, &status),
            namespace: self.ctx.plan.spec.target_namespace.clone(),
            cpus: source.cpus(),
            memory_mb: source.memory_mb(),
            firmware: source.firmware(),
            pvcs,
            networks: self.networks(source)?,
            labels: self.labels(&status),
        })
    }

    // =========================================================================
    // Warm bookkeeping
    // =========================================================================

    async fn snapshot(&self, vm: &mut VmStatus) -> Result<String> {
        let snapshot =
            retry_transient(&self.ctx.retry, "create snapshot", || self.ctx.source_control.create_snapshot(&vm.id))
                .await?;
        let warm = vm.warm.get_or_insert_with(WarmStatus::default);
        warm.precopies.push(Precopy {
            start: Some(Utc::now()),
            end: None,
            snapshot: snapshot.clone(),
        });
        debug!(vm = %vm.id, snapshot = %snapshot, precopies = warm.precopies.len(), "Precopy started");
        Ok(snapshot)
    }

    /// Close the running precopy, drop the snapshot before it and schedule
    /// the next one.
    async fn precopy_done(&self, vm: &mut VmStatus) {
        let interval = chrono::Duration::from_std(self.ctx.precopy_interval).unwrap_or_else(|_| chrono::Duration::hours(1));
        let Some(warm) = vm.warm.as_mut() else {
            return;
        };
        let count = warm.precopies.len();
        let Some(last) = warm.precopies.last_mut() else {
            return;
        };
        if last.end.is_some() {
            return;
        }
        last.end = Some(Utc::now());
        warm.successes += 1;
        warm.consecutive_failures = 0;
        warm.next_precopy_at = Some(Utc::now() + interval);
        let stale = (count >= 2).then(|| warm.precopies[count - 2].snapshot.clone());

        if let Some(snapshot) = stale {
            if let Err(e) = self.ctx.source_control.remove_snapshot(&vm.id, &snapshot).await {
                warn!(vm = %vm.id, snapshot = %snapshot, error = %e, "Failed to remove snapshot");
            }
        }
    }

    // =========================================================================
    // Terminal states
    // =========================================================================

    async fn succeed(&self, plan_vm: &PlanVm, vm: &mut VmStatus) {
        Self::enter(vm, Phase::Succeeded);
        vm.completed = Some(Utc::now());
        vm.conditions.set(Condition::new(SUCCEEDED, Category::Advisory, "The VM migration has SUCCEEDED."));
        info!(vm = %vm.id, "VM migration succeeded");
        self.cleanup(plan_vm, vm, false).await;
    }

    /// Mark the VM failed at its current phase. Sibling VMs are unaffected.
    pub async fn fail(&self, plan_vm: &PlanVm, vm: &mut VmStatus, reason: &str) {
        let phase = Self::phase(vm);
        let step = phase.step().unwrap_or(pipeline::INITIALIZE);
        if let Some(step) = vm.find_step_mut(step) {
            pipeline::fail(step, reason);
        }
        vm.error = Some(StepError {
            phase: phase.to_string(),
            reasons: vec![reason.to_string()],
        });
        vm.conditions.set(Condition::new(FAILED, Category::Error, reason));
        Self::enter(vm, Phase::Failed);
        vm.completed = Some(Utc::now());
        warn!(vm = %vm.id, phase = %phase, reason, "VM migration failed");
        self.cleanup(plan_vm, vm, true).await;
    }

    /// Cancel an in-flight VM and release its destination resources.
    pub async fn cancel(&self, plan_vm: &PlanVm, vm: &mut VmStatus) {
        if vm.is_completed() {
            return;
        }
        for step in vm.pipeline.iter_mut() {
            pipeline::cancel(step);
        }
        vm.conditions.set(Condition::new(CANCELED, Category::Advisory, "The VM migration was canceled."));
        Self::enter(vm, Phase::Canceled);
        vm.completed = Some(Utc::now());
        info!(vm = %vm.id, "VM migration canceled");
        self.cleanup(plan_vm, vm, true).await;
    }

    /// Delete transfer objects, and PVCs when the VM did not succeed.
    /// Archived plans keep everything.
    async fn cleanup(&self, plan_vm: &PlanVm, vm: &VmStatus, delete_pvcs: bool) {
        if self.ctx.plan.spec.archived {
            return;
        }
        if let Some(snapshot) = vm.warm.as_ref().and_then(|w| w.precopies.last()).map(|p| p.snapshot.clone()) {
            if let Err(e) = self.ctx.source_control.remove_snapshot(&vm.id, &snapshot).await {
                warn!(vm = %vm.id, snapshot = %snapshot, error = %e, "Failed to remove snapshot");
            }
        }
        let Ok(source) = self.source_vm(vm) else {
            return;
        };
        let Ok(transfers) = self.transfers(plan_vm, vm, &source, false) else {
            return;
        };
        for transfer in &transfers {
            if let Err(e) = self.ctx.destination.delete_transfer(transfer).await {
                warn!(transfer = %transfer.name, error = %e, "Failed to delete transfer");
            }
            if delete_pvcs {
                if let Err(e) = self.ctx.destination.delete_pvc(&transfer.namespace, &transfer.pvc).await {
                    warn!(pvc = %transfer.pvc, error = %e, "Failed to delete PVC");
                }
            }
        }
    }
}

/// Lowercase RFC 1123 label.
pub fn dns_label(name: &str) -> String {
    let mut out: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    out.truncate(63);
    out.trim_matches('-').to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::MigrationType;
    use crate::domain::ports::TransferStatus;
    use crate::inventory::model::vsphere::{VM_CPUS, VM_DEVICES, VM_MEMORY_MB};
    use crate::inventory::model::Model;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SourceControl for FakeSource {
        async fn power_off(&self, vm_id: &str) -> Result<()> {
            self.calls.lock().push(format!("power_off {}", vm_id));
            Ok(())
        }

        async fn create_snapshot(&self, vm_id: &str) -> Result<String> {
            let mut calls = self.calls.lock();
            calls.push(format!("snapshot {}", vm_id));
            Ok(format!("snapshot-{}", calls.len()))
        }

        async fn remove_snapshot(&self, _vm_id: &str, snapshot_id: &str) -> Result<()> {
            self.calls.lock().push(format!("remove {}", snapshot_id));
            Ok(())
        }
    }

    /// Destination whose transfer phases are scripted per PVC
    #[derive(Default)]
    pub(crate) struct FakeCluster {
        pub phases: Mutex<HashMap<String, TransferPhase>>,
        pub transfers: Mutex<HashMap<String, DiskTransfer>>,
        pub deleted: Mutex<Vec<String>>,
        pub vms: Mutex<Vec<TargetVm>>,
        pub ready: Mutex<bool>,
    }

    impl FakeCluster {
        pub fn set(&self, pvc: &str, phase: TransferPhase) {
            self.phases.lock().insert(pvc.to_string(), phase);
        }
    }

    #[async_trait]
    impl DestinationClient for FakeCluster {
        async fn network_attachment_exists(&self, _namespace: &str, _name: &str) -> Result<bool> {
            Ok(true)
        }

        async fn ensure_transfer(&self, transfer: &DiskTransfer) -> Result<()> {
            self.transfers.lock().insert(transfer.pvc.clone(), transfer.clone());
            Ok(())
        }

        async fn transfer_status(&self, transfer: &DiskTransfer) -> Result<Option<TransferStatus>> {
            if !self.transfers.lock().contains_key(&transfer.pvc) {
                return Ok(None);
            }
            let phase = self.phases.lock().get(&transfer.pvc).copied().unwrap_or(TransferPhase::Running);
            Ok(Some(TransferStatus {
                phase,
                pvc: Some(transfer.pvc.clone()),
                completed: 50,
                total: 100,
            }))
        }

        async fn delete_transfer(&self, transfer: &DiskTransfer) -> Result<()> {
            self.transfers.lock().remove(&transfer.pvc);
            self.deleted.lock().push(format!("transfer {}", transfer.name));
            Ok(())
        }

        async fn delete_pvc(&self, _namespace: &str, name: &str) -> Result<()> {
            self.deleted.lock().push(format!("pvc {}", name));
            Ok(())
        }

        async fn create_vm(&self, vm: &TargetVm) -> Result<()> {
            self.vms.lock().push(vm.clone());
            Ok(())
        }

        async fn start_vm(&self, _namespace: &str, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn vm_ready(&self, _namespace: &str, _name: &str) -> Result<bool> {
            Ok(*self.ready.lock())
        }
    }

    /// Inventory holding VMs `vm-1` (`v1`) and `vm-2` (`v2`), one disk on
    /// `datastore-1` and one NIC on `network-1` each.
    pub(crate) fn inventory() -> Store {
        let store = Store::new("test");
        for (id, name) in [("vm-1", "v1"), ("vm-2", "v2")] {
            let mut vm = Vm::with_id(id);
            vm.base.name = name.into();
            vm.base.object.insert(VM_CPUS.into(), json!(2));
            vm.base.object.insert(VM_MEMORY_MB.into(), json!(2048));
            vm.base.object.insert(
                VM_DEVICES.into(),
                json!([
                    {
                        "_type": "VirtualDisk",
                        "key": 2000,
                        "backing": {"fileName": format!("[ds1] {0}/{0}.vmdk", name), "datastore": {"kind": "Datastore", "id": "datastore-1"}},
                        "capacityInBytes": 10 * MIB
                    },
                    {
                        "_type": "VirtualVmxnet3",
                        "key": 4000,
                        "macAddress": "00:50:56:00:00:01",
                        "backing": {"network": {"kind": "Network", "id": "network-1"}}
                    }
                ]),
            );
            store.insert(&mut vm).unwrap();
        }
        store
    }

    pub(crate) fn plan(warm: bool) -> Plan {
        let mut plan: Plan = serde_json::from_value(json!({
            "apiVersion": "forklift.konveyor.io/v1beta1",
            "kind": "Plan",
            "metadata": {"name": "plan-1", "namespace": "konveyor"},
            "spec": {
                "provider": {"source": {"namespace": "konveyor", "name": "vsphere"}, "destination": {"namespace": "konveyor", "name": "host"}},
                "targetNamespace": "target",
                "vms": [{"id": "vm-1", "name": "v1"}, {"id": "vm-2", "name": "v2"}]
            }
        }))
        .unwrap();
        if warm {
            plan.spec.migration_type = Some(MigrationType::Warm);
        }
        plan
    }

    pub(crate) fn context(
        warm: bool,
        source: Arc<FakeSource>,
        cluster: Arc<FakeCluster>,
        cutover: Option<DateTime<Utc>>,
    ) -> MigrationContext {
        MigrationContext {
            plan: plan(warm),
            migration: "m-1".into(),
            source: serde_json::from_value(json!({
                "apiVersion": "forklift.konveyor.io/v1beta1",
                "kind": "Provider",
                "metadata": {"name": "vsphere", "namespace": "konveyor"},
                "spec": {"type": "vsphere", "url": "https://vc/sdk", "secret": {"namespace": "konveyor", "name": "vsphere-secret"}}
            }))
            .unwrap(),
            storage_map: serde_json::from_value(json!({
                "map": [{"source": {"id": "datastore-1"}, "destination": {"storageClass": "ceph-rbd"}}]
            }))
            .unwrap(),
            network_map: serde_json::from_value(json!({
                "map": [{"source": {"id": "network-1"}, "destination": {"type": "pod"}}]
            }))
            .unwrap(),
            inventory: inventory(),
            source_control: source,
            destination: cluster,
            deadlines: Deadlines::default(),
            precopy_interval: Duration::from_secs(3600),
            cutover,
            retry: RetryConfig::fast(2),
        }
    }

    fn plan_vm(id: &str, name: &str) -> PlanVm {
        PlanVm {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cold_vm_runs_to_success() {
        let source = Arc::new(FakeSource::default());
        let cluster = Arc::new(FakeCluster::default());
        let migrator = Migrator::new(Arc::new(context(false, source.clone(), cluster.clone(), None)));
        let pvm = plan_vm("vm-1", "v1");
        let mut vm = VmStatus::new("vm-1", "v1");

        migrator.run(&pvm, &mut vm).await.unwrap();
        assert_eq!(vm.phase, "CopyDisks");
        assert_eq!(source.calls.lock().as_slice(), ["power_off vm-1"]);
        let step = vm.find_step(pipeline::DISK_TRANSFER).unwrap();
        assert_eq!(step.phase, StepPhase::Running);
        assert_eq!(step.tasks[0].name, "v1-disk-0");
        assert_eq!(step.tasks[0].progress.completed, 5);
        assert_eq!(cluster.transfers.lock()["v1-disk-0"].kind, TransferKind::DataVolume);

        cluster.set("v1-disk-0", TransferPhase::Succeeded);
        migrator.run(&pvm, &mut vm).await.unwrap();
        assert_eq!(vm.phase, "PowerOn");
        assert_eq!(cluster.vms.lock()[0].pvcs, vec!["v1-disk-0".to_string()]);

        *cluster.ready.lock() = true;
        migrator.run(&pvm, &mut vm).await.unwrap();
        assert_eq!(vm.phase, "Succeeded");
        assert!(vm.conditions.has(SUCCEEDED));
        assert_eq!(pipeline::percent(&vm), 100);
        assert_eq!(cluster.deleted.lock().as_slice(), ["transfer v1-disk-0"]);
    }

    #[tokio::test]
    async fn test_populator_failure_message() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.set("v1-disk-0", TransferPhase::Failed);
        let migrator = Migrator::new(Arc::new(context(false, Arc::default(), cluster.clone(), None)));
        let mut vm = VmStatus::new("vm-1", "v1");
        migrator.run(&plan_vm("vm-1", "v1"), &mut vm).await.unwrap();

        assert_eq!(vm.phase, "Failed");
        let failed = vm.conditions.find(FAILED).unwrap();
        assert_eq!(failed.category, Category::Error);
        assert_eq!(failed.message, "populator pod failed for PVC v1-disk-0");
        assert_eq!(vm.find_step(pipeline::DISK_TRANSFER).unwrap().phase, StepPhase::Failed);
        assert!(cluster.deleted.lock().contains(&"pvc v1-disk-0".to_string()));
    }

    #[tokio::test]
    async fn test_unmapped_datastore_fails_validation() {
        let mut ctx = context(false, Arc::default(), Arc::default(), None);
        ctx.storage_map.map.clear();
        let migrator = Migrator::new(Arc::new(ctx));
        let mut vm = VmStatus::new("vm-1", "v1");
        migrator.run(&plan_vm("vm-1", "v1"), &mut vm).await.unwrap();
        assert_eq!(vm.phase, "Failed");
        assert_eq!(vm.error.as_ref().unwrap().phase, "Validated");
        assert!(vm.conditions.find(FAILED).unwrap().message.contains("datastore-1"));
    }

    #[tokio::test]
    async fn test_deadline_marks_timed_out() {
        let migrator = Migrator::new(Arc::new(context(false, Arc::default(), Arc::default(), None)));
        let pvm = plan_vm("vm-1", "v1");
        let mut vm = VmStatus::new("vm-1", "v1");
        migrator.run(&pvm, &mut vm).await.unwrap();
        assert_eq!(vm.phase, "CopyDisks");

        let mut ctx = context(false, Arc::default(), Arc::default(), None);
        ctx.deadlines.copy_disks = Some(Duration::from_secs(1));
        let migrator = Migrator::new(Arc::new(ctx));
        vm.phase_started = Some(Utc::now() - chrono::Duration::seconds(5));
        migrator.run(&pvm, &mut vm).await.unwrap();
        assert_eq!(vm.phase, "Failed");
        assert_eq!(vm.conditions.find(FAILED).unwrap().message, TIMED_OUT);
    }

    #[tokio::test]
    async fn test_warm_precopy_then_cutover() {
        let source = Arc::new(FakeSource::default());
        let cluster = Arc::new(FakeCluster::default());
        let pvm = plan_vm("vm-1", "v1");
        let mut vm = VmStatus::new("vm-1", "v1");

        let migrator = Migrator::new(Arc::new(context(true, source.clone(), cluster.clone(), None)));
        migrator.run(&pvm, &mut vm).await.unwrap();
        assert_eq!(vm.phase, "CopyDisks");
        assert!(!source.calls.lock().iter().any(|c| c.starts_with("power_off")));
        assert_eq!(cluster.transfers.lock()["v1-disk-0"].checkpoints.len(), 1);

        cluster.set("v1-disk-0", TransferPhase::Paused);
        migrator.run(&pvm, &mut vm).await.unwrap();
        assert_eq!(vm.phase, "Precopy");
        assert_eq!(vm.warm.as_ref().unwrap().successes, 1);

        let cutover = Some(Utc::now() - chrono::Duration::seconds(1));
        let migrator = Migrator::new(Arc::new(context(true, source.clone(), cluster.clone(), cutover)));
        migrator.run(&pvm, &mut vm).await.unwrap();
        assert_eq!(vm.phase, "Cutover");
        let transfer = cluster.transfers.lock()["v1-disk-0"].clone();
        assert!(transfer.final_checkpoint);
        assert_eq!(transfer.checkpoints[1].previous, transfer.checkpoints[0].current);

        cluster.set("v1-disk-0", TransferPhase::Succeeded);
        *cluster.ready.lock() = true;
        migrator.run(&pvm, &mut vm).await.unwrap();
        assert_eq!(vm.phase, "Succeeded");
        assert_eq!(vm.find_step(pipeline::CUTOVER).unwrap().phase, StepPhase::Completed);
    }

    #[tokio::test]
    async fn test_cancel_releases_resources() {
        let cluster = Arc::new(FakeCluster::default());
        let migrator = Migrator::new(Arc::new(context(false, Arc::default(), cluster.clone(), None)));
        let pvm = plan_vm("vm-1", "v1");
        let mut vm = VmStatus::new("vm-1", "v1");
        migrator.run(&pvm, &mut vm).await.unwrap();

        migrator.cancel(&pvm, &mut vm).await;
        assert_eq!(vm.phase, "Canceled");
        assert!(vm.pipeline.iter().all(|s| s.phase.is_terminal()));
        assert!(cluster.transfers.lock().is_empty());
        assert!(cluster.deleted.lock().contains(&"pvc v1-disk-0".to_string()));
    }

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("My VM_01"), "my-vm-01");
        assert_eq!(dns_label("-x-"), "x");
    }
}
