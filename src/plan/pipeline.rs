//! Per-VM pipeline
//!
//! The pipeline is the externally observable projection of a VM's
//! itinerary: an ordered list of steps with phase, timestamps and a
//! `{completed,total}` counter.

use crate::crd::{Progress, Step, StepError, StepPhase, Task, VmStatus};
use chrono::Utc;

pub const INITIALIZE: &str = "Initialize";
pub const DISK_TRANSFER: &str = "DiskTransfer";
pub const CUTOVER: &str = "Cutover";
pub const CREATE_TARGET_VM: &str = "CreateTargetVM";
pub const POWER_ON: &str = "PowerOn";

fn step(name: &str, description: &str) -> Step {
    Step {
        name: name.to_string(),
        description: description.to_string(),
        ..Default::default()
    }
}

/// Build the pipeline of a VM.
pub fn build(warm: bool) -> Vec<Step> {
    let mut pipeline = vec![
        step(INITIALIZE, "Initialize migration."),
        step(DISK_TRANSFER, "Transfer disks."),
    ];
    if warm {
        pipeline.push(step(CUTOVER, "Final disk transfer at cutover."));
    }
    pipeline.push(step(CREATE_TARGET_VM, "Create the target VM."));
    pipeline.push(step(POWER_ON, "Start the target VM."));
    pipeline
}

/// Clamp a counter: never negative and `completed <= total`.
pub fn normalize(progress: Progress) -> Progress {
    let total = progress.total.max(0);
    Progress {
        completed: progress.completed.clamp(0, total),
        total,
    }
}

/// Apply a counter reading without letting `completed` decrease.
pub fn advance(current: Progress, reading: Progress) -> Progress {
    let total = reading.total.max(current.total);
    normalize(Progress {
        completed: reading.completed.max(current.completed),
        total,
    })
}

// =============================================================================
// Step transitions
// =============================================================================

pub fn start(step: &mut Step) {
    if step.phase == StepPhase::Pending {
        step.phase = StepPhase::Running;
        step.started = Some(Utc::now());
    }
}

/// A completed step reports 100% even when its total is zero.
pub fn complete(step: &mut Step) {
    if step.phase.is_terminal() {
        return;
    }
    if step.started.is_none() {
        step.started = Some(Utc::now());
    }
    step.phase = StepPhase::Completed;
    step.completed = Some(Utc::now());
    if step.progress.total <= 0 {
        step.progress.total = 1;
    }
    step.progress.completed = step.progress.total;
    for task in step.tasks.iter_mut().filter(|t| !t.phase.is_terminal()) {
        task.phase = StepPhase::Completed;
        task.completed = step.completed;
        task.progress.completed = task.progress.total;
    }
}

pub fn fail(step: &mut Step, reason: impl Into<String>) {
    if step.phase.is_terminal() {
        return;
    }
    if step.started.is_none() {
        step.started = Some(Utc::now());
    }
    let phase = step.name.clone();
    step.phase = StepPhase::Failed;
    step.completed = Some(Utc::now());
    step.error
        .get_or_insert_with(|| StepError {
            phase,
            reasons: Vec::new(),
        })
        .reasons
        .push(reason.into());
}

pub fn cancel(step: &mut Step) {
    if step.phase.is_terminal() {
        return;
    }
    step.phase = StepPhase::Canceled;
    step.completed = Some(Utc::now());
    for task in step.tasks.iter_mut().filter(|t| !t.phase.is_terminal()) {
        task.phase = StepPhase::Canceled;
        task.completed = step.completed;
    }
}

/// Find or add a task on a step.
pub fn task<'a>(step: &'a mut Step, name: &str) -> &'a mut Task {
    let index = match step.tasks.iter().position(|t| t.name == name) {
        Some(i) => i,
        None => {
            step.tasks.push(Task {
                name: name.to_string(),
                ..Default::default()
            });
            step.tasks.len() - 1
        }
    };
    &mut step.tasks[index]
}

/// Recompute a step's counter from its tasks.
pub fn sum_tasks(step: &mut Step) {
    if step.tasks.is_empty() {
        return;
    }
    let reading = step.tasks.iter().fold(Progress::default(), |acc, t| Progress {
        completed: acc.completed + t.progress.completed,
        total: acc.total + t.progress.total,
    });
    step.progress = advance(step.progress, reading);
}

// =============================================================================
// Aggregation
// =============================================================================

/// Overall VM progress across steps with a non-zero total.
pub fn vm_progress(vm: &VmStatus) -> Progress {
    vm.pipeline
        .iter()
        .map(|s| normalize(s.progress))
        .filter(|p| p.total > 0)
        .fold(Progress::default(), |acc, p| Progress {
            completed: acc.completed + p.completed,
            total: acc.total + p.total,
        })
}

/// Percentage of [`vm_progress`], capped at 100.
pub fn percent(vm: &VmStatus) -> u32 {
    let p = vm_progress(vm);
    if p.total <= 0 {
        return 0;
    }
    ((p.completed.saturating_mul(100) / p.total).min(100)) as u32
}

/// The step currently running, else the first pending one.
pub fn current_step(vm: &VmStatus) -> Option<&Step> {
    vm.pipeline
        .iter()
        .find(|s| s.phase == StepPhase::Running)
        .or_else(|| vm.pipeline.iter().find(|s| s.phase == StepPhase::Pending))
}

/// Phase label shown for a VM: the current step's name.
pub fn label(vm: &VmStatus) -> String {
    current_step(vm)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| vm.phase.clone())
}
