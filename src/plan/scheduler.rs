//! VM scheduler
//!
//! Bounds how many VMs of one migration are in flight at once.

use crate::crd::VmStatus;

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    pub max_concurrent: usize,
}

impl Scheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Indexes of the VMs to drive this pass: every VM already running,
    /// then pending VMs in plan order until the limit is reached.
    pub fn next(&self, vms: &[VmStatus]) -> Vec<usize> {
        let running: Vec<usize> = vms
            .iter()
            .enumerate()
            .filter(|(_, vm)| vm.started.is_some() && !vm.is_completed())
            .map(|(i, _)| i)
            .collect();
        let free = self.max_concurrent.saturating_sub(running.len());
        let pending = vms
            .iter()
            .enumerate()
            .filter(|(_, vm)| vm.started.is_none() && !vm.is_completed())
            .map(|(i, _)| i)
            .take(free);
        let mut selected = running;
        selected.extend(pending);
        selected.sort_unstable();
        selected
    }
}
