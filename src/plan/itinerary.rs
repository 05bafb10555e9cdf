//! VM itinerary
//!
//! The phase alphabet a VM walks through. Cold migrations power the source
//! off before copying; warm migrations copy while the source runs, repeat
//! precopies until cutover, then do a final copy.

use crate::settings::Settings;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Started,
    Validated,
    PowerOffSource,
    CopyDisks,
    Precopy,
    Cutover,
    CreateTargetVM,
    PowerOn,
    Succeeded,
    Failed,
    Canceled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Started => "Started",
            Phase::Validated => "Validated",
            Phase::PowerOffSource => "PowerOffSource",
            Phase::CopyDisks => "CopyDisks",
            Phase::Precopy => "Precopy",
            Phase::Cutover => "Cutover",
            Phase::CreateTargetVM => "CreateTargetVM",
            Phase::PowerOn => "PowerOn",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed | Phase::Canceled)
    }

    /// Pipeline step that reports this phase.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            Phase::Started | Phase::Validated | Phase::PowerOffSource => Some(pipeline::INITIALIZE),
            Phase::CopyDisks | Phase::Precopy => Some(pipeline::DISK_TRANSFER),
            Phase::Cutover => Some(pipeline::CUTOVER),
            Phase::CreateTargetVM => Some(pipeline::CREATE_TARGET_VM),
            Phase::PowerOn => Some(pipeline::POWER_ON),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let phase = match s {
            "" | "Started" => Phase::Started,
            "Validated" => Phase::Validated,
            "PowerOffSource" => Phase::PowerOffSource,
            "CopyDisks" => Phase::CopyDisks,
            "Precopy" => Phase::Precopy,
            "Cutover" => Phase::Cutover,
            "CreateTargetVM" => Phase::CreateTargetVM,
            "PowerOn" => Phase::PowerOn,
            "Succeeded" => Phase::Succeeded,
            "Failed" => Phase::Failed,
            "Canceled" => Phase::Canceled,
            other => return Err(format!("unknown phase '{}'", other)),
        };
        Ok(phase)
    }
}

/// The phase order for cold or warm VMs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Itinerary {
    pub warm: bool,
}

const COLD: &[Phase] = &[
    Phase::Started,
    Phase::Validated,
    Phase::PowerOffSource,
    Phase::CopyDisks,
    Phase::CreateTargetVM,
    Phase::PowerOn,
    Phase::Succeeded,
];

const WARM: &[Phase] = &[
    Phase::Started,
    Phase::Validated,
    Phase::CopyDisks,
    Phase::Precopy,
    Phase::Cutover,
    Phase::CreateTargetVM,
    Phase::PowerOn,
    Phase::Succeeded,
];

impl Itinerary {
    pub fn new(warm: bool) -> Self {
        Self { warm }
    }

    pub fn phases(&self) -> &'static [Phase] {
        if self.warm {
            WARM
        } else {
            COLD
        }
    }

    /// Phase following `phase`; terminal phases have none.
    pub fn next(&self, phase: Phase) -> Option<Phase> {
        let phases = self.phases();
        phases
            .iter()
            .position(|p| *p == phase)
            .and_then(|i| phases.get(i + 1))
            .copied()
    }
}

/// Per-phase deadlines
#[derive(Debug, Clone)]
pub struct Deadlines {
    pub validated: Duration,
    pub copy_disks: Option<Duration>,
    pub create_target_vm: Duration,
    pub power_on: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            validated: Duration::from_secs(5 * 60),
            copy_disks: None,
            create_target_vm: Duration::from_secs(10 * 60),
            power_on: Duration::from_secs(5 * 60),
        }
    }
}

impl Deadlines {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            copy_disks: settings.copy_disks_timeout,
            power_on: settings.vm_boot_timeout,
            ..Default::default()
        }
    }

    /// Deadline for a phase; `None` is unbounded.
    pub fn for_phase(&self, phase: Phase) -> Option<Duration> {
        match phase {
            Phase::Validated => Some(self.validated),
            Phase::CopyDisks => self.copy_disks,
            Phase::CreateTargetVM => Some(self.create_target_vm),
            Phase::PowerOn => Some(self.power_on),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_order() {
        let it = Itinerary::new(false);
        assert_eq!(it.next(Phase::Validated), Some(Phase::PowerOffSource));
        assert_eq!(it.next(Phase::CopyDisks), Some(Phase::CreateTargetVM));
        assert_eq!(it.next(Phase::Succeeded), None);
        assert!(!it.phases().contains(&Phase::Precopy));
    }

    #[test]
    fn test_warm_order() {
        let it = Itinerary::new(true);
        assert_eq!(it.next(Phase::Validated), Some(Phase::CopyDisks));
        assert_eq!(it.next(Phase::Precopy), Some(Phase::Cutover));
        assert_eq!(it.next(Phase::Cutover), Some(Phase::CreateTargetVM));
    }

    #[test]
    fn test_phase_parse() {
        assert_eq!("".parse::<Phase>().unwrap(), Phase::Started);
        for phase in WARM.iter().chain(COLD) {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), *phase);
        }
        assert!("Warp".parse::<Phase>().is_err());
    }

    #[test]
    fn test_deadlines_follow_settings() {
        let settings = Settings {
            vm_boot_timeout: Duration::from_secs(42),
            copy_disks_timeout: Some(Duration::from_secs(7)),
            ..Default::default()
        };
        let d = Deadlines::from_settings(&settings);
        assert_eq!(d.for_phase(Phase::PowerOn), Some(Duration::from_secs(42)));
        assert_eq!(d.for_phase(Phase::CopyDisks), Some(Duration::from_secs(7)));
        assert_eq!(d.for_phase(Phase::Validated), Some(Duration::from_secs(300)));
        assert_eq!(d.for_phase(Phase::Precopy), None);
    }
}
