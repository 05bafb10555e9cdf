//! Process-level configuration
//!
//! Every setting can be given as a flag or through its environment variable.
//! Unrecognised environment variables are ignored.

use crate::error::{Error, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Controller settings shared by the engine, the admission pipeline and the
/// inventory.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Maximum wait for a plan to become ready
    #[arg(long, env = "PLAN_TIMEOUT", default_value = "500s", value_parser = parse_duration)]
    pub plan_timeout: Duration,

    /// Maximum wait for a migration to complete
    #[arg(long, env = "MIGRATION_TIMEOUT", default_value = "500s", value_parser = parse_duration)]
    pub migration_timeout: Duration,

    /// Maximum wait for a migrated VM to boot
    #[arg(long, env = "VM_BOOT_TIMEOUT", default_value = "300s", value_parser = parse_duration)]
    pub vm_boot_timeout: Duration,

    /// Namespace the controller is deployed in
    #[arg(long, env = "FORKLIFT_NAMESPACE", default_value = "openshift-mtv")]
    pub namespace: String,

    /// Route (service name) of the inventory API
    #[arg(long, env = "FORKLIFT_API_ROUTE", default_value = "forklift-inventory")]
    pub api_route: String,

    /// Keep the target VM when the migration succeeds
    #[arg(long, env = "KEEP_VM_ON_SUCCESS")]
    pub keep_vm_on_success: bool,

    /// Maximum VMs migrated concurrently within one migration
    #[arg(long, env = "MAX_CONCURRENT_VMS", default_value = "10")]
    pub max_concurrent_vms: usize,

    /// Interval between warm precopies
    #[arg(long, env = "PRECOPY_INTERVAL", default_value = "60m", value_parser = parse_duration)]
    pub precopy_interval: Duration,

    /// Deadline for the CopyDisks step (unbounded when unset)
    #[arg(long, env = "COPY_DISKS_TIMEOUT", value_parser = parse_duration)]
    pub copy_disks_timeout: Option<Duration>,

    /// Directory for persistent inventories (ephemeral when unset)
    #[arg(long, env = "INVENTORY_PATH")]
    pub inventory_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            plan_timeout: Duration::from_secs(500),
            migration_timeout: Duration::from_secs(500),
            vm_boot_timeout: Duration::from_secs(300),
            namespace: "openshift-mtv".to_string(),
            api_route: "forklift-inventory".to_string(),
            keep_vm_on_success: false,
            max_concurrent_vms: 10,
            precopy_interval: Duration::from_secs(60 * 60),
            copy_disks_timeout: None,
            inventory_path: None,
        }
    }
}

/// Parse a duration such as `500s`, `5m`, `1h`, `250ms` or a bare number of
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration".into()));
    }

    let split = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);

    let num: u64 = num_str
        .parse()
        .map_err(|_| Error::DurationParse(format!("invalid number: {}", s)))?;

    let duration = match unit {
        "" | "s" => Duration::from_secs(num),
        "ms" => Duration::from_millis(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        _ => return Err(Error::DurationParse(format!("unknown unit: {}", unit))),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        settings: Settings,
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500s").unwrap(), Duration::from_secs(500));
        assert_eq!(parse_duration("500").unwrap(), Duration::from_secs(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn test_defaults_match_cli_defaults() {
        let parsed = Wrapper::try_parse_from(["forklift"]).unwrap().settings;
        let defaults = Settings::default();
        assert_eq!(parsed.plan_timeout, defaults.plan_timeout);
        assert_eq!(parsed.vm_boot_timeout, defaults.vm_boot_timeout);
        assert_eq!(parsed.namespace, "openshift-mtv");
        assert_eq!(parsed.api_route, "forklift-inventory");
        assert_eq!(parsed.max_concurrent_vms, 10);
        assert!(parsed.copy_disks_timeout.is_none());
    }

    #[test]
    fn test_flag_override() {
        let parsed = Wrapper::try_parse_from(["forklift", "--plan-timeout", "10m", "--keep-vm-on-success"])
            .unwrap()
            .settings;
        assert_eq!(parsed.plan_timeout, Duration::from_secs(600));
        assert!(parsed.keep_vm_on_success);
    }
}
