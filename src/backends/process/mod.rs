// Process snapshot sources
//
// A process snapshot lists every running process with its resource usage.
// Connection counts are filled in later by the correlator, so sources leave
// `connection_count` at zero.

use super::{BackendPriority, SourceInfo, pick};
use crate::process::ProcessRecord;
use anyhow::Result;

mod sysinfo;

pub use self::sysinfo::SysinfoSource;

/// Produces point-in-time reads of the process table
pub trait ProcessSnapshotSource: Send + Sync {
    /// Source name (e.g., "sysinfo")
    fn name(&self) -> &'static str;

    /// Source priority for auto-selection
    fn priority(&self) -> BackendPriority;

    /// Read all running processes
    fn snapshot(&self) -> Result<Vec<ProcessRecord>>;
}

/// Detect all process sources compiled into this build
pub fn detect_process_sources() -> Vec<SourceInfo> {
    vec![
        SourceInfo {
            name: "sysinfo",
            priority: BackendPriority::Better,
            available: true,
        },
        SourceInfo {
            name: "synthetic",
            priority: BackendPriority::Fallback,
            available: true,
        },
    ]
}

/// Select a process source by name, or the best available one
pub fn select_process_source(preference: Option<&str>) -> Result<Box<dyn ProcessSnapshotSource>> {
    let detected = detect_process_sources();
    let info = pick(&detected, preference).ok_or_else(|| match preference {
        Some(name) => anyhow::anyhow!("Unknown process source: {}", name),
        None => anyhow::anyhow!("No process source available on this system"),
    })?;

    match info.name {
        "sysinfo" => Ok(Box::new(SysinfoSource::new())),
        "synthetic" => Ok(Box::new(super::synthetic::SyntheticSource::new())),
        name => Err(anyhow::anyhow!("Unknown process source: {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_sysinfo() {
        assert_eq!(select_process_source(None).unwrap().name(), "sysinfo");
    }

    #[test]
    fn test_unknown_process_source() {
        assert!(select_process_source(Some("ps-list")).is_err());
    }
}
