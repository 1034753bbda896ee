// Cross-platform process source backed by the sysinfo crate

use super::ProcessSnapshotSource;
use crate::backends::BackendPriority;
use crate::process::ProcessRecord;
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use sysinfo::System;

pub struct SysinfoSource {
    // CPU usage is a delta between two refreshes, so the same System
    // instance has to live across polls
    cached_system: Mutex<System>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let cached_system = Mutex::new(System::new_all());
        log::debug!("Created cached System instance for SysinfoSource");
        Self { cached_system }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSnapshotSource for SysinfoSource {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Better
    }

    fn snapshot(&self) -> Result<Vec<ProcessRecord>> {
        let mut sys = self.cached_system.lock();
        sys.refresh_all();

        let now = Utc::now();
        let records = sys
            .processes()
            .iter()
            .map(|(pid, proc)| ProcessRecord {
                pid: pid.as_u32(),
                name: proc.name().to_string_lossy().into_owned(),
                cpu: proc.cpu_usage(),
                memory: proc.memory(),
                connection_count: 0,
                last_seen: now,
            })
            .collect();

        Ok(records)
    }
}
