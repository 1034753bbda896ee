// Joins process and connection snapshots and applies the monitoring scope

use crate::connection::ConnectionRecord;
use crate::process::{ProcessMap, ProcessRecord};
use serde::Serialize;
use std::collections::HashMap;

/// Which processes the monitor reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "pid", rename_all = "lowercase")]
pub enum Scope {
    Global,
    Process(u32),
}

impl Scope {
    /// Whether traffic owned by `pid` is visible in this scope
    pub fn admits(&self, pid: u32) -> bool {
        match self {
            Scope::Global => true,
            Scope::Process(target) => *target == pid,
        }
    }

    pub fn target_pid(&self) -> Option<u32> {
        match self {
            Scope::Global => None,
            Scope::Process(pid) => Some(*pid),
        }
    }
}

pub struct Correlator {
    scope: Scope,
}

impl Correlator {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn set_scope(&mut self, scope: Scope) {
        self.scope = scope;
    }

    pub fn admits(&self, pid: u32) -> bool {
        self.scope.admits(pid)
    }

    /// Attach connection counts and drop processes outside the scope.
    ///
    /// Duplicate pids collapse to the last record seen. The result is sorted
    /// by pid so consecutive polls line up.
    pub fn correlate(
        &self,
        processes: Vec<ProcessRecord>,
        connections: &[ConnectionRecord],
    ) -> Vec<ProcessRecord> {
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for row in connections {
            *counts.entry(row.owner_pid).or_default() += 1;
        }

        let mut by_pid: ProcessMap = processes
            .into_iter()
            .filter(|p| self.scope.admits(p.pid))
            .map(|p| (p.pid, p))
            .collect();

        for (pid, process) in by_pid.iter_mut() {
            process.connection_count = counts.get(pid).copied().unwrap_or(0);
        }

        let mut records: Vec<ProcessRecord> = by_pid.into_values().collect();
        records.sort_by_key(|p| p.pid);
        records
    }
}
