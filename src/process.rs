use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub cpu: f32,    // percent of one core
    pub memory: u64, // bytes
    pub connection_count: usize,
    pub last_seen: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(pid: u32, name: String) -> Self {
        Self {
            pid,
            name,
            cpu: 0.0,
            memory: 0,
            connection_count: 0,
            last_seen: Utc::now(),
        }
    }

    pub fn format_memory(bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

pub type ProcessMap = HashMap<u32, ProcessRecord>;
