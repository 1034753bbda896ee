//! Bounded in-memory telemetry
//!
//! Three newest-first ring buffers (flow events, connections, processes)
//! capped at `max_items`, plus lifetime counters that only ever grow until
//! [`TelemetryStore::clear`]. Evicting an old entry never touches a counter.

use crate::connection::{ConnectionRecord, FlowEvent, Protocol};
use crate::process::ProcessRecord;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStat {
    pub domain: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStat {
    pub protocol: Protocol,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStat {
    pub port: u16,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralStats {
    pub total_packets: u64,
    pub total_connections: u64,
    pub active_processes: usize,
    pub unique_domains: usize,
    /// Distinct protocols seen
    pub protocols: usize,
    /// Distinct remote ports seen
    pub ports: usize,
    pub is_monitoring: bool,
    pub interfaces: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecentActivity {
    pub packets: Vec<FlowEvent>,
    pub connections: Vec<ConnectionRecord>,
    pub processes: Vec<ProcessRecord>,
}

/// Counter keyed by `K` that remembers when each key first appeared
struct Histogram<K> {
    slots: HashMap<K, usize>,
    counts: Vec<(K, u64)>,
}

impl<K: Eq + Hash + Clone> Histogram<K> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            counts: Vec::new(),
        }
    }

    fn bump(&mut self, key: &K) {
        match self.slots.get(key) {
            Some(&slot) => self.counts[slot].1 += 1,
            None => {
                self.slots.insert(key.clone(), self.counts.len());
                self.counts.push((key.clone(), 1));
            }
        }
    }

    fn len(&self) -> usize {
        self.counts.len()
    }

    /// Highest count first; equal counts keep first-insertion order
    fn ranked(&self) -> Vec<(K, u64)> {
        let mut ranked = self.counts.clone();
        // sort_by is stable
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.counts.clear();
    }
}

pub struct TelemetryStore {
    max_items: usize,
    flow_events: VecDeque<FlowEvent>,
    connections: VecDeque<ConnectionRecord>,
    processes: VecDeque<ProcessRecord>,
    total_packets: u64,
    total_connections: u64,
    protocols: Histogram<Protocol>,
    ports: Histogram<u16>,
    domains: Histogram<String>,
    last_process_poll: Option<DateTime<Utc>>,
}

impl TelemetryStore {
    pub fn new(max_items: usize) -> Self {
        let max_items = max_items.max(1);
        Self {
            max_items,
            flow_events: VecDeque::new(),
            connections: VecDeque::new(),
            processes: VecDeque::new(),
            total_packets: 0,
            total_connections: 0,
            protocols: Histogram::new(),
            ports: Histogram::new(),
            domains: Histogram::new(),
            last_process_poll: None,
        }
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn append_flow_event(&mut self, event: FlowEvent) {
        self.total_packets += 1;
        self.protocols.bump(&event.protocol);
        if let Some(domain) = &event.domain {
            self.domains.bump(domain);
        }

        self.flow_events.push_front(event);
        self.flow_events.truncate(self.max_items);
    }

    pub fn append_connection(&mut self, connection: ConnectionRecord) {
        self.total_connections += 1;
        self.ports.bump(&connection.key.remote_port);

        self.connections.push_front(connection);
        self.connections.truncate(self.max_items);
    }

    /// Replace the record with the same pid in place, or prepend a new one
    pub fn upsert_process(&mut self, process: ProcessRecord) {
        if let Some(existing) = self.processes.iter_mut().find(|p| p.pid == process.pid) {
            *existing = process;
            return;
        }

        self.processes.push_front(process);
        self.processes.truncate(self.max_items);
    }

    pub fn mark_process_poll(&mut self, at: DateTime<Utc>) {
        self.last_process_poll = Some(at);
    }

    /// When the last process poll landed, `None` until the first one
    pub fn last_process_poll(&self) -> Option<DateTime<Utc>> {
        self.last_process_poll
    }

    pub fn flow_events(&self, limit: usize, offset: usize) -> Vec<FlowEvent> {
        self.flow_events.iter().skip(offset).take(limit).cloned().collect()
    }

    pub fn connections(&self, limit: usize, offset: usize) -> Vec<ConnectionRecord> {
        self.connections.iter().skip(offset).take(limit).cloned().collect()
    }

    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.processes.iter().cloned().collect()
    }

    pub fn process(&self, pid: u32) -> Option<ProcessRecord> {
        self.processes.iter().find(|p| p.pid == pid).cloned()
    }

    pub fn top_domains(&self, limit: usize) -> Vec<DomainStat> {
        self.domains
            .ranked()
            .into_iter()
            .take(limit)
            .map(|(domain, count)| DomainStat { domain, count })
            .collect()
    }

    pub fn protocol_stats(&self) -> Vec<ProtocolStat> {
        self.protocols
            .ranked()
            .into_iter()
            .map(|(protocol, count)| ProtocolStat { protocol, count })
            .collect()
    }

    pub fn port_stats(&self) -> Vec<PortStat> {
        self.ports
            .ranked()
            .into_iter()
            .map(|(port, count)| PortStat { port, count })
            .collect()
    }

    /// Everything touched within the last `minutes`. A window reaching past
    /// the earliest representable time returns everything.
    pub fn recent_activity(&self, minutes: u64) -> RecentActivity {
        let cutoff = i64::try_from(minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.recent_since(cutoff)
    }

    fn recent_since(&self, cutoff: DateTime<Utc>) -> RecentActivity {
        RecentActivity {
            packets: self
                .flow_events
                .iter()
                .filter(|e| e.timestamp > cutoff)
                .cloned()
                .collect(),
            connections: self
                .connections
                .iter()
                .filter(|c| c.last_seen > cutoff)
                .cloned()
                .collect(),
            processes: self
                .processes
                .iter()
                .filter(|p| p.last_seen > cutoff)
                .cloned()
                .collect(),
        }
    }

    pub fn general_stats(&self, is_monitoring: bool, interfaces: usize) -> GeneralStats {
        GeneralStats {
            total_packets: self.total_packets,
            total_connections: self.total_connections,
            active_processes: self.processes.len(),
            unique_domains: self.domains.len(),
            protocols: self.protocols.len(),
            ports: self.ports.len(),
            is_monitoring,
            interfaces,
        }
    }

    /// Drop every buffered entry and reset all counters
    pub fn clear(&mut self) {
        self.flow_events.clear();
        self.connections.clear();
        self.processes.clear();
        self.total_packets = 0;
        self.total_connections = 0;
        self.protocols.clear();
        self.ports.clear();
        self.domains.clear();
        self.last_process_poll = None;
    }
}
