// Synthetic snapshot source
//
// Generates a plausible, slowly changing connection table and process list
// without touching the OS. Useful for demos and for hosts where no real
// source is available. It implements both snapshot traits so the monitor
// cannot tell it apart from a real backend.

use super::BackendPriority;
use super::connection::ConnectionSnapshotSource;
use super::process::ProcessSnapshotSource;
use crate::connection::{ConnectionRecord, ConnectionState, FlowKey, Protocol};
use crate::process::ProcessRecord;
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

/// Simulated processes: (pid, name, base cpu %, base memory KB)
const PROCESSES: &[(u32, &str, f32, u64)] = &[
    (1234, "chrome", 15.2, 1_024_000),
    (5678, "firefox", 8.7, 512_000),
    (9012, "discord", 12.3, 768_000),
    (3456, "spotify", 5.1, 256_000),
    (7890, "steam", 20.8, 2_048_000),
    (1111, "code", 3.2, 512_000),
    (2222, "explorer", 1.5, 128_000),
    (3333, "svchost", 2.1, 256_000),
];

/// Public endpoints with real PTR records, so the DNS cache has work to do
const REMOTES: &[[u8; 4]] = &[
    [8, 8, 8, 8],
    [1, 1, 1, 1],
    [140, 82, 112, 4],
    [151, 101, 1, 69],
    [142, 250, 80, 46],
    [104, 16, 132, 229],
    [13, 107, 42, 14],
    [17, 253, 144, 10],
];

const REMOTE_PORTS: &[(Protocol, u16)] = &[
    (Protocol::Tcp, 443),
    (Protocol::Tcp, 443),
    (Protocol::Tcp, 80),
    (Protocol::Tcp, 22),
    (Protocol::Udp, 53),
    (Protocol::Udp, 443),
];

/// Table size the generator drifts around
const TARGET_FLOWS: usize = 24;

/// Chance per step that an existing flow goes away
const CLOSE_CHANCE: f64 = 0.15;

/// The table changes at most this often, however often it is read. Activity
/// cycles read it more often than polls do.
const STEP_EVERY: Duration = Duration::from_secs(2);

struct SyntheticState {
    rng: StdRng,
    flows: Vec<ConnectionRecord>,
    next_port: u16,
    step_every: Duration,
    last_step: Option<Instant>,
}

pub struct SyntheticSource {
    state: Mutex<SyntheticState>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy(), STEP_EVERY)
    }

    pub fn with_rng(rng: StdRng, step_every: Duration) -> Self {
        Self {
            state: Mutex::new(SyntheticState {
                rng,
                flows: Vec::new(),
                next_port: 49152,
                step_every,
                last_step: None,
            }),
        }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticState {
    fn next_local_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port == u16::MAX { 49152 } else { port + 1 };
        port
    }

    fn new_flow(&mut self) -> ConnectionRecord {
        let (pid, ..) = PROCESSES[self.rng.gen_range(0..PROCESSES.len())];
        let (protocol, remote_port) = REMOTE_PORTS[self.rng.gen_range(0..REMOTE_PORTS.len())];
        let remote = REMOTES[self.rng.gen_range(0..REMOTES.len())];

        let key = FlowKey {
            protocol,
            local_address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            local_port: self.next_local_port(),
            remote_address: IpAddr::V4(Ipv4Addr::from(remote)),
            remote_port,
        };

        let state = match protocol {
            Protocol::Udp => ConnectionState::Established,
            Protocol::Tcp => *[
                ConnectionState::Established,
                ConnectionState::Established,
                ConnectionState::Established,
                ConnectionState::SynSent,
                ConnectionState::CloseWait,
                ConnectionState::TimeWait,
            ]
            .choose(&mut self.rng)
            .unwrap_or(&ConnectionState::Established),
        };

        ConnectionRecord::new(key, state, pid, Utc::now())
    }

    /// Advance the table if `step_every` has passed since the last step
    fn maybe_step(&mut self) {
        let due = self
            .last_step
            .is_none_or(|last| last.elapsed() >= self.step_every);
        if due {
            self.step();
            self.last_step = Some(Instant::now());
        }
    }

    fn step(&mut self) {
        let mut kept = Vec::with_capacity(self.flows.len());
        for mut flow in std::mem::take(&mut self.flows) {
            if self.rng.gen_bool(CLOSE_CHANCE) {
                continue;
            }
            // Handshakes complete by the next poll
            if flow.state == ConnectionState::SynSent {
                flow.state = ConnectionState::Established;
            }
            kept.push(flow);
        }
        self.flows = kept;

        let wanted = TARGET_FLOWS.saturating_sub(self.flows.len());
        let opening = if wanted == 0 { 0 } else { self.rng.gen_range(1..=wanted) };
        for _ in 0..opening {
            let flow = self.new_flow();
            self.flows.push(flow);
        }
    }
}

impl ConnectionSnapshotSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Fallback
    }

    fn is_available() -> bool {
        true
    }

    fn snapshot(&self) -> Result<Vec<ConnectionRecord>> {
        let mut state = self.state.lock();
        state.maybe_step();

        // Every simulated process also owns a listener
        let now = Utc::now();
        let mut rows: Vec<ConnectionRecord> = PROCESSES
            .iter()
            .enumerate()
            .map(|(i, (pid, ..))| {
                let key = FlowKey {
                    protocol: Protocol::Tcp,
                    local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    local_port: 7000 + i as u16,
                    remote_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    remote_port: 0,
                };
                ConnectionRecord::new(key, ConnectionState::Listening, *pid, now)
            })
            .collect();

        for flow in state.flows.iter_mut() {
            flow.last_seen = now;
        }
        rows.extend(state.flows.iter().cloned());
        Ok(rows)
    }

    fn interface_count(&self) -> usize {
        1
    }
}

impl ProcessSnapshotSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Fallback
    }

    fn snapshot(&self) -> Result<Vec<ProcessRecord>> {
        let mut state = self.state.lock();
        let now = Utc::now();

        Ok(PROCESSES
            .iter()
            .map(|&(pid, name, cpu, memory_kb)| {
                let jitter: f32 = state.rng.gen_range(0.5..1.5);
                ProcessRecord {
                    pid,
                    name: name.to_string(),
                    cpu: cpu * jitter,
                    memory: memory_kb * 1024,
                    connection_count: 0,
                    last_seen: now,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn source() -> SyntheticSource {
        SyntheticSource::with_rng(StdRng::seed_from_u64(7), Duration::ZERO)
    }

    fn flow_keys(source: &SyntheticSource) -> HashSet<FlowKey> {
        ConnectionSnapshotSource::snapshot(source)
            .unwrap()
            .into_iter()
            .filter(|r| r.state != ConnectionState::Listening)
            .map(|r| r.key)
            .collect()
    }

    #[test]
    fn test_table_holds_still_between_steps() {
        let source = SyntheticSource::with_rng(StdRng::seed_from_u64(7), Duration::from_secs(3600));
        let first = flow_keys(&source);
        assert!(!first.is_empty());
        for _ in 0..5 {
            assert_eq!(flow_keys(&source), first);
        }
    }

    #[test]
    fn test_table_evolves_once_steps_are_due() {
        let source = source();
        let first = flow_keys(&source);
        assert!((1..20).any(|_| flow_keys(&source) != first));
    }

    #[test]
    fn test_listeners_are_stable_across_snapshots() {
        let source = source();
        let first = ConnectionSnapshotSource::snapshot(&source).unwrap();
        let second = ConnectionSnapshotSource::snapshot(&source).unwrap();

        let listeners = |rows: &[ConnectionRecord]| -> HashSet<FlowKey> {
            rows.iter()
                .filter(|r| r.state == ConnectionState::Listening)
                .map(|r| r.key)
                .collect()
        };
        assert_eq!(listeners(&first).len(), PROCESSES.len());
        assert_eq!(listeners(&first), listeners(&second));
    }

    #[test]
    fn test_flow_keys_are_unique() {
        let source = source();
        for _ in 0..20 {
            let rows = ConnectionSnapshotSource::snapshot(&source).unwrap();
            let keys: HashSet<FlowKey> = rows.iter().map(|r| r.key).collect();
            assert_eq!(keys.len(), rows.len());
        }
    }

    #[test]
    fn test_flows_belong_to_known_processes() {
        let source = source();
        let pids: HashSet<u32> = PROCESSES.iter().map(|p| p.0).collect();
        let rows = ConnectionSnapshotSource::snapshot(&source).unwrap();
        assert!(rows.iter().all(|r| pids.contains(&r.owner_pid)));

        let processes = ProcessSnapshotSource::snapshot(&source).unwrap();
        assert_eq!(processes.len(), PROCESSES.len());
        assert!(processes.iter().all(|p| p.cpu > 0.0 && p.memory > 0));
    }
}
