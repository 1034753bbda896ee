// Poll-driven network monitor
//
// Each poll cycle reads the connection and process tables, diffs the
// connection table against the previous one and turns the result into
// monitor events. A faster activity cycle synthesizes traffic on the
// established flows of the watched process.

pub mod activity;
pub mod correlator;
pub mod diff;

pub use self::activity::ActivityEstimator;
pub use self::correlator::{Correlator, Scope};
pub use self::diff::DiffEngine;

use crate::backends::connection::{ConnectionSnapshotSource, select_connection_source};
use crate::backends::process::{ProcessSnapshotSource, select_process_source};
use crate::config::Config;
use crate::connection::{ConnectionRecord, FlowEvent};
use crate::dns::DnsCache;
use crate::events::MonitorEvent;
use crate::process::ProcessRecord;
use crate::traffic_classifier::{classify_direction, service_for_port};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct NetworkMonitor {
    connection_source: Arc<dyn ConnectionSnapshotSource>,
    process_source: Arc<dyn ProcessSnapshotSource>,
    // Survives stop/start and mode switches
    dns: Arc<DnsCache>,
    diff: DiffEngine,
    activity: ActivityEstimator,
    correlator: Correlator,
    snapshot_timeout: Duration,
    // Set while a blocking read is out, including one the watchdog gave up on
    connection_busy: Arc<AtomicBool>,
    process_busy: Arc<AtomicBool>,
    next_event_id: u64,
    interfaces: usize,
    running: bool,
}

impl NetworkMonitor {
    pub fn new(
        connection_source: Arc<dyn ConnectionSnapshotSource>,
        process_source: Arc<dyn ProcessSnapshotSource>,
        dns: Arc<DnsCache>,
        activity: ActivityEstimator,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            connection_source,
            process_source,
            dns,
            diff: DiffEngine::new(),
            activity,
            correlator: Correlator::new(Scope::Global),
            snapshot_timeout,
            connection_busy: Arc::new(AtomicBool::new(false)),
            process_busy: Arc::new(AtomicBool::new(false)),
            next_event_id: 1,
            interfaces: 0,
            running: false,
        }
    }

    /// Build a monitor from the sources and settings named in `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let connection_source = select_connection_source(
            config.connection_source.as_deref(),
            config.snapshot_timeout(),
        )
        .context("Failed to select a connection source")?;
        let process_source = select_process_source(config.process_source.as_deref())
            .context("Failed to select a process source")?;

        log::info!(
            "Using connection source: {} (priority: {:?})",
            connection_source.name(),
            connection_source.priority()
        );
        log::info!(
            "Using process source: {} (priority: {:?})",
            process_source.name(),
            process_source.priority()
        );

        Ok(Self::new(
            Arc::from(connection_source),
            Arc::from(process_source),
            Arc::new(DnsCache::system(&config.dns)),
            ActivityEstimator::new(&config.activity),
            config.snapshot_timeout(),
        ))
    }

    pub fn connection_source_name(&self) -> &'static str {
        self.connection_source.name()
    }

    pub fn process_source_name(&self) -> &'static str {
        self.process_source.name()
    }

    pub fn dns(&self) -> &DnsCache {
        &self.dns
    }

    pub fn scope(&self) -> Scope {
        self.correlator.scope()
    }

    pub fn set_scope(&mut self, scope: Scope) {
        self.correlator.set_scope(scope);
    }

    /// Forget every tracked flow, so the next poll reports the whole table
    pub fn reset_diff(&mut self) {
        self.diff.reset();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Interfaces reported by the connection source at the last start
    pub fn interfaces(&self) -> usize {
        self.interfaces
    }

    /// Check that the connection source works and mark the monitor running.
    ///
    /// Unlike a poll cycle, a failing source is an error here.
    pub async fn start(&mut self) -> Result<()> {
        let rows = self
            .connection_snapshot()
            .await
            .context("Connection source is not usable")?;

        let source = Arc::clone(&self.connection_source);
        self.interfaces = tokio::task::spawn_blocking(move || source.interface_count())
            .await
            .unwrap_or(0);

        self.running = true;
        log::info!(
            "Monitor started ({:?}): {} rows in connection table, {} interfaces",
            self.scope(),
            rows.len(),
            self.interfaces
        );
        Ok(())
    }

    /// Mark the monitor stopped. Diff state and the DNS cache are kept.
    pub fn stop(&mut self) {
        if self.running {
            log::info!("Monitor stopped");
        }
        self.running = false;
    }

    /// One poll: diff the connection table, report active connections and
    /// the scoped process list
    pub async fn poll_cycle(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();

        let rows = match self.connection_snapshot().await {
            Ok(mut rows) => {
                let new_flows = self.diff.apply(&mut rows);
                for flow in new_flows {
                    if !self.correlator.admits(flow.owner_pid) {
                        continue;
                    }
                    let domain = self.dns.resolve(flow.key.remote_address).await;
                    let event = build_flow_event(self.next_id(), &flow, 1, false, domain);
                    events.push(MonitorEvent::Packet(event));
                }
                rows
            }
            Err(e) => {
                // Leave the diff alone so a glitch does not re-report every flow
                log::warn!("{:#}", e);
                Vec::new()
            }
        };

        let mut active: Vec<ConnectionRecord> = rows
            .iter()
            .filter(|row| row.state.is_active() && self.correlator.admits(row.owner_pid))
            .cloned()
            .collect();
        for row in active.iter_mut() {
            row.domain = self.dns.resolve(row.key.remote_address).await;
        }

        if !active.is_empty() || self.scope() == Scope::Global {
            events.push(MonitorEvent::Connections(active.clone()));
            events.extend(active.into_iter().map(MonitorEvent::Connection));
        }

        let processes = match self.process_snapshot().await {
            Ok(processes) => processes,
            Err(e) => {
                log::warn!("{:#}", e);
                Vec::new()
            }
        };
        let processes = self.correlator.correlate(processes, &rows);
        events.push(MonitorEvent::Processes(processes));

        events
    }

    /// One activity tick. Only produces events in process scope.
    pub async fn activity_cycle(&mut self) -> Vec<MonitorEvent> {
        let Some(pid) = self.scope().target_pid() else {
            return Vec::new();
        };
        if !self.activity.is_enabled() {
            return Vec::new();
        }

        let rows = match self.connection_snapshot().await {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("{:#}", e);
                return Vec::new();
            }
        };

        let hits: Vec<(ConnectionRecord, u64)> = self
            .activity
            .sample(&rows, pid)
            .into_iter()
            .map(|(row, size)| (row.clone(), size))
            .collect();

        let mut events = Vec::with_capacity(hits.len());
        for (row, size) in hits {
            let domain = self.dns.resolve(row.key.remote_address).await;
            let event = build_flow_event(self.next_id(), &row, size, true, domain);
            events.push(MonitorEvent::Packet(event));
        }
        events
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    async fn connection_snapshot(&self) -> Result<Vec<ConnectionRecord>> {
        let source = Arc::clone(&self.connection_source);
        run_snapshot(
            "connection",
            self.connection_source.name(),
            self.snapshot_timeout,
            &self.connection_busy,
            move || source.snapshot(),
        )
        .await
    }

    async fn process_snapshot(&self) -> Result<Vec<ProcessRecord>> {
        let source = Arc::clone(&self.process_source);
        run_snapshot(
            "process",
            self.process_source.name(),
            self.snapshot_timeout,
            &self.process_busy,
            move || source.snapshot(),
        )
        .await
    }
}

/// Clears the busy flag when the blocking read returns
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run a blocking snapshot read on the blocking pool with a watchdog.
///
/// A read the watchdog gave up on keeps `busy` set until it returns, and no
/// new read of the same source starts before then.
async fn run_snapshot<T, F>(
    what: &str,
    source: &str,
    timeout: Duration,
    busy: &Arc<AtomicBool>,
    read: F,
) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<Vec<T>> + Send + 'static,
{
    if busy.swap(true, Ordering::AcqRel) {
        anyhow::bail!(
            "{} snapshot from {} skipped, the previous read has not returned",
            what,
            source
        );
    }

    let in_flight = InFlight(Arc::clone(busy));
    let task = tokio::task::spawn_blocking(move || {
        let _in_flight = in_flight;
        read()
    });
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => {
            result.with_context(|| format!("{} snapshot from {} failed", what, source))
        }
        Ok(Err(e)) => anyhow::bail!("{} snapshot from {} did not complete: {}", what, source, e),
        Err(_) => anyhow::bail!(
            "{} snapshot from {} timed out after {:?}",
            what,
            source,
            timeout
        ),
    }
}

/// Turn a connection row into a dashboard "packet"
pub fn build_flow_event(
    id: u64,
    record: &ConnectionRecord,
    size: u64,
    is_activity: bool,
    domain: Option<String>,
) -> FlowEvent {
    let key = &record.key;

    let mut details = format!("{} {} → {}", key.protocol, key.local_port, key.remote_port);
    if is_activity {
        details.push_str(" (Activity)");
    }

    let flags = if is_activity {
        "DATA".to_string()
    } else {
        record.state.as_str().to_string()
    };

    FlowEvent {
        id,
        timestamp: Utc::now(),
        protocol: key.protocol,
        source: key.local(),
        destination: key.remote(),
        size,
        direction: classify_direction(key.local_port, key.remote_port),
        flags,
        pid: record.owner_pid,
        domain,
        is_activity,
        details,
        service: service_for_port(key.protocol, key.remote_port).map(str::to_string),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backends::BackendPriority;
    use crate::config::{ActivityConfig, DnsConfig};
    use crate::connection::ConnectionState::{Established, SynReceived};
    use crate::connection::tests::record;
    use crate::connection::{ConnectionState, Direction, Protocol};
    use crate::dns::tests::ScriptedResolver;
    use parking_lot::Mutex;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Connection source that replays scripted snapshots, repeating the last
    pub(crate) struct ScriptedConnections {
        snapshots: Mutex<VecDeque<Result<Vec<ConnectionRecord>>>>,
        last: Mutex<Vec<ConnectionRecord>>,
    }

    impl ScriptedConnections {
        pub(crate) fn new(snapshots: Vec<Result<Vec<ConnectionRecord>>>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots.into()),
                last: Mutex::new(Vec::new()),
            }
        }
    }

    impl ConnectionSnapshotSource for ScriptedConnections {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn priority(&self) -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            true
        }

        fn snapshot(&self) -> Result<Vec<ConnectionRecord>> {
            match self.snapshots.lock().pop_front() {
                Some(Ok(rows)) => {
                    *self.last.lock() = rows.clone();
                    Ok(rows)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().clone()),
            }
        }

        fn interface_count(&self) -> usize {
            1
        }
    }

    pub(crate) struct FixedProcesses(pub(crate) Vec<ProcessRecord>);

    impl ProcessSnapshotSource for FixedProcesses {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn priority(&self) -> BackendPriority {
            BackendPriority::Fallback
        }

        fn snapshot(&self) -> Result<Vec<ProcessRecord>> {
            Ok(self.0.clone())
        }
    }

    pub(crate) fn processes() -> Vec<ProcessRecord> {
        vec![
            ProcessRecord::new(10, "curl".to_string()),
            ProcessRecord::new(1234, "chrome".to_string()),
        ]
    }

    pub(crate) fn monitor_with(
        snapshots: Vec<Result<Vec<ConnectionRecord>>>,
        activity: ActivityConfig,
    ) -> NetworkMonitor {
        monitor_over(
            Arc::new(ScriptedConnections::new(snapshots)),
            activity,
            Duration::from_secs(5),
        )
    }

    fn monitor_over(
        connections: Arc<dyn ConnectionSnapshotSource>,
        activity: ActivityConfig,
        snapshot_timeout: Duration,
    ) -> NetworkMonitor {
        NetworkMonitor::new(
            connections,
            Arc::new(FixedProcesses(processes())),
            Arc::new(DnsCache::new(
                Arc::new(ScriptedResolver::always("dns.google")),
                &DnsConfig::default(),
            )),
            ActivityEstimator::with_rng(&activity, StdRng::seed_from_u64(3)),
            snapshot_timeout,
        )
    }

    /// Connection source whose every read blocks for `delay`
    struct StalledConnections {
        delay: Duration,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ConnectionSnapshotSource for StalledConnections {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn priority(&self) -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            true
        }

        fn snapshot(&self) -> Result<Vec<ConnectionRecord>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        fn interface_count(&self) -> usize {
            1
        }
    }

    fn packets(events: &[MonitorEvent]) -> Vec<&FlowEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Packet(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn established(pid: u32) -> ConnectionRecord {
        record(Protocol::Tcp, "10.0.0.1:5000", "93.1.1.1:443", ConnectionState::Established, pid)
    }

    #[tokio::test]
    async fn test_new_flow_becomes_packet() {
        let mut monitor = monitor_with(
            vec![Ok(Vec::new()), Ok(vec![established(10)])],
            ActivityConfig::default(),
        );

        let first = monitor.poll_cycle().await;
        assert!(packets(&first).is_empty());

        let second = monitor.poll_cycle().await;
        let packets = packets(&second);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].direction, Direction::Outgoing);
        assert!(!packets[0].is_activity);
        assert_eq!(packets[0].size, 1);
        assert_eq!(packets[0].flags, "ESTABLISHED");
        assert_eq!(packets[0].domain.as_deref(), Some("dns.google"));
        assert_eq!(packets[0].service.as_deref(), Some("HTTPS"));
        assert_eq!(packets[0].details, "TCP 5000 → 443");
    }

    #[tokio::test]
    async fn test_cycle_event_order() {
        let mut monitor = monitor_with(vec![Ok(vec![established(10)])], ActivityConfig::default());
        let events = monitor.poll_cycle().await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["packet", "connections", "connection", "processes"]);

        match &events[1] {
            MonitorEvent::Connections(rows) => {
                assert_eq!(rows[0].domain.as_deref(), Some("dns.google"))
            }
            other => panic!("unexpected {:?}", other),
        }
        match &events[3] {
            MonitorEvent::Processes(list) => {
                let curl = list.iter().find(|p| p.pid == 10).unwrap();
                assert_eq!(curl.connection_count, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_process_scope_filters_and_skips_empty_batch() {
        let mut monitor = monitor_with(vec![Ok(vec![established(10)])], ActivityConfig::default());
        monitor.set_scope(Scope::Process(1234));

        let events = monitor.poll_cycle().await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["processes"]);
        match &events[0] {
            MonitorEvent::Processes(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].pid, 1234);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_global_scope_always_emits_batch() {
        let mut monitor = monitor_with(vec![Ok(Vec::new())], ActivityConfig::default());
        let events = monitor.poll_cycle().await;
        assert!(matches!(&events[0], MonitorEvent::Connections(rows) if rows.is_empty()));
    }

    #[tokio::test]
    async fn test_failed_snapshot_keeps_diff_state() {
        let mut monitor = monitor_with(
            vec![
                Ok(vec![established(10)]),
                Err(anyhow::anyhow!("netstat exited with status 1")),
                Ok(vec![established(10)]),
            ],
            ActivityConfig::default(),
        );

        assert_eq!(packets(&monitor.poll_cycle().await).len(), 1);
        let failed = monitor.poll_cycle().await;
        assert!(packets(&failed).is_empty());
        assert!(packets(&monitor.poll_cycle().await).is_empty());
    }

    #[tokio::test]
    async fn test_event_ids_increase() {
        let second = record(Protocol::Udp, "10.0.0.1:6000", "8.8.8.8:53", Established, 10);
        let mut monitor = monitor_with(
            vec![Ok(vec![established(10)]), Ok(vec![established(10), second])],
            ActivityConfig::default(),
        );

        let mut ids = Vec::new();
        for _ in 0..2 {
            ids.extend(packets(&monitor.poll_cycle().await).iter().map(|p| p.id));
        }
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_activity_only_in_process_scope() {
        let activity = ActivityConfig {
            probability: 1.0,
            ..ActivityConfig::default()
        };
        let mut monitor = monitor_with(vec![Ok(vec![established(10)])], activity);

        assert!(monitor.activity_cycle().await.is_empty());

        monitor.set_scope(Scope::Process(10));
        let events = monitor.activity_cycle().await;
        let packets = packets(&events);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_activity);
        assert_eq!(packets[0].flags, "DATA");
        assert!((64..1064).contains(&packets[0].size));
        assert_eq!(packets[0].details, "TCP 5000 → 443 (Activity)");
    }

    #[tokio::test]
    async fn test_start_fails_on_broken_source() {
        let mut monitor = monitor_with(
            vec![Err(anyhow::anyhow!("permission denied"))],
            ActivityConfig::default(),
        );
        assert!(monitor.start().await.is_err());
        assert!(!monitor.is_running());

        monitor.start().await.unwrap();
        assert!(monitor.is_running());
        assert_eq!(monitor.interfaces(), 1);
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_stalled_read_is_not_stacked() {
        let source = Arc::new(StalledConnections {
            delay: Duration::from_millis(400),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });
        let mut monitor = monitor_over(
            Arc::clone(&source) as Arc<dyn ConnectionSnapshotSource>,
            ActivityConfig::default(),
            Duration::from_millis(50),
        );

        for _ in 0..3 {
            let events = monitor.poll_cycle().await;
            assert!(packets(&events).is_empty());
        }
        assert_eq!(source.started.load(Ordering::SeqCst), 1);
        assert_eq!(source.finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(source.finished.load(Ordering::SeqCst), 1);

        // The abandoned read returned, so the next poll tries again
        monitor.poll_cycle().await;
        assert_eq!(source.started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_incoming_flow_event() {
        let row = record(Protocol::Tcp, "10.0.0.1:22", "10.0.0.9:22", SynReceived, 5);
        let event = build_flow_event(9, &row, 1, false, None);
        assert_eq!(event.direction, Direction::Incoming);
        assert_eq!(event.flags, "SYN_RECEIVED");
        assert_eq!(event.source, row.key.local());
        assert_eq!(event.destination, row.key.remote());
        assert_eq!(event.service.as_deref(), Some("SSH"));
    }
}
