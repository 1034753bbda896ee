//! Monitor service: mode control, event fan-out and the query interface
//!
//! The service owns the long-lived [`NetworkMonitor`], the
//! [`TelemetryStore`] and the [`EventBus`]. Timer handlers run a cycle
//! under the monitor lock, fold the resulting events into the store and
//! then publish them, so a subscriber never sees an event the store does
//! not yet reflect.

use crate::config::Config;
use crate::connection::{ConnectionRecord, FlowEvent};
use crate::events::{EventBus, MonitorEvent};
use crate::monitor::{NetworkMonitor, Scope};
use crate::process::ProcessRecord;
use crate::scheduler::Scheduler;
use crate::store::{
    DomainStat, GeneralStats, PortStat, ProtocolStat, RecentActivity, TelemetryStore,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Page size for flow event and connection listings
pub const DEFAULT_LIMIT: usize = 50;
pub const DEFAULT_OFFSET: usize = 0;

/// Domains in a top-domains listing, and in each stats broadcast
pub const DEFAULT_TOP_DOMAINS: usize = 10;

/// Window for recent activity
pub const DEFAULT_RECENT_MINUTES: u64 = 5;

/// Flags read by query calls without taking the monitor lock
#[derive(Default)]
struct Status {
    running: AtomicBool,
    interfaces: AtomicUsize,
}

/// Everything the query interface knows, in one serializable value
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub scope: Scope,
    pub connection_source: &'static str,
    pub process_source: &'static str,
    pub stats: GeneralStats,
    pub protocols: Vec<ProtocolStat>,
    pub ports: Vec<PortStat>,
    pub top_domains: Vec<DomainStat>,
    pub recent_packets: Vec<FlowEvent>,
    pub connections: Vec<ConnectionRecord>,
    pub processes: Vec<ProcessRecord>,
    pub recent: RecentActivity,
    /// `None` until a process poll has landed; an empty `processes` after
    /// that means the target was not found
    pub last_process_poll: Option<DateTime<Utc>>,
    pub dns_cache_entries: usize,
    pub dns_lookups: u64,
    pub skipped_ticks: u64,
}

pub struct MonitorService {
    config: Config,
    monitor: Arc<tokio::sync::Mutex<NetworkMonitor>>,
    store: Arc<Mutex<TelemetryStore>>,
    bus: EventBus,
    status: Arc<Status>,
    scheduler: tokio::sync::Mutex<Option<Scheduler>>,
    skipped_ticks: Arc<AtomicU64>,
}

impl MonitorService {
    /// Select sources per `config` and build an idle service
    pub fn new(config: Config) -> Result<Self> {
        let monitor = NetworkMonitor::from_config(&config)?;
        Ok(Self::with_monitor(config, monitor))
    }

    pub fn with_monitor(config: Config, monitor: NetworkMonitor) -> Self {
        Self {
            store: Arc::new(Mutex::new(TelemetryStore::new(config.max_items))),
            bus: EventBus::new(config.event_buffer),
            monitor: Arc::new(tokio::sync::Mutex::new(monitor)),
            status: Arc::new(Status::default()),
            scheduler: tokio::sync::Mutex::new(None),
            skipped_ticks: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.bus.subscribe()
    }

    // ---- mode control ----

    /// Monitor every process. When already monitoring globally this only
    /// clears the store.
    pub async fn start_global(&self) -> Result<()> {
        let already_global = {
            let monitor = self.monitor.lock().await;
            monitor.is_running() && monitor.scope() == Scope::Global
        };

        if already_global {
            self.store.lock().clear();
            log::info!("Already monitoring globally, cleared telemetry");
            return Ok(());
        }

        self.restart(Scope::Global).await
    }

    /// Monitor a single process. Flow tracking starts from scratch so the
    /// process's existing connections are reported as new.
    pub async fn start_process(&self, pid: u32) -> Result<()> {
        self.restart(Scope::Process(pid)).await
    }

    /// Cancel all timers. Flow tracking state and the DNS cache are kept.
    pub async fn stop(&self) {
        let scheduler = self.scheduler.lock().await.take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        self.monitor.lock().await.stop();
        self.status.running.store(false, Ordering::Relaxed);
    }

    async fn restart(&self, scope: Scope) -> Result<()> {
        self.stop().await;
        self.store.lock().clear();

        {
            let mut monitor = self.monitor.lock().await;
            monitor.set_scope(scope);
            if let Scope::Process(_) = scope {
                monitor.reset_diff();
            }
            monitor.start().await?;
            self.status
                .interfaces
                .store(monitor.interfaces(), Ordering::Relaxed);
        }

        self.status.running.store(true, Ordering::Relaxed);
        self.spawn_timers().await;

        match scope {
            Scope::Global => log::info!("Monitoring all processes"),
            Scope::Process(pid) => log::info!("Monitoring process {}", pid),
        }
        Ok(())
    }

    async fn spawn_timers(&self) {
        let mut scheduler = Scheduler::with_skip_counter(Arc::clone(&self.skipped_ticks));

        {
            let (monitor, store, bus) = self.handles();
            scheduler.every("poll", self.config.poll_interval(), move || {
                let (monitor, store, bus) =
                    (Arc::clone(&monitor), Arc::clone(&store), bus.clone());
                async move {
                    let events = monitor.lock().await.poll_cycle().await;
                    dispatch(&store, &bus, events);
                }
            });
        }

        if self.config.activity.enabled {
            let (monitor, store, bus) = self.handles();
            scheduler.every("activity", self.config.activity_interval(), move || {
                let (monitor, store, bus) =
                    (Arc::clone(&monitor), Arc::clone(&store), bus.clone());
                async move {
                    let events = monitor.lock().await.activity_cycle().await;
                    dispatch(&store, &bus, events);
                }
            });
        }

        {
            let (_, store, bus) = self.handles();
            let status = Arc::clone(&self.status);
            scheduler.every("stats", self.config.stats_interval(), move || {
                let (store, bus, status) =
                    (Arc::clone(&store), bus.clone(), Arc::clone(&status));
                async move {
                    broadcast_stats(&store, &bus, &status);
                }
            });
        }

        *self.scheduler.lock().await = Some(scheduler);
    }

    fn handles(
        &self,
    ) -> (
        Arc<tokio::sync::Mutex<NetworkMonitor>>,
        Arc<Mutex<TelemetryStore>>,
        EventBus,
    ) {
        (
            Arc::clone(&self.monitor),
            Arc::clone(&self.store),
            self.bus.clone(),
        )
    }

    // ---- manual cycles (what the timers run) ----

    pub async fn poll_once(&self) {
        let events = self.monitor.lock().await.poll_cycle().await;
        dispatch(&self.store, &self.bus, events);
    }

    pub async fn activity_once(&self) {
        let events = self.monitor.lock().await.activity_cycle().await;
        dispatch(&self.store, &self.bus, events);
    }

    pub fn broadcast_stats(&self) {
        broadcast_stats(&self.store, &self.bus, &self.status);
    }

    // ---- queries ----

    pub fn is_monitoring(&self) -> bool {
        self.status.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> GeneralStats {
        general_stats(&self.store, &self.status)
    }

    pub fn flow_events(&self, limit: usize, offset: usize) -> Vec<FlowEvent> {
        self.store.lock().flow_events(limit, offset)
    }

    pub fn connections(&self, limit: usize, offset: usize) -> Vec<ConnectionRecord> {
        self.store.lock().connections(limit, offset)
    }

    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.store.lock().processes()
    }

    pub fn process(&self, pid: u32) -> Option<ProcessRecord> {
        self.store.lock().process(pid)
    }

    pub fn protocol_stats(&self) -> Vec<ProtocolStat> {
        self.store.lock().protocol_stats()
    }

    pub fn port_stats(&self) -> Vec<PortStat> {
        self.store.lock().port_stats()
    }

    pub fn top_domains(&self, limit: usize) -> Vec<DomainStat> {
        self.store.lock().top_domains(limit)
    }

    pub fn recent_activity(&self, minutes: u64) -> RecentActivity {
        self.store.lock().recent_activity(minutes)
    }

    /// When the last process poll landed, `None` if none has since the
    /// store was last cleared
    pub fn last_process_poll(&self) -> Option<DateTime<Utc>> {
        self.store.lock().last_process_poll()
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }

    pub async fn scope(&self) -> Scope {
        self.monitor.lock().await.scope()
    }

    pub async fn dns_cache_len(&self) -> usize {
        self.monitor.lock().await.dns().len()
    }

    pub async fn summary(&self) -> Summary {
        let (scope, connection_source, process_source, dns_cache_entries, dns_lookups) = {
            let monitor = self.monitor.lock().await;
            (
                monitor.scope(),
                monitor.connection_source_name(),
                monitor.process_source_name(),
                monitor.dns().len(),
                monitor.dns().lookups(),
            )
        };

        let stats = self.stats();
        let store = self.store.lock();
        Summary {
            scope,
            connection_source,
            process_source,
            stats,
            protocols: store.protocol_stats(),
            ports: store.port_stats(),
            top_domains: store.top_domains(DEFAULT_TOP_DOMAINS),
            recent_packets: store.flow_events(DEFAULT_LIMIT, DEFAULT_OFFSET),
            connections: store.connections(DEFAULT_LIMIT, DEFAULT_OFFSET),
            processes: store.processes(),
            recent: store.recent_activity(DEFAULT_RECENT_MINUTES),
            last_process_poll: store.last_process_poll(),
            dns_cache_entries,
            dns_lookups,
            skipped_ticks: self.skipped_ticks(),
        }
    }
}

/// Fold cycle output into the store, then publish it
fn dispatch(store: &Mutex<TelemetryStore>, bus: &EventBus, events: Vec<MonitorEvent>) {
    if events.is_empty() {
        return;
    }

    {
        let mut store = store.lock();
        for event in &events {
            match event {
                MonitorEvent::Packet(packet) => store.append_flow_event(packet.clone()),
                MonitorEvent::Connections(rows) => {
                    for row in rows {
                        store.append_connection(row.clone());
                    }
                }
                MonitorEvent::Processes(processes) => {
                    for process in processes {
                        store.upsert_process(process.clone());
                    }
                    store.mark_process_poll(Utc::now());
                }
                // Single connections repeat the batch; stats are derived
                MonitorEvent::Connection(_)
                | MonitorEvent::Domains(_)
                | MonitorEvent::Stats(_) => {}
            }
        }
    }

    for event in events {
        bus.publish(event);
    }
}

fn general_stats(store: &Mutex<TelemetryStore>, status: &Status) -> GeneralStats {
    store.lock().general_stats(
        status.running.load(Ordering::Relaxed),
        status.interfaces.load(Ordering::Relaxed),
    )
}

fn broadcast_stats(store: &Mutex<TelemetryStore>, bus: &EventBus, status: &Status) {
    let stats = general_stats(store, status);
    let domains = store.lock().top_domains(DEFAULT_TOP_DOMAINS);
    bus.publish(MonitorEvent::Stats(stats));
    bus.publish(MonitorEvent::Domains(domains));
}
