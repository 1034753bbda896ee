// Monitor event stream

use crate::connection::{ConnectionRecord, FlowEvent};
use crate::process::ProcessRecord;
use crate::store::{DomainStat, GeneralStats};
use serde::Serialize;
use tokio::sync::broadcast;

/// Everything the monitor publishes, serialized as `{"event": .., "data": ..}`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum MonitorEvent {
    Packet(FlowEvent),
    Connection(ConnectionRecord),
    Connections(Vec<ConnectionRecord>),
    Processes(Vec<ProcessRecord>),
    Domains(Vec<DomainStat>),
    Stats(GeneralStats),
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::Packet(_) => "packet",
            MonitorEvent::Connection(_) => "connection",
            MonitorEvent::Connections(_) => "connections",
            MonitorEvent::Processes(_) => "processes",
            MonitorEvent::Domains(_) => "domains",
            MonitorEvent::Stats(_) => "stats",
        }
    }
}

/// Fan-out of monitor events to any number of subscribers.
///
/// Publishing never blocks. A subscriber that falls more than `capacity`
/// events behind loses the oldest ones and gets `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    /// Send `event` to every current subscriber; returns how many got it
    pub fn publish(&self, event: MonitorEvent) -> usize {
        // Err only means nobody is listening right now
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
