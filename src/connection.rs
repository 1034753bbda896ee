// Connection-table rows, flow identity and flow events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // netstat prints "TCP"/"tcp6", lsof prints "TCP"/"UDP"
        let lower = s.trim().to_ascii_lowercase();
        if lower.starts_with("tcp") {
            Ok(Protocol::Tcp)
        } else if lower.starts_with("udp") {
            Ok(Protocol::Udp)
        } else {
            anyhow::bail!("Unknown protocol: {}", s)
        }
    }
}

/// TCP-style socket state as reported by the OS connection table
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[serde(rename = "ESTABLISHED")]
    Established,
    #[serde(rename = "LISTENING")]
    Listening,
    #[serde(rename = "SYN_SENT")]
    SynSent,
    #[serde(rename = "SYN_RECEIVED")]
    SynReceived,
    #[serde(rename = "FIN_WAIT_1")]
    FinWait1,
    #[serde(rename = "FIN_WAIT_2")]
    FinWait2,
    #[serde(rename = "TIME_WAIT")]
    TimeWait,
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "CLOSE_WAIT")]
    CloseWait,
    #[serde(rename = "LAST_ACK")]
    LastAck,
    #[serde(rename = "CLOSING")]
    Closing,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ConnectionState {
    /// Parse any of the spellings used by netstat, lsof and procfs.
    ///
    /// Matching ignores case and underscores, so `FIN_WAIT_2`, `FinWait2`
    /// and `finwait2` are the same state. Unrecognized names map to
    /// `Unknown` rather than failing the whole row.
    pub fn parse(s: &str) -> Self {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_uppercase();

        match normalized.as_str() {
            "ESTABLISHED" => ConnectionState::Established,
            "LISTEN" | "LISTENING" => ConnectionState::Listening,
            "SYNSENT" => ConnectionState::SynSent,
            "SYNRECV" | "SYNRECEIVED" | "NEWSYNRECV" => ConnectionState::SynReceived,
            "FINWAIT1" => ConnectionState::FinWait1,
            "FINWAIT2" => ConnectionState::FinWait2,
            "TIMEWAIT" => ConnectionState::TimeWait,
            "CLOSE" | "CLOSED" => ConnectionState::Closed,
            "CLOSEWAIT" => ConnectionState::CloseWait,
            "LASTACK" => ConnectionState::LastAck,
            "CLOSING" => ConnectionState::Closing,
            _ => ConnectionState::Unknown,
        }
    }

    /// States that represent an ongoing session
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Established
                | ConnectionState::CloseWait
                | ConnectionState::FinWait1
                | ConnectionState::FinWait2
        )
    }

    /// Sockets that never carry traffic worth reporting as a new flow
    pub fn is_silent(&self) -> bool {
        matches!(self, ConnectionState::Listening | ConnectionState::TimeWait)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Listening => "LISTENING",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynReceived => "SYN_RECEIVED",
            ConnectionState::FinWait1 => "FIN_WAIT_1",
            ConnectionState::FinWait2 => "FIN_WAIT_2",
            ConnectionState::TimeWait => "TIME_WAIT",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::LastAck => "LAST_ACK",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a flow across polls
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowKey {
    pub protocol: Protocol,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
}

impl FlowKey {
    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.local_port)
    }

    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.local(), self.remote())
    }
}

/// One row of a connection snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    #[serde(flatten)]
    pub key: FlowKey,
    pub state: ConnectionState,
    #[serde(rename = "pid")]
    pub owner_pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ConnectionRecord {
    /// Build a row observed at `seen`. `first_seen` is later replaced by the
    /// diff engine with the time the flow was first tracked.
    pub fn new(key: FlowKey, state: ConnectionState, owner_pid: u32, seen: DateTime<Utc>) -> Self {
        Self {
            key,
            state,
            owner_pid,
            domain: None,
            first_seen: seen,
            last_seen: seen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A "packet" on the dashboard: either a newly observed flow or an
/// estimated burst of activity on an existing one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub size: u64,
    pub direction: Direction,
    pub flags: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub is_activity: bool,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}
