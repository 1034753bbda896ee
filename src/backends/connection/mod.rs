// Connection snapshot sources
//
// Each source reads the OS connection table its own way and returns the
// rows in a common shape:
// - procfs: /proc/net/{tcp,tcp6,udp,udp6} plus an fd scan for owners (Linux)
// - netstat: `netstat -ano` output (Windows layout)
// - lsof: `lsof -i -n -P -F pcnPT` field output (macOS, Linux)
// - synthetic: randomly evolving flows, no OS access

use super::{BackendPriority, SourceInfo, pick};
use crate::connection::ConnectionRecord;
use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

#[cfg(any(feature = "source-lsof", feature = "source-netstat"))]
mod command;
#[cfg(feature = "source-lsof")]
pub mod lsof;
#[cfg(feature = "source-netstat")]
pub mod netstat;
#[cfg(target_os = "linux")]
pub mod procfs;

/// Produces point-in-time reads of the connection table
pub trait ConnectionSnapshotSource: Send + Sync {
    /// Source name (e.g., "procfs", "netstat")
    fn name(&self) -> &'static str;

    /// Source priority for auto-selection
    fn priority(&self) -> BackendPriority;

    /// Check if this source works on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Read the current connection table.
    ///
    /// Rows without a remote endpoint are only kept for TCP (listeners);
    /// unconnected UDP sockets are dropped because they never form a flow.
    fn snapshot(&self) -> Result<Vec<ConnectionRecord>>;

    /// Interfaces covered by this source
    fn interface_count(&self) -> usize {
        super::count_interfaces()
    }
}

/// Detect all connection sources compiled into this build
pub fn detect_connection_sources() -> Vec<SourceInfo> {
    let mut sources = Vec::new();

    #[cfg(target_os = "linux")]
    sources.push(SourceInfo {
        name: "procfs",
        priority: BackendPriority::Best,
        available: procfs::ProcfsSource::is_available(),
    });

    #[cfg(feature = "source-netstat")]
    sources.push(SourceInfo {
        name: "netstat",
        priority: BackendPriority::Good,
        available: netstat::NetstatSource::is_available(),
    });

    #[cfg(feature = "source-lsof")]
    sources.push(SourceInfo {
        name: "lsof",
        priority: BackendPriority::Good,
        available: lsof::LsofSource::is_available(),
    });

    sources.push(SourceInfo {
        name: "synthetic",
        priority: BackendPriority::Fallback,
        available: true,
    });

    sources
}

/// Select a connection source by name, or the best available one.
///
/// The synthetic source is never auto-selected; it has to be asked for.
/// Sources that run an external command kill it after `command_timeout`.
pub fn select_connection_source(
    preference: Option<&str>,
    command_timeout: Duration,
) -> Result<Box<dyn ConnectionSnapshotSource>> {
    let detected: Vec<SourceInfo> = detect_connection_sources()
        .into_iter()
        .filter(|info| preference.is_some() || info.name != "synthetic")
        .collect();

    let info = pick(&detected, preference).ok_or_else(|| match preference {
        Some(name) => anyhow::anyhow!("Unknown connection source: {}", name),
        None => anyhow::anyhow!("No connection source available on this system"),
    })?;

    create_connection_source(info.name, command_timeout)
}

#[cfg_attr(
    not(any(feature = "source-lsof", feature = "source-netstat")),
    allow(unused_variables)
)]
fn create_connection_source(
    name: &str,
    command_timeout: Duration,
) -> Result<Box<dyn ConnectionSnapshotSource>> {
    match name {
        #[cfg(target_os = "linux")]
        "procfs" => Ok(Box::new(procfs::ProcfsSource::new()?)),
        #[cfg(feature = "source-netstat")]
        "netstat" => Ok(Box::new(netstat::NetstatSource::new(command_timeout)?)),
        #[cfg(feature = "source-lsof")]
        "lsof" => Ok(Box::new(lsof::LsofSource::new(command_timeout)?)),
        "synthetic" => Ok(Box::new(super::synthetic::SyntheticSource::new())),
        _ => Err(anyhow::anyhow!("Unknown connection source: {}", name)),
    }
}

/// Parse `address:port` as printed by netstat and lsof.
///
/// Accepts `1.2.3.4:80`, `[::1]:443`, `[fe80::1%4]:445` and `*:8080`.
/// Returns `None` for a fully wildcard endpoint (`*:*`).
pub(crate) fn parse_endpoint(s: &str) -> Option<(IpAddr, u16)> {
    let (host, port) = s.trim().rsplit_once(':')?;

    let port: u16 = match port {
        "*" => 0,
        p => p.parse().ok()?,
    };

    let ip = if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        // Drop the IPv6 zone id
        let inner = inner.split('%').next().unwrap_or(inner);
        IpAddr::V6(inner.parse::<Ipv6Addr>().ok()?)
    } else if host == "*" {
        if port == 0 {
            return None;
        }
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse().ok()?
    };

    Some((ip, port))
}

/// Unspecified remote endpoint in the same address family as `local`
pub(crate) fn unspecified_like(local: &IpAddr) -> IpAddr {
    if local.is_ipv6() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}
