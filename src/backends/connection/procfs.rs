// Linux procfs-based connection source

use super::ConnectionSnapshotSource;
use crate::backends::BackendPriority;
use crate::connection::{ConnectionRecord, ConnectionState, FlowKey, Protocol};
use anyhow::Result;
use chrono::{DateTime, Utc};
use procfs::process::{FDTarget, all_processes};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Connection source using the Linux /proc filesystem
///
/// This source reads socket information from:
/// - /proc/[pid]/fd/ - for socket inodes
/// - /proc/net/tcp, /proc/net/tcp6 - for TCP connections
/// - /proc/net/udp, /proc/net/udp6 - for UDP connections
///
/// Sockets whose owner cannot be read (other users' processes without
/// privileges) are reported with pid 0.
pub struct ProcfsSource;

/// A table row before owner lookup
struct RawEntry {
    protocol: Protocol,
    local: SocketAddr,
    remote: SocketAddr,
    state: String,
    inode: u64,
}

impl ProcfsSource {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("procfs not available (is /proc mounted?)");
        }
        Ok(Self)
    }

    /// Build socket inode -> PID map by scanning all processes
    fn socket_owners() -> Result<HashMap<u64, u32>> {
        let mut socket_to_pid = HashMap::new();

        for process in all_processes()?.flatten() {
            let pid = process.pid() as u32;
            if let Ok(fds) = process.fd() {
                for fd_info in fds.flatten() {
                    if let FDTarget::Socket(inode) = fd_info.target {
                        socket_to_pid.insert(inode, pid);
                    }
                }
            }
        }

        Ok(socket_to_pid)
    }

    fn read_tables() -> Vec<RawEntry> {
        let mut entries = Vec::new();

        for table in [procfs::net::tcp(), procfs::net::tcp6()] {
            match table {
                Ok(rows) => entries.extend(rows.into_iter().map(|entry| RawEntry {
                    protocol: Protocol::Tcp,
                    local: entry.local_address,
                    remote: entry.remote_address,
                    state: format!("{:?}", entry.state),
                    inode: entry.inode,
                })),
                Err(e) => log::debug!("Failed to read TCP table: {}", e),
            }
        }

        for table in [procfs::net::udp(), procfs::net::udp6()] {
            match table {
                Ok(rows) => entries.extend(rows.into_iter().map(|entry| RawEntry {
                    protocol: Protocol::Udp,
                    local: entry.local_address,
                    remote: entry.remote_address,
                    state: format!("{:?}", entry.state),
                    inode: entry.inode,
                })),
                Err(e) => log::debug!("Failed to read UDP table: {}", e),
            }
        }

        entries
    }

    fn to_record(
        entry: RawEntry,
        owners: &HashMap<u64, u32>,
        seen: DateTime<Utc>,
    ) -> Option<ConnectionRecord> {
        // Unconnected UDP sockets never form a flow
        if entry.protocol == Protocol::Udp
            && entry.remote.ip().is_unspecified()
            && entry.remote.port() == 0
        {
            return None;
        }

        let key = FlowKey {
            protocol: entry.protocol,
            local_address: entry.local.ip(),
            local_port: entry.local.port(),
            remote_address: entry.remote.ip(),
            remote_port: entry.remote.port(),
        };
        let pid = owners.get(&entry.inode).copied().unwrap_or(0);

        Some(ConnectionRecord::new(
            key,
            ConnectionState::parse(&entry.state),
            pid,
            seen,
        ))
    }
}

impl ConnectionSnapshotSource for ProcfsSource {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Best // Native Linux tables, no external process
    }

    fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }

    fn snapshot(&self) -> Result<Vec<ConnectionRecord>> {
        let owners = Self::socket_owners()?;
        let seen = Utc::now();

        Ok(Self::read_tables()
            .into_iter()
            .filter_map(|entry| Self::to_record(entry, &owners, seen))
            .collect())
    }
}
