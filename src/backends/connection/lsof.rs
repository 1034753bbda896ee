// lsof-based connection source

use super::command::run_command;
use super::{ConnectionSnapshotSource, parse_endpoint, unspecified_like};
use crate::backends::BackendPriority;
use crate::connection::{ConnectionRecord, ConnectionState, FlowKey, Protocol};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::process::Command;
use std::time::Duration;

/// Connection source using the lsof command
///
/// This source executes `lsof -i -n -P -F pcnPT` and parses the field
/// output. Every open file starts with an `f` line; protocol (`P`), name
/// (`n`) and TCP state (`TST=`) follow it.
pub struct LsofSource {
    /// lsof is killed if it runs longer (it can hang on a stale NFS mount)
    timeout: Duration,
}

/// Fields collected for the open file currently being parsed
#[derive(Default)]
struct PendingFile {
    protocol: Option<Protocol>,
    name: Option<String>,
    state: Option<ConnectionState>,
}

impl LsofSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("lsof command not found");
        }
        Ok(Self { timeout })
    }

    /// Parse lsof -F output format
    ///
    /// Format:
    /// p1234        <- PID
    /// cfirefox     <- Command name
    /// f45          <- File descriptor (starts a new file)
    /// PTCP         <- Protocol
    /// n127.0.0.1:50000->93.184.216.34:443  <- Network address
    /// TST=ESTABLISHED  <- TCP state
    pub fn parse_output(output: &str, seen: DateTime<Utc>) -> Vec<ConnectionRecord> {
        let mut rows = Vec::new();
        let mut current_pid: Option<u32> = None;
        let mut pending = PendingFile::default();

        for line in output.lines() {
            if line.is_empty() {
                continue;
            }

            let Some(marker) = line.get(..1) else {
                continue;
            };
            let value = &line[1..];

            match marker {
                "p" => {
                    Self::flush(&mut pending, current_pid, seen, &mut rows);
                    current_pid = value.parse().ok();
                }
                "f" => {
                    Self::flush(&mut pending, current_pid, seen, &mut rows);
                }
                "P" => pending.protocol = value.parse().ok(),
                "n" => pending.name = Some(value.to_string()),
                "T" => {
                    if let Some(state) = value.strip_prefix("ST=") {
                        pending.state = Some(ConnectionState::parse(state));
                    }
                }
                _ => {
                    // Ignore other markers (c for command, t for type, ...)
                }
            }
        }

        Self::flush(&mut pending, current_pid, seen, &mut rows);
        rows
    }

    fn flush(
        pending: &mut PendingFile,
        pid: Option<u32>,
        seen: DateTime<Utc>,
        rows: &mut Vec<ConnectionRecord>,
    ) {
        let file = std::mem::take(pending);
        let (Some(pid), Some(protocol), Some(name)) = (pid, file.protocol, file.name) else {
            return;
        };

        if let Some(row) = Self::parse_connection(&name, protocol, file.state, pid, seen) {
            rows.push(row);
        }
    }

    /// Parse connection string from lsof
    ///
    /// Format examples:
    /// - "127.0.0.1:8080->93.184.216.34:80" (connected socket)
    /// - "*:8080" (listening socket)
    /// - "[::1]:8080->[::1]:54321" (IPv6)
    fn parse_connection(
        name: &str,
        protocol: Protocol,
        state: Option<ConnectionState>,
        pid: u32,
        seen: DateTime<Utc>,
    ) -> Option<ConnectionRecord> {
        let (local, remote) = match name.split_once("->") {
            Some((local, remote)) => (local, Some(remote)),
            None => (name, None),
        };

        let (local_address, local_port) = match parse_endpoint(local) {
            Some(addr) => addr,
            None => {
                log::debug!("Failed to parse local address '{}'", local);
                return None;
            }
        };

        let (remote_address, remote_port) = match remote {
            Some(remote) => parse_endpoint(remote)?,
            // Unconnected UDP sockets never form a flow
            None if protocol == Protocol::Udp => return None,
            None => (unspecified_like(&local_address), 0),
        };

        let key = FlowKey {
            protocol,
            local_address,
            local_port,
            remote_address,
            remote_port,
        };

        // UDP has no TST field; a connected UDP socket counts as established
        let state = state.unwrap_or(match protocol {
            Protocol::Udp => ConnectionState::Established,
            Protocol::Tcp => ConnectionState::Unknown,
        });

        Some(ConnectionRecord::new(key, state, pid, seen))
    }
}

impl ConnectionSnapshotSource for LsofSource {
    fn name(&self) -> &'static str {
        "lsof"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Good // Works well, but spawns external process
    }

    fn is_available() -> bool {
        Command::new("which")
            .arg("lsof")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn snapshot(&self) -> Result<Vec<ConnectionRecord>> {
        // -i: Internet connections only
        // -n: Don't resolve hostnames (the DNS cache does that)
        // -P: Don't resolve port names
        // -F pcnPT: Field output (pid, command, name, protocol, TCP info)
        let output = run_command("lsof", &["-i", "-n", "-P", "-F", "pcnPT"], self.timeout)?;

        // lsof exits 1 when some files could not be listed; output is still usable
        if !output.status.success() && output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("lsof command failed: {}", stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self::parse_output(&stdout, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "p412
cfirefox
f45
PTCP
n192.168.1.5:50000->93.184.216.34:443
TST=ESTABLISHED
TQR=0
TQS=0
f46
PTCP
n*:8080
TST=LISTEN
f47
PUDP
n*:5353
f48
PUDP
n192.168.1.5:61000->1.1.1.1:53
p913
csshd
f3
PTCP
n[::1]:22->[::1]:53122
TST=CLOSE_WAIT
";

    #[test]
    fn test_parse_sample_output() {
        let rows = LsofSource::parse_output(SAMPLE, Utc::now());
        assert_eq!(rows.len(), 4);

        assert_eq!(rows[0].owner_pid, 412);
        assert_eq!(rows[0].key.remote_port, 443);
        assert_eq!(rows[0].state, ConnectionState::Established);

        assert_eq!(rows[1].state, ConnectionState::Listening);
        assert_eq!(rows[1].key.local_port, 8080);
        assert!(rows[1].key.remote_address.is_unspecified());

        assert_eq!(rows[2].key.protocol, Protocol::Udp);
        assert_eq!(rows[2].state, ConnectionState::Established);

        assert_eq!(rows[3].owner_pid, 913);
        assert_eq!(rows[3].state, ConnectionState::CloseWait);
        assert!(rows[3].key.local_address.is_ipv6());
    }

    #[test]
    fn test_unconnected_udp_is_dropped() {
        let rows = LsofSource::parse_output(SAMPLE, Utc::now());
        assert!(!rows.iter().any(|r| r.key.local_port == 5353));
    }

    #[test]
    fn test_missing_pid_drops_files() {
        let rows = LsofSource::parse_output("f3\nPTCP\nn1.2.3.4:1->5.6.7.8:2\n", Utc::now());
        assert!(rows.is_empty());
    }
}
