// netstat-based connection source (Windows `netstat -ano` layout)

use super::command::run_command;
use super::{ConnectionSnapshotSource, parse_endpoint};
use crate::backends::BackendPriority;
use crate::connection::{ConnectionRecord, ConnectionState, FlowKey, Protocol};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Connection source that shells out to `netstat -ano`.
///
/// Expected layout, one socket per line:
///
/// ```text
///   Proto  Local Address          Foreign Address        State           PID
///   TCP    10.0.0.1:5000          93.1.1.1:443           ESTABLISHED     10
///   UDP    0.0.0.0:123            *:*                                    5678
/// ```
///
/// UDP rows carry no state column and no remote endpoint, so they are
/// skipped.
pub struct NetstatSource {
    timeout: Duration,
}

impl NetstatSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("netstat with -o (owning PID) is only available on Windows");
        }
        Ok(Self { timeout })
    }

    /// Parse the full command output
    pub fn parse_output(output: &str, seen: DateTime<Utc>) -> Vec<ConnectionRecord> {
        output
            .lines()
            .filter_map(|line| Self::parse_line(line, seen))
            .collect()
    }

    fn parse_line(line: &str, seen: DateTime<Utc>) -> Option<ConnectionRecord> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }

        // Header and banner lines fail here
        let protocol: Protocol = parts[0].parse().ok()?;
        let pid: u32 = parts[4].parse().ok()?;

        let (local_address, local_port) = parse_endpoint(parts[1])?;
        let (remote_address, remote_port) = match parse_endpoint(parts[2]) {
            Some(endpoint) => endpoint,
            None => {
                log::trace!("Skipping netstat row without remote endpoint: {}", line);
                return None;
            }
        };

        let key = FlowKey {
            protocol,
            local_address,
            local_port,
            remote_address,
            remote_port,
        };

        Some(ConnectionRecord::new(
            key,
            ConnectionState::parse(parts[3]),
            pid,
            seen,
        ))
    }
}

impl ConnectionSnapshotSource for NetstatSource {
    fn name(&self) -> &'static str {
        "netstat"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Good // Reliable, but spawns an external process per poll
    }

    fn is_available() -> bool {
        // Only the Windows netstat reports the owning PID with -o
        cfg!(target_os = "windows")
    }

    fn snapshot(&self) -> Result<Vec<ConnectionRecord>> {
        let output = run_command("netstat", &["-ano"], self.timeout)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("netstat command failed: {}", stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self::parse_output(&stdout, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1128
  TCP    10.0.0.1:5000          93.1.1.1:443           ESTABLISHED     10
  TCP    10.0.0.1:5001          140.82.112.4:443       TIME_WAIT       0
  TCP    10.0.0.1:5002          140.82.112.4:443       FIN_WAIT_2      10
  TCP    [::]:445               [::]:0                 LISTENING       4
  TCP    [::1]:49670            [::1]:49671            ESTABLISHED     7712
  UDP    0.0.0.0:123            *:*                                    5678
  UDP    [::]:500               *:*                                    4088
";

    #[test]
    fn test_parse_sample_output() {
        let rows = NetstatSource::parse_output(SAMPLE, Utc::now());
        assert_eq!(rows.len(), 6);

        let established = &rows[1];
        assert_eq!(established.key.protocol, Protocol::Tcp);
        assert_eq!(established.key.local_port, 5000);
        assert_eq!(established.key.remote_address.to_string(), "93.1.1.1");
        assert_eq!(established.key.remote_port, 443);
        assert_eq!(established.state, ConnectionState::Established);
        assert_eq!(established.owner_pid, 10);

        assert_eq!(rows[0].state, ConnectionState::Listening);
        assert_eq!(rows[2].state, ConnectionState::TimeWait);
        assert_eq!(rows[3].state, ConnectionState::FinWait2);
        assert!(rows[4].key.local_address.is_ipv6());
        assert_eq!(rows[5].owner_pid, 7712);
    }

    #[test]
    fn test_udp_rows_are_skipped() {
        let rows = NetstatSource::parse_output(SAMPLE, Utc::now());
        assert!(rows.iter().all(|r| r.key.protocol == Protocol::Tcp));
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let output = "TCP 10.0.0.1:abc 93.1.1.1:443 ESTABLISHED 10\n\
                      TCP 10.0.0.1:1 93.1.1.1:443 ESTABLISHED x\n";
        assert!(NetstatSource::parse_output(output, Utc::now()).is_empty());
    }
}
