//! Flow classification without packet inspection
//!
//! Direction, locality and service are all inferred from the connection
//! tuple alone. Every monitor source feeds its rows through these helpers so
//! the dashboard sees consistent labels regardless of backend.

use crate::connection::{Direction, Protocol};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Ports below this are treated as well-known server ports
const EPHEMERAL_FLOOR: u16 = 1024;

/// Ephemeral port heuristic.
///
/// A flow is outgoing when the local port is lower than the remote one, or
/// when a high local port talks to a well-known remote port. Everything else
/// is assumed to be a remote client reaching a local service.
pub fn classify_direction(local_port: u16, remote_port: u16) -> Direction {
    if local_port < remote_port
        || (local_port >= EPHEMERAL_FLOOR && remote_port < EPHEMERAL_FLOOR)
    {
        Direction::Outgoing
    } else {
        Direction::Incoming
    }
}

/// Determines if an IP address belongs to a local/private network
pub fn is_local_traffic(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_local_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_local_ipv6(ipv6),
    }
}

fn is_local_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_private()           // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
        || ip.is_loopback()   // 127.0.0.0/8
        || ip.is_link_local() // 169.254.0.0/16
        || ip.is_broadcast()  // 255.255.255.255
        || ip.is_unspecified() // 0.0.0.0
}

fn is_local_ipv6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback()                  // ::1
        || ip.is_unicast_link_local() // fe80::/10
        || ip.is_unspecified()        // ::
        || (ip.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7
}

/// Well-known service for a remote port, if any
pub fn service_for_port(protocol: Protocol, port: u16) -> Option<&'static str> {
    let name = match (protocol, port) {
        (_, 53) => "DNS",
        (Protocol::Tcp, 21) => "FTP",
        (Protocol::Tcp, 22) => "SSH",
        (Protocol::Tcp, 23) => "Telnet",
        (Protocol::Tcp, 25) | (Protocol::Tcp, 587) => "SMTP",
        (Protocol::Tcp, 80) | (Protocol::Tcp, 8080) => "HTTP",
        (Protocol::Tcp, 110) | (Protocol::Tcp, 995) => "POP3",
        (Protocol::Tcp, 143) | (Protocol::Tcp, 993) => "IMAP",
        (Protocol::Tcp, 443) | (Protocol::Tcp, 8443) => "HTTPS",
        (Protocol::Tcp, 445) => "SMB",
        (Protocol::Tcp, 3306) => "MySQL",
        (Protocol::Tcp, 3389) => "RDP",
        (Protocol::Tcp, 5432) => "PostgreSQL",
        (Protocol::Tcp, 6379) => "Redis",
        (Protocol::Udp, 67) | (Protocol::Udp, 68) => "DHCP",
        (Protocol::Udp, 123) => "NTP",
        (Protocol::Udp, 161) | (Protocol::Udp, 162) => "SNMP",
        (Protocol::Udp, 443) => "QUIC",
        (Protocol::Udp, 514) => "Syslog",
        (Protocol::Udp, 5353) => "mDNS",
        _ => return None,
    };
    Some(name)
}
