//! Command-line point parsing shared by the two binaries.
//!
//! Points are numbered flags: `--local3=10.0.0.1:8080` configures point id 3.
//! The functions here receive the argument with its flag prefix already
//! stripped, e.g. `3=10.0.0.1:8080`.

use std::net::{Ipv4Addr, SocketAddr};

use crate::connect_id::PointId;

/// Parses `<id>=<host>:<port>`. The host part is not resolved or validated
/// here; the egress accepts DNS names as dial targets.
pub fn parse_point(arg: &str) -> Option<(PointId, String, u16)> {
    let (id_part, addr_part) = arg.split_once('=')?;
    let id: PointId = id_part.parse().ok()?;

    let (host, port_part) = addr_part.split_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port_part.parse().ok()?;

    Some((id, host.to_owned(), port))
}

/// Parses `<id>=<ipv4>:<port>` into a bindable endpoint. The ingress listens
/// here, so a literal IPv4 address is required.
pub fn parse_tcp_point(arg: &str) -> Option<(PointId, SocketAddr)> {
    let (id, host, port) = parse_point(arg)?;
    let ip: Ipv4Addr = host.parse().ok()?;
    Some((id, SocketAddr::from((ip, port))))
}

/// Parses `<ipv4>:<port>[,<port>...]` into one endpoint per listed port.
/// `<ipv4>:` with no ports is accepted and yields an empty list; the
/// binaries treat that the same as a missing `--trunk` argument.
pub fn parse_trunk(arg: &str) -> Option<Vec<SocketAddr>> {
    let (ip_part, ports_part) = arg.split_once(':')?;
    if ip_part.is_empty() {
        return None;
    }
    let ip: Ipv4Addr = ip_part.parse().ok()?;

    let mut points = Vec::new();
    if !ports_part.is_empty() {
        for port_part in ports_part.split(',') {
            if port_part.is_empty() {
                return None;
            }
            let port: u16 = port_part.parse().ok()?;
            points.push(SocketAddr::from((ip, port)));
        }
    }
    Some(points)
}
