//! Parsers for `ip route` and `nmcli` output.
//!
//! Unexpected shapes are hard errors: guessing at network topology is how a
//! reconciler ends up deleting the wrong address.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use super::NetworkError;

const ROUTE_TYPES: &[&str] = &[
    "unicast",
    "unreachable",
    "blackhole",
    "prohibit",
    "throw",
    "local",
    "broadcast",
    "multicast",
    "anycast",
    "nat",
];

const VALUED_KEYS: &[&str] = &[
    "via", "dev", "proto", "scope", "src", "metric", "table", "pref", "mtu", "advmss", "realm",
    "weight", "expires", "tos", "dsfield",
];

/// One IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network; `None` for the default route.
    pub destination: Option<Ipv4Network>,
    /// Next hop.
    pub via: Option<Ipv4Addr>,
    /// Output device.
    pub dev: Option<String>,
    /// Routing protocol (`dhcp`, `kernel`, `static`, ...).
    pub proto: Option<String>,
    /// Route scope.
    pub scope: Option<String>,
    /// Preferred source address.
    pub src: Option<Ipv4Addr>,
    /// Route metric.
    pub metric: Option<u32>,
}

/// An address bound to a device through DHCP.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DhcpLease {
    /// Device holding the lease.
    pub device: String,
    /// Leased address.
    pub address: Ipv4Addr,
    /// Prefix length the address was bound with.
    pub prefix: u8,
}

/// One row of `nmcli -t -f NAME,UUID,TYPE,DEVICE connection show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Human-readable profile name.
    pub name: String,
    /// Stable connection identifier.
    pub uuid: String,
    /// Connection type, for example `802-3-ethernet`.
    pub kind: String,
    /// Active device, if the profile is bound to one.
    pub device: Option<String>,
}

/// Current IPv4 settings of a connection profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// `ipv4.addresses`.
    pub addresses: String,
    /// `ipv4.gateway`.
    pub gateway: String,
    /// `ipv4.dns`.
    pub dns: String,
    /// `ipv4.method`.
    pub method: String,
    /// `connection.autoconnect`.
    pub autoconnect: String,
    /// `ipv4.route-metric`.
    pub metric: String,
}

fn route_error(line: &str, reason: &'static str) -> NetworkError {
    NetworkError::Parse {
        command: "ip route",
        line: line.to_owned(),
        reason,
    }
}

fn parse_ipv4(line: &str, token: Option<&str>, reason: &'static str) -> Result<Ipv4Addr, NetworkError> {
    token
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| route_error(line, reason))
}

/// Parses the output of `ip -4 route show`.
///
/// # Errors
///
/// Returns [`NetworkError::Parse`] when a line has no recognisable
/// destination or a malformed address value.
pub fn parse_routes(output: &str) -> Result<Vec<Route>, NetworkError> {
    let mut routes = Vec::new();
    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let mut tokens = line.split_whitespace().peekable();
        if tokens.peek().is_some_and(|token| ROUTE_TYPES.contains(token)) {
            tokens.next();
        }
        let destination = match tokens.next() {
            Some("default") => None,
            Some(dest) => Some(
                dest.parse::<Ipv4Network>()
                    .map_err(|_| route_error(line, "destination is not an IPv4 network"))?,
            ),
            None => return Err(route_error(line, "empty route")),
        };

        let mut route = Route {
            destination,
            via: None,
            dev: None,
            proto: None,
            scope: None,
            src: None,
            metric: None,
        };
        while let Some(key) = tokens.next() {
            if !VALUED_KEYS.contains(&key) {
                continue;
            }
            let value = tokens.next();
            match key {
                "via" => route.via = Some(parse_ipv4(line, value, "gateway is not IPv4")?),
                "src" => route.src = Some(parse_ipv4(line, value, "source is not IPv4")?),
                "dev" => route.dev = value.map(str::to_owned),
                "proto" => route.proto = value.map(str::to_owned),
                "scope" => route.scope = value.map(str::to_owned),
                "metric" => {
                    route.metric = Some(
                        value
                            .and_then(|metric| metric.parse().ok())
                            .ok_or_else(|| route_error(line, "metric is not a number"))?,
                    );
                }
                _ => {}
            }
        }
        routes.push(route);
    }
    Ok(routes)
}

/// Gateway of the first default route.
///
/// # Errors
///
/// Returns [`NetworkError::NoDefaultRoute`] when no default route has a
/// next hop, or a parse error for malformed output.
pub fn default_gateway(output: &str) -> Result<Ipv4Addr, NetworkError> {
    parse_routes(output)?
        .into_iter()
        .find(|route| route.destination.is_none())
        .and_then(|route| route.via)
        .ok_or(NetworkError::NoDefaultRoute)
}

/// DHCP-assigned addresses on `device`.
///
/// Each lease's prefix comes from the connected-subnet route sharing its
/// source address, falling back to `/32`.
#[must_use]
pub fn dhcp_leases(routes: &[Route], device: &str) -> Vec<DhcpLease> {
    let on_device = |route: &&Route| route.dev.as_deref() == Some(device);
    let sources: BTreeSet<Ipv4Addr> = routes
        .iter()
        .filter(on_device)
        .filter(|route| route.proto.as_deref() == Some("dhcp"))
        .filter_map(|route| route.src)
        .collect();

    sources
        .into_iter()
        .map(|address| {
            let prefix = routes
                .iter()
                .filter(on_device)
                .filter(|route| route.src == Some(address))
                .filter_map(|route| route.destination)
                .filter(|net| net.prefix() < 32 && net.contains(address))
                .map(|net| net.prefix())
                .max()
                .unwrap_or(32);
            DhcpLease {
                device: device.to_owned(),
                address,
                prefix,
            }
        })
        .collect()
}

/// Addresses the kernel bound a connected-subnet route for on `device`.
#[must_use]
pub fn kernel_addresses(routes: &[Route], device: &str) -> BTreeSet<Ipv4Addr> {
    routes
        .iter()
        .filter(|route| route.dev.as_deref() == Some(device))
        .filter(|route| route.proto.as_deref() == Some("kernel"))
        .filter(|route| route.scope.as_deref() == Some("link"))
        .filter_map(|route| route.src)
        .collect()
}

/// Splits one terse `nmcli` line on unescaped colons.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

/// Parses `nmcli -t -f NAME,UUID,TYPE,DEVICE connection show`.
///
/// # Errors
///
/// Returns [`NetworkError::Parse`] for rows without exactly four fields or
/// with an empty identifier.
pub fn parse_connections(output: &str) -> Result<Vec<Connection>, NetworkError> {
    let mut connections = Vec::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let error = |reason| NetworkError::Parse {
            command: "nmcli connection show",
            line: line.to_owned(),
            reason,
        };
        let mut fields = split_terse(line).into_iter();
        let (Some(name), Some(uuid), Some(kind), Some(bound_device), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(error("expected NAME:UUID:TYPE:DEVICE"));
        };
        if uuid.trim().is_empty() {
            return Err(error("connection has no identifier"));
        }
        let device = match bound_device.trim() {
            "" | "--" => None,
            bound => Some(bound.to_owned()),
        };
        connections.push(Connection {
            name,
            uuid,
            kind,
            device,
        });
    }
    Ok(connections)
}

/// Parses `nmcli -g` output for the addresses, gateway, dns, method,
/// autoconnect and route-metric fields, one value per line.
#[must_use]
pub fn parse_settings(output: &str) -> ConnectionSettings {
    let mut lines = output.lines().map(|line| line.trim().replace("\\:", ":"));
    let mut next = || lines.next().unwrap_or_default();
    ConnectionSettings {
        addresses: next(),
        gateway: next(),
        dns: next(),
        method: next(),
        autoconnect: next(),
        metric: next(),
    }
}
