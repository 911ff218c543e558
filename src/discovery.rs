//! Concurrent SSH login scan over a local subnet.
//!
//! Every candidate address gets its own session attempt on the blocking
//! pool; hits are collected behind a mutex and returned once every attempt
//! has finished. Result order is unspecified.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::session::{Connector, Credential, SshTarget};

/// Widest subnet accepted for a scan.
pub const WIDEST_PREFIX: u8 = 22;
/// Prefix length used when the subnet is inferred.
pub const DEFAULT_PREFIX: u8 = 24;
/// Factory user on Raspberry Pi OS images.
pub const DEFAULT_USER: &str = "pi";
/// Factory password on Raspberry Pi OS images.
pub const DEFAULT_PASSWORD: &str = "raspberry";

/// Errors raised by discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Raised when the subnet would spawn too many attempts.
    #[error("subnet {subnet} is wider than /{widest}")]
    RangeTooLarge {
        /// Requested subnet.
        subnet: Ipv4Network,
        /// Widest accepted prefix.
        widest: u8,
    },
    /// Raised when the local address cannot be determined.
    #[error("could not determine the local address: {0}")]
    NoLocalAddress(#[source] std::io::Error),
    /// Raised when the local address is not in a private range.
    #[error("local address {0} is not in a private range; pass --subnet")]
    NotPrivate(IpAddr),
    /// Raised when the async runtime cannot start.
    #[error("failed to start the discovery runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// Raised when a probe task panics or is cancelled.
    #[error("discovery task failed: {0}")]
    Task(String),
}

/// What to scan and how to log in.
#[derive(Clone, Debug)]
pub struct DiscoveryRequest {
    /// Range to scan.
    pub subnet: Ipv4Network,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login credential.
    pub credential: Credential,
}

/// Usable host addresses of `subnet`, excluding network and broadcast
/// addresses where the prefix has them.
///
/// # Errors
///
/// Returns [`DiscoveryError::RangeTooLarge`] for prefixes wider than
/// [`WIDEST_PREFIX`].
pub fn candidate_addresses(subnet: Ipv4Network) -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    if subnet.prefix() < WIDEST_PREFIX {
        return Err(DiscoveryError::RangeTooLarge {
            subnet,
            widest: WIDEST_PREFIX,
        });
    }
    let network = subnet.network();
    let broadcast = subnet.broadcast();
    Ok(subnet
        .iter()
        .filter(|address| subnet.prefix() >= 31 || (*address != network && *address != broadcast))
        .collect())
}

/// `/24` around the first private IPv4 address the host routes from.
///
/// # Errors
///
/// Returns [`DiscoveryError::NoLocalAddress`] when no route exists and
/// [`DiscoveryError::NotPrivate`] for a public address.
pub fn local_subnet() -> Result<Ipv4Network, DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(DiscoveryError::NoLocalAddress)?;
    // UDP connect only selects a route; nothing is sent.
    socket
        .connect((Ipv4Addr::new(8, 8, 8, 8), 80))
        .map_err(DiscoveryError::NoLocalAddress)?;
    let local = socket
        .local_addr()
        .map_err(DiscoveryError::NoLocalAddress)?
        .ip();
    match local {
        IpAddr::V4(address) if address.is_private() => subnet_around(address),
        other => Err(DiscoveryError::NotPrivate(other)),
    }
}

fn subnet_around(address: Ipv4Addr) -> Result<Ipv4Network, DiscoveryError> {
    let invalid = |err: ipnetwork::IpNetworkError| {
        DiscoveryError::NoLocalAddress(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
    };
    let around = Ipv4Network::new(address, DEFAULT_PREFIX).map_err(invalid)?;
    Ipv4Network::new(around.network(), DEFAULT_PREFIX).map_err(invalid)
}

fn attempt(connector: &dyn Connector, target: &SshTarget, credential: &Credential) -> bool {
    match connector.connect(target, credential) {
        Ok(mut session) => {
            if let Err(err) = session.close() {
                warn!(target_host = %target, error = %err, "failed to close probe session");
            }
            true
        }
        Err(err) => {
            debug!(target_host = %target, error = %err, "login failed");
            false
        }
    }
}

/// Attempts a login on every candidate of `request.subnet` concurrently.
///
/// # Errors
///
/// Returns [`DiscoveryError`] for an oversized range or a failed task.
pub async fn discover(
    connector: Arc<dyn Connector>,
    request: &DiscoveryRequest,
) -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    let candidates = candidate_addresses(request.subnet)?;
    info!(subnet = %request.subnet, candidates = candidates.len(), "scanning");

    let found = Arc::new(Mutex::new(Vec::new()));
    let dispatch = tracing::dispatcher::get_default(Clone::clone);
    let mut tasks = JoinSet::new();
    for address in candidates {
        let task_connector = Arc::clone(&connector);
        let task_found = Arc::clone(&found);
        let task_dispatch = dispatch.clone();
        let credential = request.credential.clone();
        let target = SshTarget::new(request.user.clone(), address.to_string(), request.port);
        tasks.spawn_blocking(move || {
            tracing::dispatcher::with_default(&task_dispatch, || {
                if attempt(task_connector.as_ref(), &target, &credential) {
                    info!(%address, "found host accepting the login");
                    task_found.blocking_lock().push(address);
                }
            });
        });
    }

    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|err| DiscoveryError::Task(err.to_string()))?;
    }
    let hosts = found.lock().await.clone();
    Ok(hosts)
}

/// Runs [`discover`] on a dedicated runtime.
///
/// # Errors
///
/// Returns [`DiscoveryError::Runtime`] when the runtime cannot start, and
/// whatever [`discover`] returns otherwise.
pub fn discover_blocking(
    connector: Arc<dyn Connector>,
    request: &DiscoveryRequest,
) -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .map_err(DiscoveryError::Runtime)?;
    runtime.block_on(discover(connector, request))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rstest::rstest;

    use super::*;
    use crate::session::SessionError;
    use crate::test_support::{ScriptedConnector, ScriptedHost};

    fn net(value: &str) -> Ipv4Network {
        value.parse().expect("network should parse")
    }

    #[rstest]
    #[case("192.168.1.0/24", 254)]
    #[case("10.0.0.0/22", 1022)]
    #[case("10.0.0.8/30", 2)]
    #[case("10.0.0.8/31", 2)]
    #[case("10.0.0.8/32", 1)]
    fn counts_usable_addresses(#[case] subnet: &str, #[case] expected: usize) {
        let candidates = candidate_addresses(net(subnet)).expect("candidates");
        assert_eq!(candidates.len(), expected);
    }

    #[test]
    fn excludes_network_and_broadcast() {
        let candidates = candidate_addresses(net("192.168.1.0/24")).expect("candidates");
        assert_eq!(candidates.first(), Some(&Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(candidates.last(), Some(&Ipv4Addr::new(192, 168, 1, 254)));
    }

    #[test]
    fn rejects_wide_ranges() {
        assert!(matches!(
            candidate_addresses(net("10.0.0.0/16")),
            Err(DiscoveryError::RangeTooLarge { widest: 22, .. })
        ));
    }

    #[test]
    fn inferred_subnet_is_the_surrounding_24() {
        let subnet = subnet_around(Ipv4Addr::new(192, 168, 7, 33)).expect("subnet");
        assert_eq!(subnet, net("192.168.7.0/24"));
    }

    #[tokio::test]
    async fn collects_hosts_accepting_the_login() {
        let host = ScriptedHost::new(SshTarget::new("pi", "0.0.0.0", 22));
        let accepted: BTreeSet<&str> = ["10.1.1.5", "10.1.1.9"].into_iter().collect();
        let connector = ScriptedConnector::new(host.clone()).failing_with(move |target, _| {
            (!accepted.contains(target.host.as_str())).then(|| SessionError::AuthRejected {
                user: target.user.clone(),
                message: String::from("denied"),
            })
        });
        let request = DiscoveryRequest {
            subnet: net("10.1.1.0/28"),
            port: 22,
            user: String::from("pi"),
            credential: Credential::Password(String::from("raspberry")),
        };

        let found: BTreeSet<Ipv4Addr> = discover(Arc::new(connector.clone()), &request)
            .await
            .expect("scan should finish")
            .into_iter()
            .collect();

        let expected: BTreeSet<Ipv4Addr> = [Ipv4Addr::new(10, 1, 1, 5), Ipv4Addr::new(10, 1, 1, 9)]
            .into_iter()
            .collect();
        assert_eq!(found, expected);
        assert_eq!(connector.attempts().len(), 14);
        assert_eq!(host.close_calls(), 2);
    }
}
