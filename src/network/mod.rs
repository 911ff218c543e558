//! Static address reconciliation for NetworkManager hosts.
//!
//! The reconciler reads live state on every run: the default route, the
//! connection profiles bound to `eth0`/`wlan0`, each profile's current IPv4
//! settings, and the DHCP leases visible in the routing table. It then
//! rewrites only what differs and removes stale leases. Addresses carrying
//! the control connection are protected and never deleted.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::shell::ShellCommand;
use crate::step::{Advisory, Applied, Probe, Step, StepContext, StepError};

mod parse;

pub use parse::{
    Connection, ConnectionSettings, DhcpLease, Route, default_gateway, dhcp_leases,
    kernel_addresses, parse_connections, parse_routes, parse_settings,
};


/// Wired interface name.
pub const WIRED: &str = "eth0";
/// Wireless interface name.
pub const WIRELESS: &str = "wlan0";

const SETTINGS_FIELDS: &str =
    "ipv4.addresses,ipv4.gateway,ipv4.dns,ipv4.method,connection.autoconnect,ipv4.route-metric";
const UNASSIGNABLE: &str = "Cannot assign requested address";

/// Errors raised while reading network state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Raised for output the parsers do not understand.
    #[error("unexpected `{command}` output ({reason}): {line:?}")]
    Parse {
        /// Command whose output was parsed.
        command: &'static str,
        /// Offending line.
        line: String,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// Raised when no default route exists to take the gateway from.
    #[error("no default route found; cannot determine the gateway")]
    NoDefaultRoute,
    /// Raised when the requested addressing is inconsistent.
    #[error("invalid static addressing: {0}")]
    InvalidAddressing(String),
}

/// Operator request for static addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAddressing {
    /// Address for the wired interface, or the wireless one when no wired
    /// interface exists.
    pub primary: Ipv4Addr,
    /// Address for the wireless interface when a wired one exists.
    pub secondary: Option<Ipv4Addr>,
    /// DNS resolver written into every profile.
    pub dns: Ipv4Addr,
    /// Prefix length of the static addresses.
    pub prefix: u8,
    /// Route metric for the wired interface.
    pub wired_metric: u32,
    /// Route metric for the wireless interface.
    pub wireless_metric: u32,
}

impl StaticAddressing {
    /// Addressing with the default resolver, `/24`, and metrics 100/200.
    #[must_use]
    pub const fn new(primary: Ipv4Addr, secondary: Option<Ipv4Addr>) -> Self {
        Self {
            primary,
            secondary,
            dns: Ipv4Addr::new(1, 1, 1, 1),
            prefix: 24,
            wired_metric: 100,
            wireless_metric: 200,
        }
    }

    /// Checks the request for contradictions.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidAddressing`] when both addresses are
    /// equal, the prefix is out of range, or wired is not preferred.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.secondary == Some(self.primary) {
            return Err(NetworkError::InvalidAddressing(String::from(
                "primary and secondary addresses must differ",
            )));
        }
        if self.prefix == 0 || self.prefix > 32 {
            return Err(NetworkError::InvalidAddressing(format!(
                "prefix /{} is out of range",
                self.prefix
            )));
        }
        if self.wired_metric >= self.wireless_metric {
            return Err(NetworkError::InvalidAddressing(String::from(
                "the wired metric must be lower than the wireless metric",
            )));
        }
        Ok(())
    }
}

/// Desired static configuration for one present interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBinding {
    /// Device name.
    pub device: String,
    /// Connection profile identifier.
    pub connection: String,
    /// Static address to apply.
    pub address: Ipv4Addr,
    /// Route metric; lower wins.
    pub metric: u32,
}

/// What [`NetworkReconciler::inspect`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    /// Gateway taken from the default route.
    pub gateway: Ipv4Addr,
    /// Bindings for every present interface, wired first.
    pub bindings: Vec<InterfaceBinding>,
    /// Devices whose profile differs from the binding.
    pub updates: Vec<String>,
    /// Leases to delete.
    pub stale_leases: Vec<DhcpLease>,
    /// Leases kept because they carry the current session.
    pub protected_leases: Vec<DhcpLease>,
    /// Devices whose static address is not yet bound in the kernel.
    pub inactive: Vec<String>,
}

impl NetworkPlan {
    /// Returns `true` when nothing needs mutating.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.updates.is_empty() && self.stale_leases.is_empty() && self.inactive.is_empty()
    }
}

/// What [`NetworkReconciler::apply`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOutcome {
    /// Bindings that were in scope.
    pub bindings: Vec<InterfaceBinding>,
    /// Devices whose profile was rewritten.
    pub updated: Vec<String>,
    /// Leases that were deleted.
    pub removed: Vec<DhcpLease>,
    /// Leases left in place because they carry the control connection.
    pub kept: Vec<DhcpLease>,
    /// Whether NetworkManager was restarted.
    pub restarted: bool,
    /// Conditions a reboot should clear.
    pub advisories: Vec<String>,
}

impl NetworkOutcome {
    /// Returns `true` when at least one interface is bound to its static
    /// address.
    #[must_use]
    pub fn provisioned(&self) -> bool {
        !self.bindings.is_empty()
    }
}

/// Converges `eth0`/`wlan0` onto static addressing.
#[derive(Debug, Clone)]
pub struct NetworkReconciler {
    addressing: StaticAddressing,
}

impl NetworkReconciler {
    /// Reconciler for `addressing`.
    #[must_use]
    pub const fn new(addressing: StaticAddressing) -> Self {
        Self { addressing }
    }

    /// Requested addressing.
    #[must_use]
    pub const fn addressing(&self) -> &StaticAddressing {
        &self.addressing
    }

    /// Maps present interfaces to addresses, wired first.
    ///
    /// The wired interface takes the primary address. The wireless
    /// interface takes the secondary address, or the primary when no wired
    /// interface is present. Absent interfaces are skipped.
    #[must_use]
    pub fn plan_bindings(&self, connections: &[Connection]) -> Vec<InterfaceBinding> {
        let profile = |device: &str| {
            connections
                .iter()
                .find(|conn| conn.device.as_deref() == Some(device))
                .map(|conn| conn.uuid.clone())
        };

        let mut bindings = Vec::new();
        let wired = profile(WIRED);
        let wireless_address = if wired.is_some() {
            self.addressing.secondary
        } else {
            if profile(WIRELESS).is_some() {
                warn!(address = %self.addressing.primary, "{WIRED} not found, assigning the primary address to {WIRELESS}");
            }
            Some(self.addressing.primary)
        };

        if let Some(connection) = wired {
            bindings.push(InterfaceBinding {
                device: WIRED.to_owned(),
                connection,
                address: self.addressing.primary,
                metric: self.addressing.wired_metric,
            });
        } else {
            debug!(device = WIRED, "skipping interface without a connection profile");
        }

        match (profile(WIRELESS), wireless_address) {
            (Some(connection), Some(address)) => bindings.push(InterfaceBinding {
                device: WIRELESS.to_owned(),
                connection,
                address,
                metric: self.addressing.wireless_metric,
            }),
            (None, _) => debug!(device = WIRELESS, "skipping interface without a connection profile"),
            (Some(_), None) => debug!(device = WIRELESS, "no address requested for interface"),
        }
        bindings
    }

    fn desired_settings(&self, binding: &InterfaceBinding, gateway: Ipv4Addr) -> ConnectionSettings {
        ConnectionSettings {
            addresses: format!("{}/{}", binding.address, self.addressing.prefix),
            gateway: gateway.to_string(),
            dns: self.addressing.dns.to_string(),
            method: String::from("manual"),
            autoconnect: String::from("yes"),
            metric: binding.metric.to_string(),
        }
    }

    fn protected_addresses(&self, ctx: &StepContext<'_>, bindings: &[InterfaceBinding]) -> BTreeSet<Ipv4Addr> {
        let session = ctx.session();
        let mut protected: BTreeSet<Ipv4Addr> = bindings.iter().map(|b| b.address).collect();
        if let Some(IpAddr::V4(peer)) = session.peer_address() {
            protected.insert(peer);
        }
        if let Ok(host) = session.target().host.parse::<Ipv4Addr>() {
            protected.insert(host);
        }
        protected
    }

    /// Reads live state and decides what to change. Never mutates.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when a query fails or its output cannot be
    /// parsed.
    pub fn inspect(&self, ctx: &StepContext<'_>) -> Result<NetworkPlan, StepError> {
        self.addressing.validate()?;
        let routes_output = ctx.run("read routing table", &route_query())?;
        let gateway = default_gateway(&routes_output.stdout)?;
        let routes = parse_routes(&routes_output.stdout)?;

        let connections_output = ctx.run(
            "list connection profiles",
            &ShellCommand::new("nmcli")
                .args(["-t", "-f", "NAME,UUID,TYPE,DEVICE", "connection", "show"]),
        )?;
        let connections = parse_connections(&connections_output.stdout)?;
        let bindings = self.plan_bindings(&connections);

        let mut updates = Vec::new();
        for binding in &bindings {
            let current = ctx.run(
                "read connection settings",
                &ShellCommand::new("nmcli")
                    .arg("-g")
                    .arg(SETTINGS_FIELDS)
                    .arg("connection")
                    .arg("show")
                    .arg(&binding.connection),
            )?;
            if parse_settings(&current.stdout) != self.desired_settings(binding, gateway) {
                updates.push(binding.device.clone());
            }
        }

        let protected = self.protected_addresses(ctx, &bindings);
        let mut stale_leases = Vec::new();
        let mut protected_leases = Vec::new();
        let mut inactive = Vec::new();
        for binding in &bindings {
            if !kernel_addresses(&routes, &binding.device).contains(&binding.address) {
                inactive.push(binding.device.clone());
            }
            for lease in dhcp_leases(&routes, &binding.device) {
                if lease.address == binding.address {
                    continue;
                }
                if protected.contains(&lease.address) {
                    protected_leases.push(lease);
                } else {
                    stale_leases.push(lease);
                }
            }
        }

        debug!(%gateway, ?updates, ?stale_leases, ?protected_leases, ?inactive, "network plan");
        Ok(NetworkPlan {
            gateway,
            bindings,
            updates,
            stale_leases,
            protected_leases,
            inactive,
        })
    }

    /// Applies `plan`: profile rewrites, lease removal, verification, and a
    /// NetworkManager restart when anything changed or a static address is
    /// not live yet.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when a mutation fails for a reason a reboot
    /// would not fix.
    pub fn apply(&self, ctx: &StepContext<'_>, plan: NetworkPlan) -> Result<NetworkOutcome, StepError> {
        let mut outcome = NetworkOutcome {
            bindings: plan.bindings.clone(),
            ..NetworkOutcome::default()
        };

        for binding in plan
            .bindings
            .iter()
            .filter(|binding| plan.updates.contains(&binding.device))
        {
            let settings = self.desired_settings(binding, plan.gateway);
            let command = ShellCommand::new("nmcli")
                .arg("connection")
                .arg("modify")
                .arg(&binding.connection)
                .args(["ipv4.addresses", settings.addresses.as_str()])
                .args(["ipv4.gateway", settings.gateway.as_str()])
                .args(["ipv4.dns", settings.dns.as_str()])
                .args(["ipv4.method", "manual"])
                .args(["connection.autoconnect", "yes"])
                .args(["ipv4.route-metric", settings.metric.as_str()]);
            ctx.sudo("update connection profile", &command)?;
            info!(device = %binding.device, address = %binding.address, "static address configured");
            outcome.updated.push(binding.device.clone());
        }

        for lease in &plan.stale_leases {
            let command = ShellCommand::new("ip")
                .arg("addr")
                .arg("del")
                .arg(format!("{}/{}", lease.address, lease.prefix))
                .arg("dev")
                .arg(&lease.device);
            let output = ctx.probe_privileged(&command)?;
            if output.success() {
                info!(device = %lease.device, address = %lease.address, "removed stale DHCP lease");
                outcome.removed.push(lease.clone());
            } else if output.stderr.contains(UNASSIGNABLE) {
                warn!(device = %lease.device, address = %lease.address, "lease could not be removed");
                outcome.advisories.push(format!(
                    "could not remove DHCP lease {} on {}; reboot to release it",
                    lease.address, lease.device
                ));
            } else {
                return Err(StepError::command("remove stale DHCP lease", &command, &output));
            }
        }

        for lease in &plan.protected_leases {
            warn!(device = %lease.device, address = %lease.address, "keeping DHCP lease that carries this session");
            outcome.kept.push(lease.clone());
        }

        self.verify(ctx, &plan, &mut outcome)?;

        if !outcome.updated.is_empty() || !outcome.removed.is_empty() || !plan.inactive.is_empty() {
            ctx.sudo(
                "restart NetworkManager",
                &ShellCommand::new("systemctl").arg("restart").arg("NetworkManager"),
            )?;
            outcome.restarted = true;
        }
        Ok(outcome)
    }

    fn verify(
        &self,
        ctx: &StepContext<'_>,
        plan: &NetworkPlan,
        outcome: &mut NetworkOutcome,
    ) -> Result<(), StepError> {
        let routes_output = ctx.run("read routing table", &route_query())?;
        let routes = parse_routes(&routes_output.stdout)?;
        let removed: BTreeSet<Ipv4Addr> = outcome.removed.iter().map(|lease| lease.address).collect();
        for binding in &plan.bindings {
            let leftovers: Vec<Ipv4Addr> = kernel_addresses(&routes, &binding.device)
                .into_iter()
                .filter(|address| *address != binding.address && !removed.contains(address))
                .collect();
            if leftovers.len() > 1 {
                let listed = leftovers
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                warn!(device = %binding.device, addresses = %listed, "ambiguous addresses remain");
                outcome.advisories.push(format!(
                    "{} still has addresses {listed} besides {}; reboot before relying on it",
                    binding.device, binding.address
                ));
            }
        }
        Ok(())
    }
}

fn route_query() -> ShellCommand {
    ShellCommand::new("ip").args(["-4", "route", "show"])
}

/// [`NetworkReconciler`] as a step.
#[derive(Debug, Clone)]
pub struct NetworkStep {
    reconciler: NetworkReconciler,
}

impl NetworkStep {
    /// Step applying `addressing`.
    #[must_use]
    pub const fn new(addressing: StaticAddressing) -> Self {
        Self {
            reconciler: NetworkReconciler::new(addressing),
        }
    }
}

impl Step for NetworkStep {
    type Pending = NetworkPlan;

    fn title(&self) -> String {
        let addressing = self.reconciler.addressing();
        match addressing.secondary {
            Some(secondary) => format!(
                "Provisioning static IPs {} and {secondary}",
                addressing.primary
            ),
            None => format!("Provisioning static IP {}", addressing.primary),
        }
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<NetworkPlan>, StepError> {
        let plan = self.reconciler.inspect(ctx)?;
        if plan.bindings.is_empty() {
            warn!("neither {WIRED} nor {WIRELESS} has a connection profile; nothing to do");
            return Ok(Probe::Satisfied);
        }
        if plan.is_converged() {
            return Ok(Probe::Satisfied);
        }
        Ok(Probe::Pending(plan))
    }

    fn apply(&self, ctx: &StepContext<'_>, plan: NetworkPlan) -> Result<Applied, StepError> {
        let outcome = self.reconciler.apply(ctx, plan)?;
        if outcome.advisories.is_empty() {
            Ok(Applied::Done)
        } else {
            Ok(Applied::Degraded(Advisory::Reboot {
                reason: outcome.advisories.join("; "),
            }))
        }
    }
}
