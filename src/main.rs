//! Binary entry point for the rpi-provisioner CLI.

use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use rpi_provisioner::boot::{BootError, BootRequest, WifiCredentials, prepare_boot};
use rpi_provisioner::config::{ConfigError, ProvisionerConfig};
use rpi_provisioner::discovery::{
    DiscoveryError, DiscoveryRequest, discover_blocking, local_subnet,
};
use rpi_provisioner::keys::{AuthorizedKeysStep, KeySourceError, MergePolicy, UriKeySource};
use rpi_provisioner::layer::{Layer, LayerError, LayerReport, LayerSession, UnsupportedAuth, run_layer};
use rpi_provisioner::layer1::{DeployerAccount, HardeningOrchestrator, HardeningRequest};
use rpi_provisioner::layer2::{BootstrapOrchestrator, BootstrapRequest};
use rpi_provisioner::network::{NetworkStep, StaticAddressing};
use rpi_provisioner::report::ConsoleReporter;
use rpi_provisioner::session::{Credential, SshConnector, SshTarget};

mod cli;

use cli::{
    AuthorizedKeysCommand, BootCommand, Cli, Command, FindCommand, HostArgs, Layer1Command,
    Layer2Command, LoginArgs, NetworkCommand,
};

const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Boot(#[from] BootError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Keys(#[from] KeySourceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

fn main() {
    let cli = Cli::parse();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.debug))
        .with_writer(io::stderr)
        .finish();

    let exit_code = tracing::subscriber::with_default(subscriber, || match dispatch(cli.command) {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    });

    process::exit(exit_code);
}

fn log_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }))
}

fn dispatch(command: Command) -> Result<(), CliError> {
    let config = ProvisionerConfig::load_without_cli_args()?;
    config.validate()?;
    match command {
        Command::Boot(args) => boot(&config, args),
        Command::Layer1(args) => layer1(&config, args),
        Command::Layer2(args) => layer2(&config, args),
        Command::Network(args) => network(&config, args),
        Command::AuthorizedKeys(args) => authorized_keys(&config, args),
        Command::Find(args) => find(&config, &args),
    }
}

fn boot(config: &ProvisionerConfig, args: BootCommand) -> Result<(), CliError> {
    let wifi = match (args.wifi_ssid, args.wifi_pass) {
        (Some(ssid), Some(pass)) => Some(WifiCredentials { ssid, pass }),
        (None, None) => None,
        _ => {
            return Err(CliError::InvalidArgument(String::from(
                "--wifi-ssid and --wifi-pass must be given together",
            )));
        }
    };
    let cmdline_args = if args.cmdline.is_empty() {
        config.cmdline_args()
    } else {
        args.cmdline
    };
    let request = BootRequest {
        boot_path: args.boot_path,
        hostname: args.hostname,
        wifi,
        wifi_country: args
            .wifi_country
            .unwrap_or_else(|| config.wifi_country.clone()),
        cmdline_args,
    };

    let mut out = io::stdout();
    writeln!(out, "Using boot partition {}", request.boot_path)?;
    if request.wifi.is_none() {
        writeln!(out, "Skipping WiFi connection setup")?;
    }
    let mut reporter = ConsoleReporter::new(io::stdout());
    let report = prepare_boot(&request, &mut reporter)?;
    if !report.changed() {
        writeln!(out, "Boot partition already prepared")?;
    }
    Ok(())
}

fn layer1(config: &ProvisionerConfig, args: Layer1Command) -> Result<(), CliError> {
    let network = args
        .addresses
        .primary
        .map(|primary| static_addressing(config, primary, args.addresses.secondary))
        .transpose()?;
    let deployer_user = args.deployer_user;
    let request = HardeningRequest {
        target: ssh_target(config, &args.host, args.login_user),
        password: args.login_password,
        deployer: DeployerAccount {
            group: args.deployer_group.unwrap_or_else(|| deployer_user.clone()),
            user: deployer_user,
            password: args.deployer_password,
        },
        root_password: args.root_password,
        keys_uri: args.keys_uri,
        merge: merge_policy(args.keep_existing),
        hostname: args.hostname,
        network,
    };

    let mut out = io::stdout();
    if let Some(addressing) = &request.network {
        connectivity_warning(&mut out, addressing)?;
    }
    let keys = UriKeySource::new(KEY_FETCH_TIMEOUT)?;
    let orchestrator = HardeningOrchestrator::new(dial_connector(config), keys);
    let mut reporter = ConsoleReporter::new(io::stdout());
    let report = orchestrator.execute(&request, &mut reporter)?;

    if report.already_provisioned {
        writeln!(
            out,
            "{} no longer accepts password logins; layer 1 has already run",
            request.target.host
        )?;
        return Ok(());
    }
    let host = request
        .network
        .as_ref()
        .map_or_else(|| request.target.host.clone(), |net| net.primary.to_string());
    render_guidance(&mut out, &report, &request.deployer.user, &host)?;
    Ok(())
}

fn layer2(config: &ProvisionerConfig, args: Layer2Command) -> Result<(), CliError> {
    let request = BootstrapRequest {
        target: ssh_target(config, &args.host, args.user),
        key_path: args
            .identity_file
            .unwrap_or_else(|| config.identity_path()),
        key_passphrase: args.key_passphrase,
        tailscale_auth_key: args.tailscale_auth_key,
    };
    let orchestrator = BootstrapOrchestrator::new(dial_connector(config));
    let mut reporter = ConsoleReporter::new(io::stdout());
    let report = orchestrator.execute(&request, &mut reporter)?;
    render_guidance(
        &mut io::stdout(),
        &report,
        &request.target.user,
        &request.target.host,
    )?;
    Ok(())
}

fn network(config: &ProvisionerConfig, args: NetworkCommand) -> Result<(), CliError> {
    let addressing = static_addressing(config, args.primary, args.secondary)?;
    addressing
        .validate()
        .map_err(|err| CliError::InvalidArgument(err.to_string()))?;
    let target = ssh_target(config, &args.host, args.login.user.clone());
    let credential = login_credential(config, args.login)?;

    let mut out = io::stdout();
    connectivity_warning(&mut out, &addressing)?;
    let session = LayerSession {
        target: &target,
        credential: &credential,
        sudo_password: credential.password(),
        unsupported_auth: UnsupportedAuth::Fatal,
    };
    let step = NetworkStep::new(addressing.clone());
    let mut reporter = ConsoleReporter::new(io::stdout());
    let report = run_layer(
        Layer::Network,
        &dial_connector(config),
        session,
        &mut reporter,
        |run| {
            run.step(&step)?;
            Ok(())
        },
    )?;
    render_guidance(&mut out, &report, &target.user, &addressing.primary.to_string())?;
    Ok(())
}

fn authorized_keys(config: &ProvisionerConfig, args: AuthorizedKeysCommand) -> Result<(), CliError> {
    let user = args.login.user.clone();
    let target = ssh_target(config, &args.host, user.clone());
    let credential = login_credential(config, args.login)?;
    let keys = UriKeySource::new(KEY_FETCH_TIMEOUT)?;
    let step = AuthorizedKeysStep::new(
        user.clone(),
        args.group.unwrap_or(user),
        args.keys_uri,
        &keys,
        merge_policy(args.keep_existing),
    );
    let session = LayerSession {
        target: &target,
        credential: &credential,
        sudo_password: credential.password(),
        unsupported_auth: UnsupportedAuth::Fatal,
    };
    let mut reporter = ConsoleReporter::new(io::stdout());
    run_layer(
        Layer::AuthorizedKeys,
        &dial_connector(config),
        session,
        &mut reporter,
        |run| {
            run.step(&step)?;
            Ok(())
        },
    )?;
    Ok(())
}

fn find(config: &ProvisionerConfig, args: &FindCommand) -> Result<(), CliError> {
    let subnet = args
        .subnet
        .as_deref()
        .map_or_else(|| local_subnet().map_err(CliError::from), parse_subnet)?;
    let credential = args.ssh_key.as_ref().map_or_else(
        || Credential::Password(args.password.clone()),
        |path| Credential::Key {
            path: path.clone(),
            passphrase: None,
        },
    );
    let request = DiscoveryRequest {
        subnet,
        port: args.port.unwrap_or(config.ssh_port),
        user: args.user.clone(),
        credential,
    };
    let timeout = Duration::from_secs(args.timeout.unwrap_or(config.discovery_timeout_secs));

    let mut out = io::stdout();
    writeln!(out, "Scanning {subnet} for {}@*:{}", request.user, request.port)?;
    let mut hosts = discover_blocking(Arc::new(SshConnector::probing(timeout)), &request)?;
    hosts.sort_unstable();
    if hosts.is_empty() {
        writeln!(out, "No hosts accepted the login")?;
    }
    for host in hosts {
        writeln!(out, "{host}")?;
    }
    Ok(())
}

fn parse_subnet(raw: &str) -> Result<Ipv4Network, CliError> {
    raw.parse()
        .map_err(|err| CliError::InvalidArgument(format!("--subnet {raw}: {err}")))
}

fn ssh_target(config: &ProvisionerConfig, host: &HostArgs, user: String) -> SshTarget {
    SshTarget::new(user, host.host.clone(), host.port.unwrap_or(config.ssh_port))
}

fn dial_connector(config: &ProvisionerConfig) -> SshConnector {
    SshConnector::new(Duration::from_secs(config.connect_timeout_secs))
}

fn login_credential(config: &ProvisionerConfig, login: LoginArgs) -> Result<Credential, CliError> {
    if login.ssh_key {
        return Ok(Credential::Key {
            path: login.identity_file.unwrap_or_else(|| config.identity_path()),
            passphrase: None,
        });
    }
    login.password.map(Credential::Password).ok_or_else(|| {
        CliError::InvalidArgument(String::from("pass --password or --ssh-key"))
    })
}

const fn merge_policy(keep_existing: bool) -> MergePolicy {
    if keep_existing {
        MergePolicy::Union
    } else {
        MergePolicy::Replace
    }
}

fn static_addressing(
    config: &ProvisionerConfig,
    primary: Ipv4Addr,
    secondary: Option<Ipv4Addr>,
) -> Result<StaticAddressing, CliError> {
    let mut addressing = StaticAddressing::new(primary, secondary);
    addressing.dns = config.dns()?;
    addressing.wired_metric = config.wired_metric;
    addressing.wireless_metric = config.wireless_metric;
    Ok(addressing)
}

fn connectivity_warning(out: &mut impl Write, addressing: &StaticAddressing) -> io::Result<()> {
    writeln!(
        out,
        "WARNING: the host moves to {} once NetworkManager restarts; this session will drop and \
         later commands must target the new address",
        addressing.primary
    )
}

fn render_guidance(
    out: &mut impl Write,
    report: &LayerReport,
    user: &str,
    host: &str,
) -> io::Result<()> {
    for advisory in report.soft_failures() {
        writeln!(out, "WARNING: {advisory}")?;
        writeln!(out, "  next: {}", advisory.next_command(user, host))?;
    }
    for advisory in report.manual_follow_ups() {
        writeln!(out, "ACTION REQUIRED: {advisory}")?;
        writeln!(out, "  next: {}", advisory.next_command(user, host))?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "Error: {err}").ok();
    if let CliError::Layer(layer) = err
        && let Some(report) = layer.report()
    {
        let done = report.steps.len().saturating_sub(1);
        writeln!(target, "{done} step(s) of {} completed before the failure", report.layer).ok();
    }
}
