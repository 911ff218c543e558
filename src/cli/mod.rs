//! Command-line interface definitions for the `rpi-provisioner` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page. Only
//! `clap`, `camino` and the standard library may be used here.

use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `rpi-provisioner` binary.
#[derive(Parser)]
#[command(
    name = "rpi-provisioner",
    version,
    about = "Provision Raspberry Pi hosts over SSH in successive layers",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Enable debug logging on stderr. `RUST_LOG` takes precedence.
    #[arg(long, global = true)]
    pub(crate) debug: bool,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Available subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Prepare a freshly flashed boot partition.
    #[command(name = "boot", about = "Setup image before first boot")]
    Boot(BootCommand),
    /// Create the deployer account and harden sshd.
    #[command(name = "layer1", about = "Create the deployer account and harden sshd")]
    Layer1(Layer1Command),
    /// Install the shell environment, VPN client and container runtime.
    #[command(name = "layer2", about = "Bootstrap the deployer's shell, VPN and Docker")]
    Layer2(Layer2Command),
    /// Switch the host to static addressing.
    #[command(name = "network", about = "Set up static IP addressing")]
    Network(NetworkCommand),
    /// Upload authorized keys for the login user.
    #[command(name = "authorized-keys", about = "Install authorized keys")]
    AuthorizedKeys(AuthorizedKeysCommand),
    /// Find hosts on the local network accepting an SSH login.
    #[command(name = "find", about = "Find Raspberry Pis on the local network")]
    Find(FindCommand),
}

/// Endpoint flags shared by the remote subcommands.
#[derive(Args)]
pub(crate) struct HostArgs {
    /// Server host name or address.
    #[arg(long)]
    pub(crate) host: String,
    /// Server SSH port. Defaults to the configured port.
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

/// Login flags for subcommands accepting either credential.
#[derive(Args)]
pub(crate) struct LoginArgs {
    /// Login user.
    #[arg(long)]
    pub(crate) user: String,
    /// Login password; also fed to sudo.
    #[arg(long, env = "RPI_PROVISIONER_PASSWORD", hide_env_values = true)]
    pub(crate) password: Option<String>,
    /// Authenticate with a private key instead of a password.
    #[arg(long, conflicts_with = "password")]
    pub(crate) ssh_key: bool,
    /// Private key path. Defaults to the configured identity file.
    #[arg(long, value_name = "PATH", requires = "ssh_key")]
    pub(crate) identity_file: Option<Utf8PathBuf>,
}

/// Static address flags.
#[derive(Args)]
pub(crate) struct AddressArgs {
    /// Static address for the wired interface, or the wireless one when the
    /// host has no wired interface.
    #[arg(long = "static-ip", value_name = "IP")]
    pub(crate) primary: Option<Ipv4Addr>,
    /// Static address for the wireless interface when a wired one exists.
    #[arg(long = "secondary-ip", value_name = "IP", requires = "primary")]
    pub(crate) secondary: Option<Ipv4Addr>,
}

/// Arguments for `rpi-provisioner boot`.
#[derive(Args)]
pub(crate) struct BootCommand {
    /// Mounted boot partition; must contain `cmdline.txt`.
    #[arg(value_name = "BOOT_PATH")]
    pub(crate) boot_path: Utf8PathBuf,
    /// Hostname applied on first boot.
    #[arg(long)]
    pub(crate) hostname: Option<String>,
    /// Wi-Fi network name.
    #[arg(long, requires = "wifi_pass")]
    pub(crate) wifi_ssid: Option<String>,
    /// Wi-Fi passphrase.
    #[arg(long, requires = "wifi_ssid")]
    pub(crate) wifi_pass: Option<String>,
    /// Two-letter Wi-Fi country code. Defaults to the configured country.
    #[arg(long, value_name = "CODE")]
    pub(crate) wifi_country: Option<String>,
    /// Kernel argument to append; repeat for several. Defaults to the
    /// configured cgroup arguments.
    #[arg(long = "cmdline", value_name = "ARG")]
    pub(crate) cmdline: Vec<String>,
}

/// Arguments for `rpi-provisioner layer1`.
#[derive(Args)]
pub(crate) struct Layer1Command {
    /// Endpoint.
    #[command(flatten)]
    pub(crate) host: HostArgs,
    /// Factory login user.
    #[arg(long, default_value = "pi")]
    pub(crate) login_user: String,
    /// Factory login password.
    #[arg(long, env = "RPI_PROVISIONER_LOGIN_PASSWORD", hide_env_values = true)]
    pub(crate) login_password: String,
    /// Account to create.
    #[arg(long)]
    pub(crate) deployer_user: String,
    /// Primary group of the deployer, granted passwordless sudo. Defaults to
    /// the deployer user name.
    #[arg(long)]
    pub(crate) deployer_group: Option<String>,
    /// Password of the new account.
    #[arg(long, env = "RPI_PROVISIONER_DEPLOYER_PASSWORD", hide_env_values = true)]
    pub(crate) deployer_password: String,
    /// New root password.
    #[arg(long, env = "RPI_PROVISIONER_ROOT_PASSWORD", hide_env_values = true)]
    pub(crate) root_password: Option<String>,
    /// Key document location: a local path, an `http(s)://` URL or
    /// `s3://<region>/<bucket>/<object>`.
    #[arg(long, value_name = "URI")]
    pub(crate) keys_uri: String,
    /// Keep keys already present on the host alongside the fetched ones.
    #[arg(long)]
    pub(crate) keep_existing: bool,
    /// New hostname.
    #[arg(long)]
    pub(crate) hostname: Option<String>,
    /// Optional static addressing, applied last.
    #[command(flatten)]
    pub(crate) addresses: AddressArgs,
}

/// Arguments for `rpi-provisioner layer2`.
#[derive(Args)]
pub(crate) struct Layer2Command {
    /// Endpoint.
    #[command(flatten)]
    pub(crate) host: HostArgs,
    /// Deployer user created by layer 1.
    #[arg(long)]
    pub(crate) user: String,
    /// Private key path. Defaults to the configured identity file.
    #[arg(long, value_name = "PATH")]
    pub(crate) identity_file: Option<Utf8PathBuf>,
    /// Passphrase protecting the private key.
    #[arg(long, env = "RPI_PROVISIONER_KEY_PASSPHRASE", hide_env_values = true)]
    pub(crate) key_passphrase: Option<String>,
    /// Tailscale auth key; without it login is left to the operator.
    #[arg(long, env = "RPI_PROVISIONER_TAILSCALE_AUTH_KEY", hide_env_values = true)]
    pub(crate) tailscale_auth_key: Option<String>,
}

/// Arguments for `rpi-provisioner network`.
#[derive(Args)]
pub(crate) struct NetworkCommand {
    /// Endpoint.
    #[command(flatten)]
    pub(crate) host: HostArgs,
    /// Login.
    #[command(flatten)]
    pub(crate) login: LoginArgs,
    /// Static address for the wired interface, or the wireless one when the
    /// host has no wired interface.
    #[arg(long = "static-ip", value_name = "IP")]
    pub(crate) primary: Ipv4Addr,
    /// Static address for the wireless interface when a wired one exists.
    #[arg(long = "secondary-ip", value_name = "IP")]
    pub(crate) secondary: Option<Ipv4Addr>,
}

/// Arguments for `rpi-provisioner authorized-keys`.
#[derive(Args)]
pub(crate) struct AuthorizedKeysCommand {
    /// Endpoint.
    #[command(flatten)]
    pub(crate) host: HostArgs,
    /// Login.
    #[command(flatten)]
    pub(crate) login: LoginArgs,
    /// Group owning the `.ssh` directory. Defaults to the user name.
    #[arg(long)]
    pub(crate) group: Option<String>,
    /// Key document location: a local path, an `http(s)://` URL or
    /// `s3://<region>/<bucket>/<object>`.
    #[arg(long, value_name = "URI")]
    pub(crate) keys_uri: String,
    /// Keep keys already present on the host alongside the fetched ones.
    #[arg(long)]
    pub(crate) keep_existing: bool,
}

/// Arguments for `rpi-provisioner find`.
#[derive(Args)]
pub(crate) struct FindCommand {
    /// Subnet to scan, for example `192.168.1.0/24`. Defaults to the `/24`
    /// around this machine's private address.
    #[arg(long, value_name = "CIDR")]
    pub(crate) subnet: Option<String>,
    /// User to log in as.
    #[arg(long, default_value = "pi")]
    pub(crate) user: String,
    /// Password to log in with.
    #[arg(long, default_value = "raspberry", conflicts_with = "ssh_key")]
    pub(crate) password: String,
    /// Log in with this private key instead of a password.
    #[arg(long, value_name = "PATH")]
    pub(crate) ssh_key: Option<Utf8PathBuf>,
    /// SSH port. Defaults to the configured port.
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Per-address dial timeout in seconds. Defaults to the configured value.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
}
