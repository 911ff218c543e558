//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `rpi-provisioner.toml` discovery, and
//! `RPI_PROVISIONER_*` environment variables. Command-line flags are applied
//! on top by the binary.

use std::ffi::OsString;
use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::boot::DEFAULT_CMDLINE_ARGS;

/// Defaults shared by every subcommand.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "RPI_PROVISIONER",
    discovery(
        app_name = "rpi-provisioner",
        env_var = "RPI_PROVISIONER_CONFIG_PATH",
        config_file_name = "rpi-provisioner.toml",
        dotfile_name = ".rpi-provisioner.toml",
        project_file_name = "rpi-provisioner.toml"
    )
)]
pub struct ProvisionerConfig {
    /// SSH port on the target.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key used for key authentication. A leading `~/` expands to
    /// `$HOME`.
    #[ortho_config(default = "~/.ssh/id_rsa".to_owned())]
    pub identity_file: String,
    /// Dial timeout for layer commands, in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Per-address dial timeout for host discovery, in seconds.
    #[ortho_config(default = 1)]
    pub discovery_timeout_secs: u64,
    /// Resolver written into static network profiles.
    #[ortho_config(default = "1.1.1.1".to_owned())]
    pub dns_server: String,
    /// Route metric for the wired interface.
    #[ortho_config(default = 100)]
    pub wired_metric: u32,
    /// Route metric for the wireless interface.
    #[ortho_config(default = 200)]
    pub wireless_metric: u32,
    /// Space-separated kernel arguments appended by `boot`.
    #[ortho_config(default = DEFAULT_CMDLINE_ARGS.join(" "))]
    pub cmdline_args: String,
    /// Wi-Fi regulatory domain written by `boot`.
    #[ortho_config(default = "ES".to_owned())]
    pub wifi_country: String,
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or zero.
    #[error("missing configuration field `{0}`: set it in rpi-provisioner.toml or the environment")]
    MissingField(&'static str),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Indicates a field has a value of the wrong shape.
    #[error("invalid configuration field `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl ProvisionerConfig {
    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("rpi-provisioner")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Rejects empty and zero values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for an empty or zero field and
    /// [`ConfigError::Invalid`] for a resolver that is not an IPv4 address or
    /// inverted route metrics.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh_port == 0 {
            return Err(ConfigError::MissingField("ssh_port"));
        }
        if self.identity_file.trim().is_empty() {
            return Err(ConfigError::MissingField("identity_file"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::MissingField("connect_timeout_secs"));
        }
        if self.discovery_timeout_secs == 0 {
            return Err(ConfigError::MissingField("discovery_timeout_secs"));
        }
        if self.wifi_country.trim().is_empty() {
            return Err(ConfigError::MissingField("wifi_country"));
        }
        self.dns()?;
        if self.wired_metric >= self.wireless_metric {
            return Err(ConfigError::Invalid {
                field: "wired_metric",
                reason: format!(
                    "{} must be lower than the wireless metric {}",
                    self.wired_metric, self.wireless_metric
                ),
            });
        }
        Ok(())
    }

    /// Parsed DNS resolver.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `dns_server` is not IPv4.
    pub fn dns(&self) -> Result<Ipv4Addr, ConfigError> {
        self.dns_server
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid {
                field: "dns_server",
                reason: format!("`{}` is not an IPv4 address", self.dns_server),
            })
    }

    /// Kernel arguments for `boot`, split on whitespace.
    #[must_use]
    pub fn cmdline_args(&self) -> Vec<String> {
        self.cmdline_args
            .split_whitespace()
            .map(str::to_owned)
            .collect()
    }

    /// Identity file with `~/` expanded against `$HOME`.
    #[must_use]
    pub fn identity_path(&self) -> Utf8PathBuf {
        expand_tilde(&self.identity_file)
    }
}

/// Expands a leading `~/` to the current user's home directory.
#[must_use]
pub fn expand_tilde(path: &str) -> Utf8PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return Utf8PathBuf::from(format!("{}/{rest}", home.to_string_lossy()));
    }
    Utf8PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::test_support::EnvGuard;

    #[fixture]
    fn defaults() -> ProvisionerConfig {
        ProvisionerConfig {
            ssh_port: 22,
            identity_file: String::from("~/.ssh/id_rsa"),
            connect_timeout_secs: 10,
            discovery_timeout_secs: 1,
            dns_server: String::from("1.1.1.1"),
            wired_metric: 100,
            wireless_metric: 200,
            cmdline_args: DEFAULT_CMDLINE_ARGS.join(" "),
            wifi_country: String::from("ES"),
        }
    }

    #[tokio::test]
    async fn loads_defaults_and_environment_overrides() {
        let _guard = EnvGuard::set_vars(&[
            ("RPI_PROVISIONER_SSH_PORT", "2222"),
            ("RPI_PROVISIONER_WIFI_COUNTRY", "GB"),
        ])
        .await;

        let config = ProvisionerConfig::load_without_cli_args().expect("config should load");

        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.wifi_country, "GB");
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.cmdline_args(), DEFAULT_CMDLINE_ARGS);
    }

    #[rstest]
    fn defaults_are_valid(defaults: ProvisionerConfig) {
        assert_eq!(defaults.validate(), Ok(()));
    }

    #[rstest]
    fn zero_port_is_rejected(defaults: ProvisionerConfig) {
        let config = ProvisionerConfig {
            ssh_port: 0,
            ..defaults
        };
        assert_eq!(config.validate(), Err(ConfigError::MissingField("ssh_port")));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn blank_identity_file_is_rejected(defaults: ProvisionerConfig, #[case] identity: &str) {
        let config = ProvisionerConfig {
            identity_file: identity.to_owned(),
            ..defaults
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingField("identity_file"))
        );
    }

    #[rstest]
    fn resolver_must_be_ipv4(defaults: ProvisionerConfig) {
        let config = ProvisionerConfig {
            dns_server: String::from("dns.example"),
            ..defaults
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "dns_server", .. })
        ));
    }

    #[rstest]
    fn wired_metric_must_win(defaults: ProvisionerConfig) {
        let config = ProvisionerConfig {
            wired_metric: 300,
            ..defaults
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "wired_metric", .. })
        ));
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = std::env::var("HOME").expect("HOME should be set");
        assert_eq!(
            expand_tilde("~/.ssh/id_rsa"),
            Utf8PathBuf::from(format!("{home}/.ssh/id_rsa"))
        );
        assert_eq!(expand_tilde("/etc/key"), Utf8PathBuf::from("/etc/key"));
    }
}
