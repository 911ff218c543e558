//! Layer 2: bootstrap the deployer's environment over key authentication.
//!
//! Requires layer 1 to have installed the deployer's keys and granted
//! passwordless sudo. Installer failures in [`DockerInstall`] are recorded
//! as soft failures; every other hard failure stops the run.

use camino::Utf8PathBuf;

use crate::layer::{
    Layer, LayerError, LayerReport, LayerSession, UnsupportedAuth, run_layer,
};
use crate::report::Reporter;
use crate::session::{Connector, Credential, SshTarget};
use crate::shell::validate_account_name;

mod docker;
mod packages;
mod shell_env;
mod tailscale;

pub use docker::{DockerGroup, DockerInstall};
pub use packages::{
    INDEX_MAX_AGE_MINUTES, MissingPackages, PackageIndex, PendingRefresh, UTILITY_PACKAGES,
    UtilityPackages, installed_packages, pending_upgrades,
};
pub use shell_env::{
    CUSTOM_PLUGINS, ENABLED_PLUGINS, OhMyZsh, PromptTheme, RcDrift, ShellPlugins, Zsh,
    set_plugins, set_theme,
};
pub use tailscale::{
    TailscaleInstall, TailscaleStatus, TailscaleStatusError, TailscaleUp, parse_status,
};

/// Inputs for a bootstrap run.
#[derive(Clone)]
pub struct BootstrapRequest {
    /// Deployer login, for example `deployer@10.0.0.50:22`.
    pub target: SshTarget,
    /// Private key authorised by layer 1.
    pub key_path: Utf8PathBuf,
    /// Passphrase for the key, if it has one.
    pub key_passphrase: Option<String>,
    /// Tailscale auth key; without it login is left to the operator.
    pub tailscale_auth_key: Option<String>,
}

impl BootstrapRequest {
    /// Checks the request before connecting.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Invalid`] for a malformed user name or an empty
    /// auth key.
    pub fn validate(&self) -> Result<(), LayerError> {
        validate_account_name("user", &self.target.user)
            .map_err(|err| LayerError::Invalid(err.to_string()))?;
        if self
            .tailscale_auth_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            return Err(LayerError::Invalid(String::from(
                "the Tailscale auth key must not be empty",
            )));
        }
        Ok(())
    }
}

/// Runs the bootstrap steps in order over one key-authenticated session.
pub struct BootstrapOrchestrator<C> {
    connector: C,
}

impl<C: Connector> BootstrapOrchestrator<C> {
    /// Orchestrator dialling through `connector`.
    #[must_use]
    pub const fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Executes layer 2.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError`] on an invalid request, any connection failure,
    /// or the first hard step failure.
    pub fn execute(
        &self,
        request: &BootstrapRequest,
        reporter: &mut dyn Reporter,
    ) -> Result<LayerReport, LayerError> {
        request.validate()?;
        let credential = Credential::Key {
            path: request.key_path.clone(),
            passphrase: request.key_passphrase.clone(),
        };
        let session = LayerSession {
            target: &request.target,
            credential: &credential,
            sudo_password: None,
            unsupported_auth: UnsupportedAuth::Fatal,
        };
        let user = request.target.user.as_str();

        run_layer(Layer::Bootstrap, &self.connector, session, reporter, |run| {
            run.step(&PackageIndex)?;
            run.step(&UtilityPackages)?;
            run.step(&Zsh::new(user))?;
            run.step(&OhMyZsh::new(user))?;
            run.step(&ShellPlugins::new(user))?;
            run.step(&PromptTheme::new(user))?;
            run.step(&TailscaleInstall)?;
            run.step(&TailscaleUp::new(request.tailscale_auth_key.clone()))?;
            run.step(&DockerInstall)?;
            run.step(&DockerGroup::new(user))?;
            Ok(())
        })
    }
}
