//! Layer 1: replace the factory login with a hardened deployer account.

use crate::keys::{AuthorizedKeysStep, KeySource, MergePolicy};
use crate::layer::{
    Layer, LayerError, LayerReport, LayerSession, UnsupportedAuth, run_layer,
};
use crate::network::{NetworkStep, StaticAddressing};
use crate::report::Reporter;
use crate::session::{Connector, Credential, SshTarget};
use crate::shell::{IdentifierError, validate_account_name, validate_hostname};

mod sshd;
mod steps;

pub use sshd::{
    DirectiveEdit, SSHD_BACKUP, SSHD_CONFIG, SSHD_STAGING, SshdHardening, apply_edits, plan_edits,
};
pub use steps::{
    DisableLogin, EnsureGroup, EnsureUser, MissingRule, RootPassword, SetHostname, ShadowHash,
    SudoersGrant, parse_shadow_hash, rewrite_hosts,
};

/// Account that replaces the factory login.
#[derive(Clone)]
pub struct DeployerAccount {
    /// User name.
    pub user: String,
    /// Primary group, granted passwordless sudo.
    pub group: String,
    /// Login password set through `chpasswd`.
    pub password: String,
}

/// Inputs for a hardening run.
#[derive(Clone)]
pub struct HardeningRequest {
    /// Factory login, for example `pi@10.0.0.12:22`.
    pub target: SshTarget,
    /// Factory login password; also fed to sudo.
    pub password: String,
    /// Account to create.
    pub deployer: DeployerAccount,
    /// New root password, when it should be set.
    pub root_password: Option<String>,
    /// Location of the deployer's authorized keys.
    pub keys_uri: String,
    /// How fetched keys combine with existing ones.
    pub merge: MergePolicy,
    /// New hostname, when the host should be renamed.
    pub hostname: Option<String>,
    /// Static addressing applied last, when requested.
    pub network: Option<StaticAddressing>,
}

impl HardeningRequest {
    /// Checks identifiers before anything is sent to the host.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Invalid`] for malformed names, a deployer equal
    /// to the login user, or inconsistent addressing.
    pub fn validate(&self) -> Result<(), LayerError> {
        let invalid = |err: IdentifierError| LayerError::Invalid(err.to_string());
        validate_account_name("user", &self.target.user).map_err(invalid)?;
        validate_account_name("user", &self.deployer.user).map_err(invalid)?;
        validate_account_name("group", &self.deployer.group).map_err(invalid)?;
        if self.deployer.user == self.target.user {
            return Err(LayerError::Invalid(format!(
                "deployer user must differ from the login user {}",
                self.target.user
            )));
        }
        if self.deployer.password.is_empty() {
            return Err(LayerError::Invalid(String::from(
                "deployer password must not be empty",
            )));
        }
        if self.keys_uri.trim().is_empty() {
            return Err(LayerError::Invalid(String::from(
                "an authorized keys location is required",
            )));
        }
        if let Some(hostname) = &self.hostname {
            validate_hostname(hostname).map_err(invalid)?;
        }
        if let Some(addressing) = &self.network {
            addressing
                .validate()
                .map_err(|err| LayerError::Invalid(err.to_string()))?;
        }
        Ok(())
    }
}

/// Runs the hardening steps in order over one password session.
pub struct HardeningOrchestrator<C, K> {
    connector: C,
    keys: K,
}

impl<C: Connector, K: KeySource> HardeningOrchestrator<C, K> {
    /// Orchestrator dialling through `connector` and fetching from `keys`.
    #[must_use]
    pub const fn new(connector: C, keys: K) -> Self {
        Self { connector, keys }
    }

    /// Executes layer 1.
    ///
    /// A host that no longer offers password authentication is reported as
    /// already provisioned without running any step.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError`] on an invalid request, a connection failure, or
    /// the first hard step failure.
    pub fn execute(
        &self,
        request: &HardeningRequest,
        reporter: &mut dyn Reporter,
    ) -> Result<LayerReport, LayerError> {
        request.validate()?;
        let credential = Credential::Password(request.password.clone());
        let session = LayerSession {
            target: &request.target,
            credential: &credential,
            sudo_password: Some(request.password.as_str()),
            unsupported_auth: UnsupportedAuth::AlreadyProvisioned,
        };
        let deployer = &request.deployer;

        run_layer(Layer::Hardening, &self.connector, session, reporter, |run| {
            run.step(&EnsureGroup::new(&deployer.group))?;
            run.step(&SudoersGrant::new(&deployer.group))?;
            run.step(&EnsureUser::new(
                &deployer.user,
                &deployer.group,
                &deployer.password,
            ))?;
            if let Some(root_password) = &request.root_password {
                run.step(&RootPassword::new(root_password))?;
            }
            run.step(&AuthorizedKeysStep::new(
                &deployer.user,
                &deployer.group,
                &request.keys_uri,
                &self.keys,
                request.merge,
            ))?;
            run.step(&SshdHardening)?;
            if let Some(hostname) = &request.hostname {
                run.step(&SetHostname::new(hostname))?;
            }
            run.step(&DisableLogin::new(&request.target.user))?;
            if let Some(addressing) = &request.network {
                run.step(&NetworkStep::new(addressing.clone()))?;
            }
            Ok(())
        })
    }
}
