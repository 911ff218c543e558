//! Tailscale client installation and login.

use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::shell::ShellCommand;
use crate::step::{Advisory, Applied, Probe, Step, StepContext, StepError};

const INSTALLER: &str = "https://tailscale.com/install.sh";

/// Backend state reported by `tailscale status --json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailscaleStatus {
    /// Connected to the tailnet.
    Running,
    /// Connecting.
    Starting,
    /// Logged in but disconnected.
    Stopped,
    /// Never logged in, or the login expired.
    NeedsLogin,
    /// Logged in and waiting for an administrator to approve the node.
    NeedsMachineAuth,
    /// The daemon has not initialised yet.
    NoState,
}

/// Errors raised while reading the client status.
#[derive(Debug, Error)]
pub enum TailscaleStatusError {
    /// Raised when the status document is not JSON.
    #[error("tailscale status is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    /// Raised for a backend state this tool does not know.
    #[error("unknown tailscale backend state {0:?}")]
    Unknown(String),
}

impl FromStr for TailscaleStatus {
    type Err = TailscaleStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Running" => Ok(Self::Running),
            "Starting" => Ok(Self::Starting),
            "Stopped" => Ok(Self::Stopped),
            "NeedsLogin" => Ok(Self::NeedsLogin),
            "NeedsMachineAuth" => Ok(Self::NeedsMachineAuth),
            "NoState" => Ok(Self::NoState),
            other => Err(TailscaleStatusError::Unknown(other.to_owned())),
        }
    }
}

#[derive(Deserialize)]
struct StatusDocument {
    #[serde(rename = "BackendState")]
    backend_state: String,
}

/// Parses the `BackendState` of a `tailscale status --json` document.
///
/// # Errors
///
/// Returns [`TailscaleStatusError`] for malformed JSON or an unknown state.
pub fn parse_status(json: &str) -> Result<TailscaleStatus, TailscaleStatusError> {
    let document: StatusDocument = serde_json::from_str(json)?;
    document.backend_state.parse()
}

fn has_tailscale(ctx: &StepContext<'_>) -> Result<bool, StepError> {
    Ok(ctx
        .probe(&ShellCommand::new("command").arg("-v").arg("tailscale"))?
        .success())
}

/// Installs the Tailscale client.
#[derive(Debug, Clone, Copy, Default)]
pub struct TailscaleInstall;

impl Step for TailscaleInstall {
    type Pending = ();

    fn title(&self) -> String {
        String::from("Installing Tailscale")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<()>, StepError> {
        Ok(if has_tailscale(ctx)? {
            Probe::Satisfied
        } else {
            Probe::Pending(())
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, (): ()) -> Result<Applied, StepError> {
        ctx.sudo(
            "install tailscale",
            &ShellCommand::new("curl")
                .arg("-fsSL")
                .arg(INSTALLER)
                .pipe(ShellCommand::new("sh")),
        )?;
        Ok(Applied::Done)
    }
}

/// Brings the client up, logging in when an auth key is available.
#[derive(Clone)]
pub struct TailscaleUp {
    auth_key: Option<String>,
}

impl TailscaleUp {
    /// Step logging in with `auth_key`, if given.
    #[must_use]
    pub const fn new(auth_key: Option<String>) -> Self {
        Self { auth_key }
    }
}

impl Step for TailscaleUp {
    type Pending = TailscaleStatus;

    fn title(&self) -> String {
        String::from("Starting Tailscale")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<TailscaleStatus>, StepError> {
        let output = ctx.probe(
            &ShellCommand::new("tailscale")
                .arg("status")
                .arg("--json"),
        )?;
        let status = parse_status(&output.stdout)
            .map_err(|err| StepError::parse("tailscale status", err.to_string()))?;
        Ok(match status {
            TailscaleStatus::Running | TailscaleStatus::Starting => Probe::Satisfied,
            pending => Probe::Pending(pending),
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, status: TailscaleStatus) -> Result<Applied, StepError> {
        if status == TailscaleStatus::NeedsMachineAuth {
            return Ok(Applied::NeedsOperator(Advisory::VpnLogin {
                reason: String::from("the node is waiting for approval in the Tailscale admin console"),
            }));
        }
        let up = ShellCommand::new("tailscale").arg("up");
        let command = match (&self.auth_key, status) {
            (Some(key), _) => up.arg("--auth-key").secret(key),
            (None, TailscaleStatus::Stopped) => up,
            (None, _) => {
                return Ok(Applied::NeedsOperator(Advisory::VpnLogin {
                    reason: String::from("Tailscale is installed but not logged in; no auth key was supplied"),
                }));
            }
        };
        ctx.sudo("start tailscale", &command)?;
        Ok(Applied::Done)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(r#"{"BackendState": "Running", "Self": {}}"#, TailscaleStatus::Running)]
    #[case(r#"{"BackendState": "NeedsLogin"}"#, TailscaleStatus::NeedsLogin)]
    #[case(r#"{"BackendState": "Stopped"}"#, TailscaleStatus::Stopped)]
    #[case(r#"{"BackendState": "NeedsMachineAuth"}"#, TailscaleStatus::NeedsMachineAuth)]
    fn parses_backend_state(#[case] json: &str, #[case] expected: TailscaleStatus) {
        assert_eq!(parse_status(json).expect("status should parse"), expected);
    }

    #[test]
    fn unknown_state_is_an_error() {
        assert!(matches!(
            parse_status(r#"{"BackendState": "Exploding"}"#),
            Err(TailscaleStatusError::Unknown(state)) if state == "Exploding"
        ));
    }

    #[test]
    fn non_json_is_an_error() {
        assert!(matches!(
            parse_status("failed to connect to local tailscaled"),
            Err(TailscaleStatusError::Decode(_))
        ));
    }
}
