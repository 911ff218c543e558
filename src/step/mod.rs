//! The probe → compare → mutate pattern shared by every provisioning action.
//!
//! A [`Step`] inspects live remote state in [`Step::probe`] and only reaches
//! [`Step::apply`] when the probe reports pending work. [`run_step`] drives
//! that sequence and folds the result into a single [`StepOutcome`]; hard
//! failures travel as `Err(StepError)`.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::keys::KeySourceError;
use crate::network::NetworkError;
use crate::session::{CommandOutput, RemoteSession, SessionError};
use crate::shell::{IdentifierError, ShellCommand};


/// Result of probing live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<P> {
    /// Desired state is already present.
    Satisfied,
    /// Work remains; the payload tells `apply` what to change.
    Pending(P),
}

/// Result of a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Desired state reached.
    Done,
    /// The mutation failed in a way an out-of-band action usually fixes.
    Degraded(Advisory),
    /// Nothing was changed because an operator must act first.
    NeedsOperator(Advisory),
}

/// Folded outcome of one step that did not fail hard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Probe found the desired state; nothing was mutated.
    Unchanged,
    /// Mutation applied and the host is in the desired state.
    Changed,
    /// Soft failure recorded; later steps still run.
    SoftFailure(Advisory),
    /// Manual follow-up required; later steps still run.
    NeedsOperator(Advisory),
}

/// Follow-up the operator must perform after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    /// A reboot is expected to resolve the condition.
    Reboot {
        /// What went wrong and why a reboot helps.
        reason: String,
    },
    /// The VPN client is installed but not logged in.
    VpnLogin {
        /// Why login did not happen.
        reason: String,
    },
}

impl Advisory {
    /// Human-readable description.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Reboot { reason } | Self::VpnLogin { reason } => reason,
        }
    }

    /// Concrete command the operator should run next.
    #[must_use]
    pub fn next_command(&self, user: &str, host: &str) -> String {
        match self {
            Self::Reboot { .. } => format!("ssh {user}@{host} sudo reboot"),
            Self::VpnLogin { .. } => format!("ssh {user}@{host} sudo tailscale up"),
        }
    }
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Hard step failure.
#[derive(Debug, Error)]
pub enum StepError {
    /// Raised when the transport fails mid-step.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Raised when a command expected to succeed exits non-zero.
    #[error("{context}: `{command}` exited with {status}: {stderr}")]
    Command {
        /// What the command was meant to do.
        context: String,
        /// Redacted command line.
        command: String,
        /// Exit status, or `none` when the channel reported none.
        status: ExitStatus,
        /// Trimmed stderr.
        stderr: String,
    },
    /// Raised when command output has an unexpected shape.
    #[error("could not parse {context}: {message}")]
    Parse {
        /// What was being parsed.
        context: String,
        /// Details of the mismatch.
        message: String,
    },
    /// Raised when the host is in a state the step refuses to touch.
    #[error("{0}")]
    Precondition(String),
    /// Raised when an input value is unsafe to interpolate.
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    /// Raised when authorized keys cannot be fetched.
    #[error("authorized keys unavailable: {0}")]
    Keys(#[from] KeySourceError),
    /// Raised when network reconciliation fails.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Exit status wrapper rendering `none` for a missing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub Option<i32>);

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "status {code}"),
            None => f.write_str("no status"),
        }
    }
}

impl StepError {
    /// Builds a [`StepError::Command`] from a failed output.
    #[must_use]
    pub fn command(context: &str, command: &ShellCommand, output: &CommandOutput) -> Self {
        Self::Command {
            context: context.to_owned(),
            command: command.redacted(),
            status: ExitStatus(output.exit_status),
            stderr: output.stderr.trim().to_owned(),
        }
    }

    /// Builds a [`StepError::Parse`].
    #[must_use]
    pub fn parse(context: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            context: context.to_owned(),
            message: message.into(),
        }
    }
}

/// Everything a step needs to talk to the host.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    session: &'a dyn RemoteSession,
    sudo_password: Option<&'a str>,
}

impl<'a> StepContext<'a> {
    /// Creates a context; `sudo_password` is fed to sudo when present.
    #[must_use]
    pub const fn new(session: &'a dyn RemoteSession, sudo_password: Option<&'a str>) -> Self {
        Self {
            session,
            sudo_password,
        }
    }

    /// Underlying session.
    #[must_use]
    pub const fn session(&self) -> &'a dyn RemoteSession {
        self.session
    }

    /// Runs a read-only command; its exit status is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Session`] on transport failure.
    pub fn probe(&self, command: &ShellCommand) -> Result<CommandOutput, StepError> {
        Ok(self.session.run(command)?)
    }

    /// Runs a command that must succeed.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Command`] on a non-zero exit.
    pub fn run(&self, context: &str, command: &ShellCommand) -> Result<CommandOutput, StepError> {
        let output = self.session.run(command)?;
        expect_success(context, command, output)
    }

    /// Runs a read-only command as root; its exit status is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Session`] on transport failure.
    pub fn probe_privileged(&self, command: &ShellCommand) -> Result<CommandOutput, StepError> {
        Ok(self
            .session
            .run_privileged(command, self.sudo_password, None)?)
    }

    /// Runs a command as root that must succeed.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Command`] on a non-zero exit.
    pub fn sudo(&self, context: &str, command: &ShellCommand) -> Result<CommandOutput, StepError> {
        let output = self
            .session
            .run_privileged(command, self.sudo_password, None)?;
        expect_success(context, command, output)
    }

    /// Runs an unprivileged command with `input` on stdin, status unchecked.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Session`] on transport failure.
    pub fn probe_with_input(
        &self,
        command: &ShellCommand,
        input: &str,
    ) -> Result<CommandOutput, StepError> {
        Ok(self.session.exec(command, Some(input))?)
    }

    /// Replaces a remote file owned by the connected user.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Session`] when the transfer fails.
    pub fn write_file(&self, path: &str, content: &str) -> Result<(), StepError> {
        Ok(self.session.write_file(path, content)?)
    }
}

/// Turns a non-zero exit into a [`StepError::Command`].
///
/// # Errors
///
/// Returns [`StepError::Command`] unless `output` reports status zero.
pub fn expect_success(
    context: &str,
    command: &ShellCommand,
    output: CommandOutput,
) -> Result<CommandOutput, StepError> {
    if output.success() {
        Ok(output)
    } else {
        Err(StepError::command(context, command, &output))
    }
}

/// A single idempotent provisioning action.
pub trait Step {
    /// Work description handed from `probe` to `apply`.
    type Pending;

    /// Progress title shown to the operator.
    fn title(&self) -> String;

    /// Inspects live state without mutating it.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the state cannot be determined.
    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<Self::Pending>, StepError>;

    /// Converges the host using what `probe` found.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when a mutation fails hard.
    fn apply(&self, ctx: &StepContext<'_>, pending: Self::Pending) -> Result<Applied, StepError>;
}

/// Probes, and applies only when the probe found pending work.
///
/// # Errors
///
/// Propagates hard failures from either phase.
pub fn run_step<S: Step + ?Sized>(step: &S, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
    match step.probe(ctx)? {
        Probe::Satisfied => {
            debug!(step = %step.title(), "already in desired state");
            Ok(StepOutcome::Unchanged)
        }
        Probe::Pending(pending) => {
            debug!(step = %step.title(), "applying");
            Ok(match step.apply(ctx, pending)? {
                Applied::Done => StepOutcome::Changed,
                Applied::Degraded(advisory) => StepOutcome::SoftFailure(advisory),
                Applied::NeedsOperator(advisory) => StepOutcome::NeedsOperator(advisory),
            })
        }
    }
}

/// Home directory of `user` on a Raspberry Pi OS host.
#[must_use]
pub fn home_dir(user: &str) -> String {
    if user == "root" {
        String::from("/root")
    } else {
        format!("/home/{user}")
    }
}
