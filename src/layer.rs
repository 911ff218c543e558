//! Linear state machine shared by the provisioning layers.
//!
//! A layer connects, runs its steps strictly in order over one session, and
//! closes the session exactly once whatever happens. A hard step failure
//! stops the sequence; soft failures and manual follow-ups are recorded and
//! the sequence continues.

use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

use crate::report::{Mark, Reporter, StepStatus};
use crate::session::{Connector, Credential, SessionError, SshTarget};
use crate::step::{Advisory, Step, StepContext, StepError, StepOutcome, run_step};

/// Which provisioning phase a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Layer 1: deployer account and sshd hardening.
    Hardening,
    /// Layer 2: shell, dotfiles, VPN, container runtime.
    Bootstrap,
    /// Standalone static addressing.
    Network,
    /// Standalone authorized-keys upload.
    AuthorizedKeys,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hardening => "layer 1",
            Self::Bootstrap => "layer 2",
            Self::Network => "network",
            Self::AuthorizedKeys => "authorized keys",
        })
    }
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    /// Progress title.
    pub title: String,
    /// What happened.
    pub status: StepStatus,
}

/// Ordered outcome of a layer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerReport {
    /// Layer that produced the report.
    pub layer: Layer,
    /// Host the layer ran against.
    pub target: SshTarget,
    /// Steps in execution order.
    pub steps: Vec<StepRecord>,
    /// Set when the host refused the credential type because it was
    /// already hardened; no steps ran.
    pub already_provisioned: bool,
}

impl LayerReport {
    /// Empty report for `layer` against `target`.
    #[must_use]
    pub const fn new(layer: Layer, target: SshTarget) -> Self {
        Self {
            layer,
            target,
            steps: Vec::new(),
            already_provisioned: false,
        }
    }

    /// Advisories from soft failures.
    #[must_use]
    pub fn soft_failures(&self) -> Vec<&Advisory> {
        self.steps
            .iter()
            .filter_map(|record| match &record.status {
                StepStatus::SoftFailure(advisory) => Some(advisory),
                _ => None,
            })
            .collect()
    }

    /// Advisories that need the operator.
    #[must_use]
    pub fn manual_follow_ups(&self) -> Vec<&Advisory> {
        self.steps
            .iter()
            .filter_map(|record| match &record.status {
                StepStatus::NeedsOperator(advisory) => Some(advisory),
                _ => None,
            })
            .collect()
    }

    /// Returns `true` when any step soft-failed.
    #[must_use]
    pub fn has_soft_failure(&self) -> bool {
        !self.soft_failures().is_empty()
    }

    /// Returns `true` when any step needs a manual follow-up.
    #[must_use]
    pub fn needs_manual_follow_up(&self) -> bool {
        !self.manual_follow_ups().is_empty()
    }

    /// Returns `true` when any step mutated the host.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.steps
            .iter()
            .any(|record| matches!(record.status, StepStatus::Changed | StepStatus::SoftFailure(_)))
    }

    /// Status of the step titled `title`.
    #[must_use]
    pub fn status_of(&self, title: &str) -> Option<&StepStatus> {
        self.steps
            .iter()
            .find(|record| record.title == title)
            .map(|record| &record.status)
    }
}

/// Errors that abort a layer.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Raised before connecting when the request is inconsistent.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Raised when the session cannot be opened.
    #[error("error connecting to {target}: {source}")]
    Connect {
        /// Endpoint that was dialled.
        target: String,
        /// Transport failure.
        #[source]
        source: SessionError,
    },
    /// Raised when a step fails hard. Carries everything done before it.
    #[error("{title} failed: {source}")]
    Step {
        /// Title of the failing step.
        title: String,
        /// Cause.
        #[source]
        source: StepError,
        /// Steps completed before the failure, plus the failing one.
        report: Box<LayerReport>,
    },
}

impl LayerError {
    /// Partial report, when the failure happened after connecting.
    #[must_use]
    pub fn report(&self) -> Option<&LayerReport> {
        match self {
            Self::Step { report, .. } => Some(report),
            Self::Invalid(_) | Self::Connect { .. } => None,
        }
    }
}

/// Step sequencer bound to one open session.
pub struct LayerRun<'a> {
    ctx: StepContext<'a>,
    reporter: &'a mut dyn Reporter,
    report: LayerReport,
}

impl<'a> LayerRun<'a> {
    /// Starts an empty run.
    pub fn new(
        layer: Layer,
        ctx: StepContext<'a>,
        reporter: &'a mut dyn Reporter,
    ) -> Self {
        let target = ctx.session().target().clone();
        Self {
            ctx,
            reporter,
            report: LayerReport::new(layer, target),
        }
    }

    /// Step context for this run.
    #[must_use]
    pub const fn context(&self) -> &StepContext<'a> {
        &self.ctx
    }

    /// Runs `step` and records its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Step`] on a hard failure; the caller must stop.
    pub fn step<S: Step + ?Sized>(&mut self, step: &S) -> Result<StepOutcome, LayerError> {
        let title = step.title();
        self.reporter.started(&title);
        match run_step(step, &self.ctx) {
            Ok(outcome) => {
                let status = StepStatus::from(outcome.clone());
                self.reporter.finished(&title, status.mark());
                self.report.steps.push(StepRecord { title, status });
                Ok(outcome)
            }
            Err(source) => {
                self.reporter.finished(&title, Mark::Fail);
                self.report.steps.push(StepRecord {
                    title: title.clone(),
                    status: StepStatus::Failed(source.to_string()),
                });
                Err(LayerError::Step {
                    title,
                    source,
                    report: Box::new(self.report.clone()),
                })
            }
        }
    }

    /// Finalises the report.
    #[must_use]
    pub fn finish(self) -> LayerReport {
        self.report
    }
}

/// How a connection refusal for an unsupported auth method is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedAuth {
    /// Abort with [`LayerError::Connect`].
    Fatal,
    /// Treat as evidence the host is already hardened.
    AlreadyProvisioned,
}

/// Connection parameters for a layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerSession<'a> {
    /// Endpoint to dial.
    pub target: &'a SshTarget,
    /// Credential to authenticate with.
    pub credential: &'a Credential,
    /// Password fed to sudo, if sudo needs one.
    pub sudo_password: Option<&'a str>,
    /// Handling of unsupported auth methods.
    pub unsupported_auth: UnsupportedAuth,
}

/// Connects, runs `body`, and closes the session exactly once.
///
/// # Errors
///
/// Returns [`LayerError::Connect`] when connecting fails (subject to
/// [`UnsupportedAuth`]) and whatever `body` returns otherwise.
pub fn run_layer<F>(
    layer: Layer,
    connector: &dyn Connector,
    session: LayerSession<'_>,
    reporter: &mut dyn Reporter,
    body: F,
) -> Result<LayerReport, LayerError>
where
    F: FnOnce(&mut LayerRun<'_>) -> Result<(), LayerError>,
{
    let title = format!("Connecting to {}", session.target);
    reporter.started(&title);
    let mut remote = match connector.connect(session.target, session.credential) {
        Ok(remote) => {
            reporter.finished(&title, Mark::Ok);
            remote
        }
        Err(err)
            if session.unsupported_auth == UnsupportedAuth::AlreadyProvisioned
                && err.is_auth_method_unsupported() =>
        {
            reporter.finished(&title, Mark::Skipped);
            info!(target_host = %session.target, %layer, "host no longer accepts this login; already provisioned");
            let mut report = LayerReport::new(layer, session.target.clone());
            report.already_provisioned = true;
            return Ok(report);
        }
        Err(source) => {
            reporter.finished(&title, Mark::Fail);
            return Err(LayerError::Connect {
                target: session.target.to_string(),
                source,
            });
        }
    };

    let result = {
        let ctx = StepContext::new(remote.as_ref(), session.sudo_password);
        let mut run = LayerRun::new(layer, ctx, reporter);
        body(&mut run).map(|()| run.finish())
    };

    if let Err(err) = remote.close() {
        warn!(target_host = %session.target, error = %err, "failed to close session");
    }
    result
}
