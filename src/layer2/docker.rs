//! Container runtime installation and group membership.
//!
//! [`DockerInstall`] is the one step in layer 2 allowed to fail softly: the
//! convenience script regularly needs a reboot before it completes cleanly.

use tracing::warn;

use crate::shell::ShellCommand;
use crate::step::{Advisory, Applied, ExitStatus, Probe, Step, StepContext, StepError};

const INSTALLER_URL: &str = "https://get.docker.com";
const INSTALLER_PATH: &str = "/tmp/get-docker.sh";

/// Installs Docker Engine with the compose v2 plugin.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerInstall;

impl Step for DockerInstall {
    type Pending = ();

    fn title(&self) -> String {
        String::from("Installing Docker")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<()>, StepError> {
        let installed = ctx
            .probe(&ShellCommand::new("command").arg("-v").arg("docker"))?
            .success();
        if !installed {
            return Ok(Probe::Pending(()));
        }
        let compose = ctx.probe(&ShellCommand::new("docker").arg("compose").arg("version"))?;
        if !compose.success() {
            return Err(StepError::Precondition(String::from(
                "docker is installed without the compose v2 plugin; install docker-compose-plugin or remove docker first",
            )));
        }
        Ok(Probe::Satisfied)
    }

    fn apply(&self, ctx: &StepContext<'_>, (): ()) -> Result<Applied, StepError> {
        ctx.run(
            "download docker installer",
            &ShellCommand::new("curl")
                .arg("-fsSL")
                .arg(INSTALLER_URL)
                .args(["-o", INSTALLER_PATH]),
        )?;
        let installer = ctx.probe_privileged(&ShellCommand::new("sh").arg(INSTALLER_PATH));
        let cleanup = ctx.probe(&ShellCommand::new("rm").arg("-f").arg(INSTALLER_PATH));
        if !cleanup.as_ref().is_ok_and(|output| output.success()) {
            warn!(path = INSTALLER_PATH, "failed to remove docker installer");
        }

        let output = installer?;
        if output.success() {
            return Ok(Applied::Done);
        }
        Ok(Applied::Degraded(Advisory::Reboot {
            reason: format!(
                "docker installer exited with {}: {}",
                ExitStatus(output.exit_status),
                output.stderr.trim()
            ),
        }))
    }
}

/// Adds the user to the `docker` group.
#[derive(Debug, Clone)]
pub struct DockerGroup {
    user: String,
}

impl DockerGroup {
    /// Step for `user`.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Step for DockerGroup {
    type Pending = ();

    fn title(&self) -> String {
        format!("Adding {} to the docker group", self.user)
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<()>, StepError> {
        let groups = ctx.run(
            "list groups",
            &ShellCommand::new("id").arg("-nG").arg(&self.user),
        )?;
        Ok(if groups.stdout.split_whitespace().any(|group| group == "docker") {
            Probe::Satisfied
        } else {
            Probe::Pending(())
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, (): ()) -> Result<Applied, StepError> {
        ctx.sudo(
            "grant docker group",
            &ShellCommand::new("groupadd")
                .args(["-f", "docker"])
                .and(
                    ShellCommand::new("usermod")
                        .args(["-aG", "docker"])
                        .arg(&self.user),
                ),
        )?;
        Ok(Applied::Done)
    }
}
