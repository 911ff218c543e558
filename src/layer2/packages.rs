//! apt-driven package steps.

use std::collections::BTreeSet;

use tracing::debug;

use crate::shell::ShellCommand;
use crate::step::{Applied, Probe, Step, StepContext, StepError};

/// Utility packages every bootstrapped host carries.
pub const UTILITY_PACKAGES: &[&str] = &[
    "bat",
    "build-essential",
    "cmake",
    "cron",
    "curl",
    "git",
    "libffi-dev",
    "mailutils",
    "nano",
    "ripgrep",
    "sqlite3",
    "tcpdump",
    "wget",
];

fn noninteractive_apt() -> ShellCommand {
    ShellCommand::new("env")
        .arg("DEBIAN_FRONTEND=noninteractive")
        .arg("apt-get")
}

/// `apt-get install -y` for `packages`, without prompts.
#[must_use]
pub fn install_command<I, S>(packages: I) -> ShellCommand
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    noninteractive_apt().args(["install", "-y"]).args(packages)
}

/// Number of packages an `apt-get -s upgrade` simulation would install.
#[must_use]
pub fn pending_upgrades(simulation: &str) -> usize {
    simulation
        .lines()
        .filter(|line| line.starts_with("Inst "))
        .count()
}

/// Packages `dpkg-query` reports as fully installed.
#[must_use]
pub fn installed_packages(query: &str) -> BTreeSet<&str> {
    query
        .lines()
        .filter_map(|line| {
            let (name, status) = line.trim().split_once(' ')?;
            status
                .ends_with("install ok installed")
                .then_some(name.split(':').next().unwrap_or(name))
        })
        .collect()
}

/// Package lists younger than this many minutes count as fresh.
pub const INDEX_MAX_AGE_MINUTES: u32 = 24 * 60;

/// Work left for [`PackageIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRefresh {
    /// No package list was fetched within [`INDEX_MAX_AGE_MINUTES`].
    pub stale_index: bool,
    /// Upgrades the simulation reported against the current index.
    pub upgrades: usize,
}

fn fresh_lists_command() -> ShellCommand {
    ShellCommand::new("find")
        .arg("/var/lib/apt/lists")
        .args(["-maxdepth", "1", "-name", "*_Packages*", "-mmin"])
        .arg(format!("-{INDEX_MAX_AGE_MINUTES}"))
        .args(["-print", "-quit"])
}

/// Refreshes a stale package index and applies pending upgrades.
///
/// The probe only reads the list timestamps and simulates an upgrade;
/// `apt-get update` runs in `apply`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageIndex;

impl Step for PackageIndex {
    type Pending = PendingRefresh;

    fn title(&self) -> String {
        String::from("Updating and upgrading packages")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<PendingRefresh>, StepError> {
        let fresh = ctx.probe(&fresh_lists_command())?;
        let stale_index = !fresh.success() || fresh.stdout.trim().is_empty();
        let simulation = ctx.run(
            "simulate upgrade",
            &ShellCommand::new("apt-get").arg("-s").arg("upgrade"),
        )?;
        let upgrades = pending_upgrades(&simulation.stdout);
        if !stale_index && upgrades == 0 {
            return Ok(Probe::Satisfied);
        }
        Ok(Probe::Pending(PendingRefresh {
            stale_index,
            upgrades,
        }))
    }

    fn apply(&self, ctx: &StepContext<'_>, pending: PendingRefresh) -> Result<Applied, StepError> {
        ctx.sudo(
            "refresh package index",
            &ShellCommand::new("apt-get").arg("update").arg("-qq"),
        )?;
        debug!(
            stale_index = pending.stale_index,
            upgrades = pending.upgrades,
            "package index refreshed"
        );
        ctx.sudo(
            "upgrade packages",
            &noninteractive_apt().args(["upgrade", "-y"]),
        )?;
        Ok(Applied::Done)
    }
}

/// Work left for [`UtilityPackages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPackages {
    /// Packages to install.
    pub packages: Vec<&'static str>,
}

/// Installs [`UTILITY_PACKAGES`] and exposes Debian's `batcat` as `bat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtilityPackages;

impl UtilityPackages {
    fn has_bat(ctx: &StepContext<'_>) -> Result<bool, StepError> {
        Ok(ctx
            .probe(&ShellCommand::new("command").arg("-v").arg("bat"))?
            .success())
    }
}

impl Step for UtilityPackages {
    type Pending = MissingPackages;

    fn title(&self) -> String {
        String::from("Installing utility packages")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<MissingPackages>, StepError> {
        let query = ctx.probe(
            &ShellCommand::new("dpkg-query")
                .arg("-W")
                .arg("-f")
                .arg("${Package} ${Status}\\n")
                .args(UTILITY_PACKAGES),
        )?;
        let installed = installed_packages(&query.stdout);
        let packages: Vec<&'static str> = UTILITY_PACKAGES
            .iter()
            .copied()
            .filter(|package| !installed.contains(package))
            .collect();
        if packages.is_empty() && Self::has_bat(ctx)? {
            return Ok(Probe::Satisfied);
        }
        Ok(Probe::Pending(MissingPackages { packages }))
    }

    fn apply(&self, ctx: &StepContext<'_>, missing: MissingPackages) -> Result<Applied, StepError> {
        if !missing.packages.is_empty() {
            ctx.sudo("install utility packages", &install_command(&missing.packages))?;
        }
        if !Self::has_bat(ctx)? {
            let batcat = ctx.run(
                "locate batcat",
                &ShellCommand::new("command").arg("-v").arg("batcat"),
            )?;
            ctx.sudo(
                "link bat",
                &ShellCommand::new("ln")
                    .arg("-sf")
                    .arg(batcat.stdout.trim())
                    .arg("/usr/local/bin/bat"),
            )?;
        }
        Ok(Applied::Done)
    }
}
