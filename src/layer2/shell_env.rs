//! Interactive shell setup: zsh, oh-my-zsh, plugins, and the prompt theme.
//!
//! The rc file is edited locally with regex substitutions and written back
//! in one transfer, only when the rewritten content differs.

use regex::{NoExpand, Regex};

use super::packages::install_command;
use crate::shell::ShellCommand;
use crate::step::{Applied, Probe, Step, StepContext, StepError, home_dir};

const OH_MY_ZSH_INSTALLER: &str =
    "https://raw.githubusercontent.com/ohmyzsh/ohmyzsh/master/tools/install.sh";
const ZSH: &str = "/usr/bin/zsh";

/// Plugin repositories cloned into the oh-my-zsh custom tree.
pub const CUSTOM_PLUGINS: &[(&str, &str)] = &[
    (
        "zsh-autosuggestions",
        "https://github.com/zsh-users/zsh-autosuggestions.git",
    ),
    (
        "zsh-syntax-highlighting",
        "https://github.com/zsh-users/zsh-syntax-highlighting.git",
    ),
    ("fzf-zsh-plugin", "https://github.com/unixorn/fzf-zsh-plugin.git"),
];

/// Plugins enabled in `.zshrc`, in rendering order.
pub const ENABLED_PLUGINS: &[&str] = &[
    "fzf-zsh-plugin",
    "git",
    "zsh-autosuggestions",
    "zsh-syntax-highlighting",
];

const THEME_NAME: &str = "powerlevel10k";
const THEME_REPOSITORY: &str = "https://github.com/romkatv/powerlevel10k.git";
const THEME_LINE: &str = "ZSH_THEME=\"powerlevel10k/powerlevel10k\"";
const WIZARD_LINE: &str = "POWERLEVEL9K_DISABLE_CONFIGURATION_WIZARD=true";

fn oh_my_zsh_dir(user: &str) -> String {
    format!("{}/.oh-my-zsh", home_dir(user))
}

fn zshrc(user: &str) -> String {
    format!("{}/.zshrc", home_dir(user))
}

fn pattern(source: &str) -> Result<Regex, StepError> {
    Regex::new(source).map_err(|err| StepError::parse("rc pattern", err.to_string()))
}

fn append_line(rc: &str, line: &str) -> String {
    let mut updated = rc.to_owned();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(line);
    updated.push('\n');
    updated
}

/// Replaces the `plugins=(...)` block, or appends one.
///
/// # Errors
///
/// Returns [`StepError::Parse`] if the substitution pattern cannot compile.
pub fn set_plugins(rc: &str, plugins: &[&str]) -> Result<String, StepError> {
    let block = format!(
        "plugins=(\n{}\n)",
        plugins
            .iter()
            .map(|plugin| format!("  {plugin}"))
            .collect::<Vec<_>>()
            .join("\n")
    );
    let re = pattern(r"(?m)^plugins=\([^)]*\)")?;
    if re.is_match(rc) {
        Ok(re.replace(rc, NoExpand(&block)).into_owned())
    } else {
        Ok(append_line(rc, &block))
    }
}

/// Points `ZSH_THEME` at powerlevel10k and disables its setup wizard.
///
/// # Errors
///
/// Returns [`StepError::Parse`] if the substitution pattern cannot compile.
pub fn set_theme(rc: &str) -> Result<String, StepError> {
    let re = pattern(r"(?m)^ZSH_THEME=.*$")?;
    let themed = if re.is_match(rc) {
        re.replace_all(rc, NoExpand(THEME_LINE)).into_owned()
    } else {
        append_line(rc, THEME_LINE)
    };
    if themed.lines().any(|line| line.trim() == WIZARD_LINE) {
        Ok(themed)
    } else {
        Ok(append_line(&themed, WIZARD_LINE))
    }
}

fn read_rc(ctx: &StepContext<'_>, user: &str) -> Result<String, StepError> {
    let output = ctx.probe(&ShellCommand::new("cat").arg(zshrc(user)))?;
    Ok(if output.success() {
        output.stdout
    } else {
        String::new()
    })
}

fn directory_exists(ctx: &StepContext<'_>, path: &str) -> Result<bool, StepError> {
    Ok(ctx
        .probe(&ShellCommand::new("test").arg("-d").arg(path))?
        .success())
}

fn clone_shallow(ctx: &StepContext<'_>, repository: &str, destination: &str) -> Result<(), StepError> {
    ctx.run(
        "clone repository",
        &ShellCommand::new("git")
            .arg("clone")
            .args(["--depth", "1"])
            .arg(repository)
            .arg(destination),
    )?;
    Ok(())
}

/// Installs zsh and makes it the login shell.
#[derive(Debug, Clone)]
pub struct Zsh {
    user: String,
}

/// What [`Zsh`] still has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZshDrift {
    /// The package is missing.
    pub install: bool,
}

impl Zsh {
    /// Step for `user`.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Step for Zsh {
    type Pending = ZshDrift;

    fn title(&self) -> String {
        String::from("Installing zsh")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<ZshDrift>, StepError> {
        let installed = ctx
            .probe(&ShellCommand::new("command").arg("-v").arg("zsh"))?
            .success();
        let entry = ctx.run(
            "read account entry",
            &ShellCommand::new("getent").arg("passwd").arg(&self.user),
        )?;
        let is_default = entry.stdout.trim().ends_with("/zsh");
        Ok(if installed && is_default {
            Probe::Satisfied
        } else {
            Probe::Pending(ZshDrift { install: !installed })
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, drift: ZshDrift) -> Result<Applied, StepError> {
        if drift.install {
            ctx.sudo("install zsh", &install_command(["zsh"]))?;
        }
        ctx.sudo(
            "set login shell",
            &ShellCommand::new("usermod").arg("-s").arg(ZSH).arg(&self.user),
        )?;
        Ok(Applied::Done)
    }
}

/// Installs oh-my-zsh unattended.
#[derive(Debug, Clone)]
pub struct OhMyZsh {
    user: String,
}

impl OhMyZsh {
    /// Step for `user`.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Step for OhMyZsh {
    type Pending = ();

    fn title(&self) -> String {
        String::from("Installing oh-my-zsh")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<()>, StepError> {
        Ok(if directory_exists(ctx, &oh_my_zsh_dir(&self.user))? {
            Probe::Satisfied
        } else {
            Probe::Pending(())
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, (): ()) -> Result<Applied, StepError> {
        ctx.run(
            "install oh-my-zsh",
            &ShellCommand::new("curl")
                .arg("-fsSL")
                .arg(OH_MY_ZSH_INSTALLER)
                .pipe(ShellCommand::new("env").args([
                    "RUNZSH=no",
                    "CHSH=no",
                    "sh",
                    "-s",
                    "--",
                    "--unattended",
                ])),
        )?;
        Ok(Applied::Done)
    }
}

/// Work left for [`ShellPlugins`] or [`PromptTheme`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcDrift {
    /// `(repository, destination)` pairs to clone.
    pub clones: Vec<(&'static str, String)>,
    /// New rc content, when it differs.
    pub rc: Option<String>,
}

impl RcDrift {
    fn into_probe(self) -> Probe<Self> {
        if self.clones.is_empty() && self.rc.is_none() {
            Probe::Satisfied
        } else {
            Probe::Pending(self)
        }
    }

    fn apply(self, ctx: &StepContext<'_>, user: &str) -> Result<Applied, StepError> {
        for (repository, destination) in &self.clones {
            clone_shallow(ctx, repository, destination)?;
        }
        if let Some(content) = self.rc {
            ctx.write_file(&zshrc(user), &content)?;
        }
        Ok(Applied::Done)
    }
}

fn rc_drift(current: &str, rewritten: String) -> Option<String> {
    (rewritten != current).then_some(rewritten)
}

/// Clones custom plugins and rewrites the `plugins=(...)` list.
#[derive(Debug, Clone)]
pub struct ShellPlugins {
    user: String,
}

impl ShellPlugins {
    /// Step for `user`.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Step for ShellPlugins {
    type Pending = RcDrift;

    fn title(&self) -> String {
        String::from("Configuring zsh plugins")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<RcDrift>, StepError> {
        let custom = format!("{}/custom/plugins", oh_my_zsh_dir(&self.user));
        let mut clones = Vec::new();
        for (name, repository) in CUSTOM_PLUGINS {
            let destination = format!("{custom}/{name}");
            if !directory_exists(ctx, &destination)? {
                clones.push((*repository, destination));
            }
        }
        let current = read_rc(ctx, &self.user)?;
        let rewritten = set_plugins(&current, ENABLED_PLUGINS)?;
        Ok(RcDrift {
            clones,
            rc: rc_drift(&current, rewritten),
        }
        .into_probe())
    }

    fn apply(&self, ctx: &StepContext<'_>, drift: RcDrift) -> Result<Applied, StepError> {
        drift.apply(ctx, &self.user)
    }
}

/// Installs the powerlevel10k prompt theme.
#[derive(Debug, Clone)]
pub struct PromptTheme {
    user: String,
}

impl PromptTheme {
    /// Step for `user`.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Step for PromptTheme {
    type Pending = RcDrift;

    fn title(&self) -> String {
        String::from("Installing powerlevel10k theme")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<RcDrift>, StepError> {
        let destination = format!("{}/custom/themes/{THEME_NAME}", oh_my_zsh_dir(&self.user));
        let clones = if directory_exists(ctx, &destination)? {
            Vec::new()
        } else {
            vec![(THEME_REPOSITORY, destination)]
        };
        let current = read_rc(ctx, &self.user)?;
        let rewritten = set_theme(&current)?;
        Ok(RcDrift {
            clones,
            rc: rc_drift(&current, rewritten),
        }
        .into_probe())
    }

    fn apply(&self, ctx: &StepContext<'_>, drift: RcDrift) -> Result<Applied, StepError> {
        drift.apply(ctx, &self.user)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const BLOCK: &str = "plugins=(\n  fzf-zsh-plugin\n  git\n  zsh-autosuggestions\n  zsh-syntax-highlighting\n)";

    #[rstest]
    #[case("export ZSH=$HOME/.oh-my-zsh\nplugins=(git)\nsource $ZSH/oh-my-zsh.sh\n")]
    #[case("plugins=(\n  git\n  docker\n)\n")]
    fn plugin_block_is_substituted(#[case] rc: &str) {
        let updated = set_plugins(rc, ENABLED_PLUGINS).expect("rewrite");
        assert!(updated.contains(BLOCK), "{updated}");
        assert_eq!(updated.matches("plugins=(").count(), 1);
        assert_eq!(set_plugins(&updated, ENABLED_PLUGINS).expect("rewrite"), updated);
    }

    #[test]
    fn plugin_block_is_appended_when_absent() {
        let updated = set_plugins("export ZSH=$HOME/.oh-my-zsh", ENABLED_PLUGINS).expect("rewrite");
        assert_eq!(updated, format!("export ZSH=$HOME/.oh-my-zsh\n{BLOCK}\n"));
    }

    #[test]
    fn theme_replaces_existing_and_adds_wizard_flag() {
        let updated = set_theme("ZSH_THEME=\"robbyrussell\"\nplugins=(git)\n").expect("rewrite");
        assert_eq!(
            updated,
            "ZSH_THEME=\"powerlevel10k/powerlevel10k\"\nplugins=(git)\nPOWERLEVEL9K_DISABLE_CONFIGURATION_WIZARD=true\n"
        );
        assert_eq!(set_theme(&updated).expect("rewrite"), updated);
    }

    #[test]
    fn replacement_text_is_not_expanded() {
        let updated = set_theme("ZSH_THEME=$OLD\n").expect("rewrite");
        assert!(updated.starts_with(THEME_LINE));
    }
}
