//! Account and host identity steps run by the hardening layer.

use tracing::debug;

use crate::shell::ShellCommand;
use crate::step::{Applied, Probe, Step, StepContext, StepError, expect_success, home_dir};

const SUDOERS: &str = "/etc/sudoers";
const SUDOERS_BACKUP: &str = "/etc/sudoers.bkp";
const HOSTS: &str = "/etc/hosts";
const NOLOGIN: &str = "/usr/sbin/nologin";

fn set_password(user: &str, password: &str) -> ShellCommand {
    ShellCommand::new("printf")
        .arg("%s\n")
        .secret(format!("{user}:{password}"))
        .pipe(ShellCommand::new("chpasswd"))
}

/// Creates the deployer group.
#[derive(Debug, Clone)]
pub struct EnsureGroup {
    group: String,
}

impl EnsureGroup {
    /// Step creating `group`.
    #[must_use]
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }
}

impl Step for EnsureGroup {
    type Pending = ();

    fn title(&self) -> String {
        format!("Creating group {}", self.group)
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<()>, StepError> {
        let output = ctx.probe(&ShellCommand::new("getent").arg("group").arg(&self.group))?;
        Ok(if output.success() {
            Probe::Satisfied
        } else {
            Probe::Pending(())
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, (): ()) -> Result<Applied, StepError> {
        ctx.sudo("create group", &ShellCommand::new("groupadd").arg(&self.group))?;
        Ok(Applied::Done)
    }
}

/// Grants the group passwordless sudo.
#[derive(Debug, Clone)]
pub struct SudoersGrant {
    group: String,
}

impl SudoersGrant {
    /// Step granting `group` passwordless sudo.
    #[must_use]
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }

    fn rule(&self) -> String {
        format!("%{} ALL=(ALL) NOPASSWD: ALL", self.group)
    }
}

/// Work left for [`SudoersGrant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingRule {
    /// The live file does not end in a newline, so the rule needs one first.
    pub unterminated: bool,
}

impl Step for SudoersGrant {
    type Pending = MissingRule;

    fn title(&self) -> String {
        format!("Granting passwordless sudo to {}", self.group)
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<MissingRule>, StepError> {
        let output = ctx.sudo("read sudoers", &ShellCommand::new("cat").arg(SUDOERS))?;
        let rule = self.rule();
        if output.stdout.lines().any(|line| line.trim() == rule) {
            return Ok(Probe::Satisfied);
        }
        Ok(Probe::Pending(MissingRule {
            unterminated: !output.stdout.is_empty() && !output.stdout.ends_with('\n'),
        }))
    }

    fn apply(&self, ctx: &StepContext<'_>, missing: MissingRule) -> Result<Applied, StepError> {
        ctx.sudo(
            "back up sudoers",
            &ShellCommand::new("cp").arg("-p").arg(SUDOERS).arg(SUDOERS_BACKUP),
        )?;
        let format = if missing.unterminated { "\n%s\n" } else { "%s\n" };
        ctx.sudo(
            "append sudoers rule",
            &ShellCommand::new("printf")
                .arg(format)
                .arg(self.rule())
                .append_to(SUDOERS),
        )?;

        let check = ShellCommand::new("visudo").arg("-c");
        let checked = ctx.probe_privileged(&check)?;
        if let Err(err) = expect_success("validate sudoers", &check, checked) {
            ctx.sudo(
                "restore sudoers",
                &ShellCommand::new("cp").arg("-p").arg(SUDOERS_BACKUP).arg(SUDOERS),
            )?;
            return Err(err);
        }
        Ok(Applied::Done)
    }
}

/// Creates the deployer account with a password and an `.ssh` directory.
#[derive(Clone)]
pub struct EnsureUser {
    user: String,
    group: String,
    password: String,
}

/// What [`EnsureUser`] still has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingAccount {
    /// The account itself does not exist.
    pub user: bool,
}

impl EnsureUser {
    /// Step creating `user` in `group`.
    #[must_use]
    pub fn new(user: impl Into<String>, group: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
            password: password.into(),
        }
    }

    fn ssh_dir(&self) -> String {
        format!("{}/.ssh", home_dir(&self.user))
    }
}

impl Step for EnsureUser {
    type Pending = MissingAccount;

    fn title(&self) -> String {
        format!("Creating user {}", self.user)
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<MissingAccount>, StepError> {
        let exists = ctx
            .probe(&ShellCommand::new("id").arg("-u").arg(&self.user))?
            .success();
        let has_ssh_dir = exists
            && ctx
                .probe(&ShellCommand::new("test").arg("-d").arg(self.ssh_dir()))?
                .success();
        Ok(if has_ssh_dir {
            Probe::Satisfied
        } else {
            Probe::Pending(MissingAccount { user: !exists })
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, missing: MissingAccount) -> Result<Applied, StepError> {
        if missing.user {
            ctx.sudo(
                "create user",
                &ShellCommand::new("useradd")
                    .arg("-m")
                    .args(["-c", "deployer"])
                    .args(["-s", "/bin/bash"])
                    .arg("-g")
                    .arg(&self.group)
                    .arg(&self.user),
            )?;
            ctx.sudo("set user password", &set_password(&self.user, &self.password))?;
        }

        let ssh_dir = self.ssh_dir();
        ctx.sudo(
            "create .ssh directory",
            &ShellCommand::new("mkdir")
                .arg("-p")
                .arg(&ssh_dir)
                .and(
                    ShellCommand::new("chown")
                        .arg(format!("{}:{}", self.user, self.group))
                        .arg(&ssh_dir),
                )
                .and(ShellCommand::new("chmod").arg("700").arg(&ssh_dir)),
        )?;
        Ok(Applied::Done)
    }
}

/// A `crypt(3)` hash from `/etc/shadow`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowHash {
    /// Scheme identifier (`1`, `5` or `6`).
    pub scheme: String,
    /// Salt.
    pub salt: String,
    /// Full hash field.
    pub encoded: String,
}

/// Extracts the hash of the `getent shadow` line when its scheme can be
/// recomputed with `openssl passwd`.
#[must_use]
pub fn parse_shadow_hash(line: &str) -> Option<ShadowHash> {
    let encoded = line.trim().split(':').nth(1)?;
    let mut parts = encoded.split('$');
    let (Some(""), Some(scheme), Some(salt), Some(digest), None) =
        (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    if !matches!(scheme, "1" | "5" | "6") || salt.is_empty() || digest.is_empty() {
        return None;
    }
    Some(ShadowHash {
        scheme: scheme.to_owned(),
        salt: salt.to_owned(),
        encoded: encoded.to_owned(),
    })
}

/// Sets the root password unless it already matches.
#[derive(Clone)]
pub struct RootPassword {
    password: String,
}

impl RootPassword {
    /// Step setting the root password to `password`.
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl Step for RootPassword {
    type Pending = ();

    fn title(&self) -> String {
        String::from("Setting root password")
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<()>, StepError> {
        let shadow = ctx.sudo(
            "read root shadow entry",
            &ShellCommand::new("getent").arg("shadow").arg("root"),
        )?;
        let Some(hash) = parse_shadow_hash(&shadow.stdout) else {
            debug!("root password hash is locked or uses an unsupported scheme");
            return Ok(Probe::Pending(()));
        };

        let rehash = ShellCommand::new("openssl")
            .arg("passwd")
            .arg(format!("-{}", hash.scheme))
            .arg("-salt")
            .arg(&hash.salt)
            .arg("-stdin");
        let output = ctx.probe_with_input(&rehash, &format!("{}\n", self.password))?;
        let rehashed = expect_success("hash candidate root password", &rehash, output)?;
        Ok(if rehashed.stdout.trim() == hash.encoded {
            Probe::Satisfied
        } else {
            Probe::Pending(())
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, (): ()) -> Result<Applied, StepError> {
        ctx.sudo("set root password", &set_password("root", &self.password))?;
        Ok(Applied::Done)
    }
}

/// Renames the host.
#[derive(Debug, Clone)]
pub struct SetHostname {
    hostname: String,
}

impl SetHostname {
    /// Step naming the host `hostname`.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

/// `/etc/hosts` with the `127.0.1.1` entry pointing at `hostname`.
#[must_use]
pub fn rewrite_hosts(hosts: &str, hostname: &str) -> Vec<String> {
    let entry = format!("127.0.1.1\t{hostname}");
    let mut replaced = false;
    let mut lines: Vec<String> = hosts
        .lines()
        .map(|line| {
            if line.split_whitespace().next() == Some("127.0.1.1") {
                replaced = true;
                entry.clone()
            } else {
                line.to_owned()
            }
        })
        .collect();
    if !replaced {
        lines.push(entry);
    }
    lines
}

fn hosts_names_match(hosts: &str, hostname: &str) -> bool {
    hosts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some("127.0.1.1") && fields.any(|name| name == hostname)
    })
}

/// What [`SetHostname`] found out of date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnameDrift {
    /// `hostnamectl` must be run.
    pub rename: bool,
    /// New `/etc/hosts` content, when it needs rewriting.
    pub hosts: Option<Vec<String>>,
}

impl Step for SetHostname {
    type Pending = HostnameDrift;

    fn title(&self) -> String {
        format!("Setting hostname to {}", self.hostname)
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<HostnameDrift>, StepError> {
        let current = ctx.run("read hostname", &ShellCommand::new("hostname"))?;
        let hosts = ctx.run("read hosts file", &ShellCommand::new("cat").arg(HOSTS))?;
        let drift = HostnameDrift {
            rename: current.stdout.trim() != self.hostname,
            hosts: (!hosts_names_match(&hosts.stdout, &self.hostname))
                .then(|| rewrite_hosts(&hosts.stdout, &self.hostname)),
        };
        Ok(if drift.rename || drift.hosts.is_some() {
            Probe::Pending(drift)
        } else {
            Probe::Satisfied
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, drift: HostnameDrift) -> Result<Applied, StepError> {
        if drift.rename {
            ctx.sudo(
                "set hostname",
                &ShellCommand::new("hostnamectl")
                    .arg("set-hostname")
                    .arg(&self.hostname),
            )?;
        }
        if let Some(lines) = drift.hosts {
            ctx.sudo(
                "rewrite hosts file",
                &ShellCommand::new("printf")
                    .arg("%s\n")
                    .args(&lines)
                    .write_to(HOSTS),
            )?;
        }
        Ok(Applied::Done)
    }
}

/// Removes the factory account's password and login shell.
#[derive(Debug, Clone)]
pub struct DisableLogin {
    user: String,
}

impl DisableLogin {
    /// Step disabling `user`.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

fn passwd_status(output: &str) -> Option<&str> {
    output.split_whitespace().nth(1)
}

impl Step for DisableLogin {
    type Pending = ();

    fn title(&self) -> String {
        format!("Disabling login for {}", self.user)
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<()>, StepError> {
        let entry = ctx.run(
            "read account entry",
            &ShellCommand::new("getent").arg("passwd").arg(&self.user),
        )?;
        let shell = entry.stdout.trim().rsplit(':').next().unwrap_or_default();
        let status = ctx.sudo(
            "read password status",
            &ShellCommand::new("passwd").arg("-S").arg(&self.user),
        )?;
        let locked = matches!(passwd_status(&status.stdout), Some("NP" | "L"));
        Ok(if shell == NOLOGIN && locked {
            Probe::Satisfied
        } else {
            Probe::Pending(())
        })
    }

    fn apply(&self, ctx: &StepContext<'_>, (): ()) -> Result<Applied, StepError> {
        ctx.sudo(
            "remove password",
            &ShellCommand::new("passwd").arg("-d").arg(&self.user),
        )?;
        ctx.sudo(
            "set non-login shell",
            &ShellCommand::new("usermod").arg("-s").arg(NOLOGIN).arg(&self.user),
        )?;
        Ok(Applied::Done)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::session::SshTarget;
    use crate::step::run_step;
    use crate::test_support::{ScriptedHost, ok};

    #[rstest]
    #[case("root:$6$abc$XYZ:19000:0:99999:7:::", Some(("6", "abc")))]
    #[case("root:$1$s$h:19000::::::", Some(("1", "s")))]
    #[case("root:*:19000:0:99999:7:::", None)]
    #[case("root:!:19000:0:99999:7:::", None)]
    #[case("root:$y$j9T$salt$hash:19000::::::", None)]
    #[case("root:$6$rounds=5000$salt$hash:19000::::::", None)]
    fn shadow_hashes_parse_when_recomputable(#[case] line: &str, #[case] expected: Option<(&str, &str)>) {
        let parsed = parse_shadow_hash(line);
        assert_eq!(
            parsed.as_ref().map(|hash| (hash.scheme.as_str(), hash.salt.as_str())),
            expected
        );
    }

    #[test]
    fn hosts_entry_is_replaced_in_place() {
        let lines = rewrite_hosts("127.0.0.1\tlocalhost\n127.0.1.1\traspberrypi\n::1\tlocalhost\n", "pi-lab");
        assert_eq!(lines, vec!["127.0.0.1\tlocalhost", "127.0.1.1\tpi-lab", "::1\tlocalhost"]);
    }

    #[test]
    fn hosts_entry_is_appended_when_missing() {
        let lines = rewrite_hosts("127.0.0.1\tlocalhost\n", "pi-lab");
        assert_eq!(lines, vec!["127.0.0.1\tlocalhost", "127.0.1.1\tpi-lab"]);
    }

    #[rstest]
    #[case("pi NP 01/01/2024 0 99999 7 -1", Some("NP"))]
    #[case("pi P 01/01/2024 0 99999 7 -1", Some("P"))]
    #[case("", None)]
    fn reads_passwd_status(#[case] output: &str, #[case] expected: Option<&str>) {
        assert_eq!(passwd_status(output), expected);
    }

    #[rstest]
    #[case("root ALL=(ALL:ALL) ALL\n", false)]
    #[case("root ALL=(ALL:ALL) ALL", true)]
    #[case("", false)]
    fn sudoers_rule_starts_on_its_own_line(#[case] sudoers: &str, #[case] leading_newline: bool) {
        let host = ScriptedHost::new(SshTarget::new("pi", "10.0.0.12", 22));
        host.on("cat /etc/sudoers", ok(sudoers));

        run_step(&SudoersGrant::new("deploy"), &StepContext::new(&host, None)).expect("grant runs");

        let appended = host
            .commands()
            .into_iter()
            .find(|command| command.contains(">> /etc/sudoers"))
            .expect("rule is appended");
        assert_eq!(appended.contains("\n%s"), leading_newline, "{appended}");
    }
}
