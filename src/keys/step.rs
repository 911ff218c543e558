//! Converges a user's `authorized_keys` file onto the fetched key set.

use super::{KeySource, MergePolicy, desired_lines, normalise_lines};
use crate::shell::ShellCommand;
use crate::step::{Applied, Probe, Step, StepContext, StepError, home_dir};

/// Installs keys from a [`KeySource`] for one account.
pub struct AuthorizedKeysStep<'k> {
    user: String,
    group: String,
    uri: String,
    source: &'k dyn KeySource,
    policy: MergePolicy,
}

impl<'k> AuthorizedKeysStep<'k> {
    /// Keys at `uri` for `user`, with files owned by `user:group`.
    #[must_use]
    pub fn new(
        user: impl Into<String>,
        group: impl Into<String>,
        uri: impl Into<String>,
        source: &'k dyn KeySource,
        policy: MergePolicy,
    ) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
            uri: uri.into(),
            source,
            policy,
        }
    }

    fn ssh_dir(&self) -> String {
        format!("{}/.ssh", home_dir(&self.user))
    }

    fn keys_file(&self) -> String {
        format!("{}/authorized_keys", self.ssh_dir())
    }
}

impl Step for AuthorizedKeysStep<'_> {
    type Pending = Vec<String>;

    fn title(&self) -> String {
        format!("Uploading authorized keys for {}", self.user)
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<Probe<Vec<String>>, StepError> {
        let keys = self.source.fetch(&self.uri)?;
        let output = ctx.probe_privileged(&ShellCommand::new("cat").arg(self.keys_file()))?;
        let existing = if output.success() {
            output.stdout
        } else {
            String::new()
        };

        let desired = desired_lines(&existing, &keys, self.policy);
        if normalise_lines(existing.lines()) == desired {
            return Ok(Probe::Satisfied);
        }
        Ok(Probe::Pending(desired))
    }

    fn apply(&self, ctx: &StepContext<'_>, lines: Vec<String>) -> Result<Applied, StepError> {
        let ssh_dir = self.ssh_dir();
        let keys_file = self.keys_file();
        let owner = format!("{}:{}", self.user, self.group);

        let command = ShellCommand::new("mkdir")
            .arg("-p")
            .arg(&ssh_dir)
            .and(
                ShellCommand::new("printf")
                    .arg("%s\n")
                    .args(&lines)
                    .write_to(&keys_file),
            )
            .and(ShellCommand::new("chmod").arg("700").arg(&ssh_dir))
            .and(ShellCommand::new("chmod").arg("600").arg(&keys_file))
            .and(ShellCommand::new("chown").arg("-R").arg(owner).arg(&ssh_dir));
        ctx.sudo("write authorized keys", &command)?;
        Ok(Applied::Done)
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::keys::{AuthorizedKey, StaticKeys};
    use crate::session::SshTarget;
    use crate::step::{StepOutcome, run_step};
    use crate::test_support::{ScriptedHost, fail, ok};

    #[fixture]
    fn keys() -> StaticKeys {
        StaticKeys(vec![
            AuthorizedKey {
                key_type: String::from("ssh-rsa"),
                material: String::from("BBB"),
                alias: String::from("desk"),
            },
            AuthorizedKey {
                key_type: String::from("ssh-ed25519"),
                material: String::from("AAA"),
                alias: String::from("laptop"),
            },
        ])
    }

    #[fixture]
    fn host() -> ScriptedHost {
        ScriptedHost::new(SshTarget::new("pi", "10.0.0.12", 22))
    }

    #[rstest]
    fn matching_content_in_any_order_is_unchanged(keys: StaticKeys, host: ScriptedHost) {
        host.on(
            "cat /home/deployer/.ssh/authorized_keys",
            ok("ssh-rsa BBB desk\nssh-ed25519 AAA laptop\n\n"),
        );
        let step = AuthorizedKeysStep::new("deployer", "deployer", "keys.json", &keys, MergePolicy::Replace);

        let outcome = run_step(&step, &StepContext::new(&host, None)).expect("step runs");

        assert_eq!(outcome, StepOutcome::Unchanged);
        assert_eq!(host.count("printf"), 0);
    }

    #[rstest]
    fn missing_file_is_written_sorted(keys: StaticKeys, host: ScriptedHost) {
        host.on("cat /home/deployer/.ssh/authorized_keys", fail(1, "No such file"));
        let step = AuthorizedKeysStep::new("deployer", "deploy", "keys.json", &keys, MergePolicy::Replace);

        let outcome = run_step(&step, &StepContext::new(&host, None)).expect("step runs");

        assert_eq!(outcome, StepOutcome::Changed);
        let commands = host.commands();
        let write = commands
            .iter()
            .find(|cmd| cmd.contains("printf"))
            .expect("write should run");
        let ed = write.find("ssh-ed25519 AAA laptop").expect("ed25519 line");
        let rsa = write.find("ssh-rsa BBB desk").expect("rsa line");
        assert!(ed < rsa, "lines should be sorted: {write}");
        assert!(write.contains("chown -R"));
        assert!(write.contains("deployer:deploy"));
        assert!(write.contains("chmod 600 /home/deployer/.ssh/authorized_keys"));
    }

    #[rstest]
    fn stale_keys_trigger_replacement(keys: StaticKeys, host: ScriptedHost) {
        host.on(
            "cat /home/deployer/.ssh/authorized_keys",
            ok("ssh-rsa BBB desk\nssh-ed25519 AAA laptop\nssh-rsa OLD gone\n"),
        );
        let replace = AuthorizedKeysStep::new("deployer", "deployer", "k", &keys, MergePolicy::Replace);
        let union = AuthorizedKeysStep::new("deployer", "deployer", "k", &keys, MergePolicy::Union);
        let ctx = StepContext::new(&host, None);

        assert_eq!(run_step(&union, &ctx).expect("union runs"), StepOutcome::Unchanged);
        assert_eq!(run_step(&replace, &ctx).expect("replace runs"), StepOutcome::Changed);
    }

    #[rstest]
    fn fetch_failures_are_hard_errors(host: ScriptedHost) {
        let empty = StaticKeys::default();
        let step = AuthorizedKeysStep::new("deployer", "deployer", "k", &empty, MergePolicy::Replace);

        let err = run_step(&step, &StepContext::new(&host, None)).expect_err("no keys");

        assert!(matches!(err, StepError::Keys(_)));
        assert!(host.invocations().is_empty());
    }
}
