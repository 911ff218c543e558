//! sshd hardening: disable PAM, root login, and password authentication.
//!
//! The hardened file is rendered locally from the live config, uploaded to a
//! staging path, and installed as root. The live config is backed up first and restored when
//! `sshd -t` rejects the result or a re-read is still not hardened.

use crate::shell::ShellCommand;
use crate::step::{Applied, Probe, Step, StepContext, StepError, expect_success};

/// Live sshd configuration.
pub const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";
/// Copy taken before editing.
pub const SSHD_BACKUP: &str = "/etc/ssh/sshd_config.backup";
/// Upload location of the rendered config before it is installed as root.
pub const SSHD_STAGING: &str = "/tmp/sshd_config.rpi-provisioner";

const DIRECTIVES: [&str; 3] = ["UsePAM", "PermitRootLogin", "PasswordAuthentication"];

/// Edit needed to force one directive to `no`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveEdit {
    /// Rewrite every active or commented occurrence in place.
    Substitute(&'static str),
    /// The directive never appears; add it to the global section.
    Append(&'static str),
}

struct Directive<'a> {
    commented: bool,
    keyword: &'a str,
    value: Option<&'a str>,
}

fn parse_line(line: &str) -> Option<Directive<'_>> {
    let trimmed = line.trim_start();
    let (commented, body) = match trimmed.strip_prefix('#') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };
    let mut tokens = body.split_whitespace();
    let keyword = tokens.next()?;
    Some(Directive {
        commented,
        keyword,
        value: tokens.next(),
    })
}

fn occurrences<'a>(config: &'a str, directive: &str) -> Vec<Directive<'a>> {
    config
        .lines()
        .filter_map(parse_line)
        .filter(|parsed| {
            parsed.value.is_some() && parsed.keyword.eq_ignore_ascii_case(directive)
        })
        .collect()
}

/// Edits that bring `config` to the hardened state; empty when already
/// hardened.
#[must_use]
pub fn plan_edits(config: &str) -> Vec<DirectiveEdit> {
    DIRECTIVES
        .into_iter()
        .filter_map(|directive| {
            let found = occurrences(config, directive);
            let mut active = found.iter().filter(|occ| !occ.commented).peekable();
            let has_active = active.peek().is_some();
            let all_no =
                active.all(|occ| occ.value.is_some_and(|value| value.eq_ignore_ascii_case("no")));
            if has_active && all_no {
                return None;
            }
            if found.is_empty() {
                Some(DirectiveEdit::Append(directive))
            } else {
                Some(DirectiveEdit::Substitute(directive))
            }
        })
        .collect()
}

/// Renders `config` with `edits` applied.
///
/// Substituted lines match the directive case-insensitively, commented or
/// indented. Appended directives land before the first `Match` block so they
/// stay global.
#[must_use]
pub fn apply_edits(config: &str, edits: &[DirectiveEdit]) -> String {
    let substituted = |keyword: &str| {
        edits.iter().find_map(|edit| match edit {
            DirectiveEdit::Substitute(directive) if directive.eq_ignore_ascii_case(keyword) => {
                Some(*directive)
            }
            DirectiveEdit::Substitute(_) | DirectiveEdit::Append(_) => None,
        })
    };
    let appended: Vec<String> = edits
        .iter()
        .filter_map(|edit| match edit {
            DirectiveEdit::Append(directive) => Some(format!("{directive} no")),
            DirectiveEdit::Substitute(_) => None,
        })
        .collect();

    let mut lines: Vec<String> = Vec::new();
    let mut pending_appends = Some(appended);
    for line in config.lines() {
        let parsed = parse_line(line);
        let opens_match = parsed.as_ref().is_some_and(|directive| {
            !directive.commented && directive.keyword.eq_ignore_ascii_case("Match")
        });
        if opens_match && let Some(extra) = pending_appends.take() {
            lines.extend(extra);
        }
        let replacement = parsed
            .filter(|directive| directive.value.is_some())
            .and_then(|directive| substituted(directive.keyword));
        lines.push(replacement.map_or_else(
            || line.to_owned(),
            |directive| format!("{directive} no"),
        ));
    }
    if let Some(extra) = pending_appends {
        lines.extend(extra);
    }

    let mut rendered = lines.join("\n");
    if !rendered.is_empty() {
        rendered.push('\n');
    }
    rendered
}

fn read_config(ctx: &StepContext<'_>) -> Result<String, StepError> {
    let output = ctx.sudo(
        "read sshd configuration",
        &ShellCommand::new("cat").arg(SSHD_CONFIG),
    )?;
    Ok(output.stdout)
}

fn restore(ctx: &StepContext<'_>) -> Result<(), StepError> {
    ctx.sudo(
        "restore sshd configuration",
        &ShellCommand::new("cp").arg("-p").arg(SSHD_BACKUP).arg(SSHD_CONFIG),
    )?;
    Ok(())
}

/// Disables PAM, root login, and password logins, then reloads sshd.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshdHardening;

impl Step for SshdHardening {
    type Pending = (String, Vec<DirectiveEdit>);

    fn title(&self) -> String {
        String::from("Hardening sshd configuration")
    }

    fn probe(
        &self,
        ctx: &StepContext<'_>,
    ) -> Result<Probe<(String, Vec<DirectiveEdit>)>, StepError> {
        let config = read_config(ctx)?;
        let edits = plan_edits(&config);
        if edits.is_empty() {
            Ok(Probe::Satisfied)
        } else {
            Ok(Probe::Pending((config, edits)))
        }
    }

    fn apply(
        &self,
        ctx: &StepContext<'_>,
        (config, edits): (String, Vec<DirectiveEdit>),
    ) -> Result<Applied, StepError> {
        ctx.sudo(
            "back up sshd configuration",
            &ShellCommand::new("cp").arg("-p").arg(SSHD_CONFIG).arg(SSHD_BACKUP),
        )?;
        ctx.write_file(SSHD_STAGING, &apply_edits(&config, &edits))?;
        ctx.sudo(
            "install sshd configuration",
            &ShellCommand::new("install")
                .args(["-o", "root", "-g", "root", "-m", "644"])
                .arg(SSHD_STAGING)
                .arg(SSHD_CONFIG)
                .and(ShellCommand::new("rm").arg("-f").arg(SSHD_STAGING)),
        )?;

        let check = ShellCommand::new("sshd").arg("-t");
        let checked = ctx.probe_privileged(&check)?;
        if let Err(err) = expect_success("validate sshd configuration", &check, checked) {
            restore(ctx)?;
            return Err(err);
        }

        let remaining = plan_edits(&read_config(ctx)?);
        if !remaining.is_empty() {
            restore(ctx)?;
            return Err(StepError::Precondition(format!(
                "sshd configuration still not hardened after editing: {remaining:?}"
            )));
        }

        ctx.sudo(
            "reload sshd",
            &ShellCommand::new("systemctl").arg("reload").arg("ssh"),
        )?;
        Ok(Applied::Done)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::session::SshTarget;
    use crate::step::{StepOutcome, run_step};
    use crate::test_support::{ScriptedHost, fail, ok};

    const HARDENED: &str = "PermitRootLogin no\nPasswordAuthentication no\nUsePAM no\n";

    #[rstest]
    #[case(HARDENED, vec![])]
    #[case(
        "#PermitRootLogin prohibit-password\nPasswordAuthentication no\nUsePAM yes\n",
        vec![DirectiveEdit::Substitute("UsePAM"), DirectiveEdit::Substitute("PermitRootLogin")]
    )]
    #[case(
        "UsePAM no\nPermitRootLogin no\n",
        vec![DirectiveEdit::Append("PasswordAuthentication")]
    )]
    #[case(
        "UsePAM no\nPermitRootLogin no\nPasswordAuthentication no\nPasswordAuthentication yes\n",
        vec![DirectiveEdit::Substitute("PasswordAuthentication")]
    )]
    #[case(
        "usepam NO\npermitrootlogin no\n#PasswordAuthentication no\n",
        vec![DirectiveEdit::Substitute("PasswordAuthentication")]
    )]
    fn plans_only_missing_edits(#[case] config: &str, #[case] expected: Vec<DirectiveEdit>) {
        assert_eq!(plan_edits(config), expected);
    }

    #[rstest]
    #[case(
        "UsePAM no\nPermitRootLogin no\npasswordauthentication yes\n",
        "UsePAM no\nPermitRootLogin no\nPasswordAuthentication no\n"
    )]
    #[case(
        "UsePAM no\nPermitRootLogin no\n  #PasswordAuthentication yes\n",
        "UsePAM no\nPermitRootLogin no\nPasswordAuthentication no\n"
    )]
    #[case(
        "UsePAM no\n\tPermitRootLogin\tyes\nPasswordAuthentication no\n",
        "UsePAM no\nPermitRootLogin no\nPasswordAuthentication no\n"
    )]
    #[case(
        "Include /etc/ssh/sshd_config.d/*.conf\nMatch User backup\n    PasswordAuthentication yes\n",
        "Include /etc/ssh/sshd_config.d/*.conf\nUsePAM no\nPermitRootLogin no\nMatch User backup\nPasswordAuthentication no\n"
    )]
    #[case("", "UsePAM no\nPermitRootLogin no\nPasswordAuthentication no\n")]
    fn rendered_config_is_hardened(#[case] config: &str, #[case] expected: &str) {
        let rendered = apply_edits(config, &plan_edits(config));

        assert_eq!(rendered, expected);
        assert!(plan_edits(&rendered).is_empty());
    }

    #[test]
    fn untouched_lines_are_preserved() {
        let config = "# Managed by cloud-init\nPort 22\nUsePAM yes\n\nX11Forwarding yes\n";

        let rendered = apply_edits(config, &plan_edits(config));

        assert_eq!(
            rendered,
            "# Managed by cloud-init\nPort 22\nUsePAM no\n\nX11Forwarding yes\nPermitRootLogin no\nPasswordAuthentication no\n"
        );
    }

    fn host_with(config: &str) -> ScriptedHost {
        let host = ScriptedHost::new(SshTarget::new("pi", "10.0.0.12", 22));
        host.on("cat /etc/ssh/sshd_config", ok(config));
        host.on_after("sshd_config.rpi-provisioner", "cat /etc/ssh/sshd_config", ok(HARDENED));
        host
    }

    #[test]
    fn hardened_config_is_unchanged_without_backup() {
        let host = host_with(HARDENED);

        let outcome = run_step(&SshdHardening, &StepContext::new(&host, Some("raspberry")))
            .expect("step runs");

        assert_eq!(outcome, StepOutcome::Unchanged);
        assert_eq!(host.count(SSHD_BACKUP), 0);
        assert_eq!(host.count("install -o root"), 0);
        assert!(host.written_files().is_empty());
    }

    #[test]
    fn backup_precedes_write_and_reload_follows_check() {
        let host = host_with("#PermitRootLogin prohibit-password\nUsePAM yes\n");

        let outcome = run_step(&SshdHardening, &StepContext::new(&host, Some("raspberry")))
            .expect("step runs");

        assert_eq!(outcome, StepOutcome::Changed);
        let backup = host.position("cp -p /etc/ssh/sshd_config /etc/ssh/sshd_config.backup");
        let install = host.position("install -o root -g root -m 644");
        let check = host.position("sshd -t");
        let reload = host.position("systemctl reload ssh");
        assert!(backup.is_some());
        assert!(backup < install);
        assert!(install < check);
        assert!(check < reload);

        let written = host.written_files();
        assert_eq!(
            written.get(SSHD_STAGING).map(String::as_str),
            Some("PermitRootLogin no\nUsePAM no\nPasswordAuthentication no\n")
        );
    }

    #[test]
    fn rejected_config_is_restored() {
        let host = host_with("UsePAM yes\n");
        host.on("sshd -t", fail(255, "Bad configuration option"));

        let err = run_step(&SshdHardening, &StepContext::new(&host, None)).expect_err("check fails");

        assert!(err.to_string().contains("validate sshd configuration"));
        assert_eq!(
            host.count("cp -p /etc/ssh/sshd_config.backup /etc/ssh/sshd_config"),
            1
        );
        assert_eq!(host.count("systemctl reload"), 0);
    }

    #[test]
    fn config_still_permissive_after_write_is_restored() {
        let host = ScriptedHost::new(SshTarget::new("pi", "10.0.0.12", 22));
        host.on("cat /etc/ssh/sshd_config", ok("PasswordAuthentication yes\n"));

        let err = run_step(&SshdHardening, &StepContext::new(&host, None))
            .expect_err("unchanged file is rejected");

        assert!(err.to_string().contains("still not hardened"));
        assert_eq!(
            host.count("cp -p /etc/ssh/sshd_config.backup /etc/ssh/sshd_config"),
            1
        );
        assert_eq!(host.count("systemctl reload"), 0);
    }
}
