//! Reviewed construction of remote POSIX shell commands.
//!
//! Every value interpolated into a remote command passes through
//! [`ShellCommand`]. Arguments are quoted with `shell-escape`; secrets are
//! quoted the same way but masked in the display form, which is the only form
//! that reaches logs and error messages. Unquoted fragments are restricted to
//! `&'static str` so runtime data can never be spliced in verbatim.

use std::fmt;

use shell_escape::unix::escape;
use thiserror::Error;

const REDACTED: &str = "'***'";

#[derive(Clone, Debug, PartialEq, Eq)]
enum Part {
    Literal(&'static str),
    Arg(String),
    Secret(String),
    Script(Box<ShellCommand>),
}

/// A remote shell command assembled from quoted parts.
///
/// `Display` renders the redacted form; [`ShellCommand::script`] renders the
/// text actually executed by the remote shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    parts: Vec<Part>,
}

impl ShellCommand {
    /// Starts a command with a trusted program name.
    #[must_use]
    pub fn new(program: &'static str) -> Self {
        Self {
            parts: vec![Part::Literal(program)],
        }
    }

    /// Appends a quoted argument.
    #[must_use]
    pub fn arg(mut self, value: impl AsRef<str>) -> Self {
        self.parts.push(Part::Arg(value.as_ref().to_owned()));
        self
    }

    /// Appends several quoted arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.parts.extend(
            values
                .into_iter()
                .map(|value| Part::Arg(value.as_ref().to_owned())),
        );
        self
    }

    /// Appends a quoted argument that is masked in the display form.
    #[must_use]
    pub fn secret(mut self, value: impl AsRef<str>) -> Self {
        self.parts.push(Part::Secret(value.as_ref().to_owned()));
        self
    }

    /// Appends a trusted fragment verbatim, such as a redirection operator.
    #[must_use]
    pub fn raw(mut self, fragment: &'static str) -> Self {
        self.parts.push(Part::Literal(fragment));
        self
    }

    /// Appends another command as a single quoted argument, for
    /// `bash -c <script>` style wrapping. Secrets inside stay masked.
    #[must_use]
    pub fn nested(mut self, inner: Self) -> Self {
        self.parts.push(Part::Script(Box::new(inner)));
        self
    }

    /// Joins `next` with a pipe.
    #[must_use]
    pub fn pipe(self, next: Self) -> Self {
        self.join("|", next)
    }

    /// Joins `next` so it only runs when this command succeeds.
    #[must_use]
    pub fn and(self, next: Self) -> Self {
        self.join("&&", next)
    }

    /// Redirects stdout to `path`, truncating it.
    #[must_use]
    pub fn write_to(self, path: impl AsRef<str>) -> Self {
        self.raw(">").arg(path)
    }

    /// Redirects stdout to `path`, appending to it.
    #[must_use]
    pub fn append_to(self, path: impl AsRef<str>) -> Self {
        self.raw(">>").arg(path)
    }

    /// Discards stdout and stderr.
    #[must_use]
    pub fn quiet(self) -> Self {
        self.raw(">/dev/null").raw("2>&1")
    }

    fn join(mut self, operator: &'static str, next: Self) -> Self {
        self.parts.push(Part::Literal(operator));
        self.parts.extend(next.parts);
        self
    }

    /// Renders the command text executed by the remote shell.
    #[must_use]
    pub fn script(&self) -> String {
        self.render(false)
    }

    /// Renders the command with secrets masked.
    #[must_use]
    pub fn redacted(&self) -> String {
        self.render(true)
    }

    /// Returns `true` when any part of the command is a secret.
    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.parts.iter().any(|part| match part {
            Part::Secret(_) => true,
            Part::Script(inner) => inner.has_secret(),
            Part::Literal(_) | Part::Arg(_) => false,
        })
    }

    fn render(&self, redact: bool) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if !out.is_empty() {
                out.push(' ');
            }
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Arg(value) => out.push_str(&quote(value)),
                Part::Secret(value) => {
                    if redact {
                        out.push_str(REDACTED);
                    } else {
                        out.push_str(&quote(value));
                    }
                }
                Part::Script(inner) => out.push_str(&quote(&inner.render(redact))),
            }
        }
        out
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Quotes a single value for a POSIX shell.
///
/// Empty strings become `''` so they survive word splitting.
#[must_use]
pub fn quote(value: &str) -> String {
    if value.is_empty() {
        return String::from("''");
    }
    escape(value.into()).into_owned()
}

/// Wraps `command` so it runs as root through `sudo`.
///
/// With `reads_password` the password is expected as the first line of
/// stdin (`sudo -S`, empty prompt); otherwise sudo must not prompt.
#[must_use]
pub fn privileged(command: &ShellCommand, reads_password: bool) -> ShellCommand {
    let sudo = if reads_password {
        ShellCommand::new("sudo").raw("-S").raw("-p").raw("''")
    } else {
        ShellCommand::new("sudo").raw("-n")
    };
    sudo.raw("bash").raw("-c").nested(command.clone())
}

/// Rejected identifier supplied for interpolation into a remote command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind} {value:?}: {reason}")]
pub struct IdentifierError {
    /// What the value was meant to name (user, group, hostname, ...).
    pub kind: &'static str,
    /// Offending value.
    pub value: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl IdentifierError {
    fn new(kind: &'static str, value: &str, reason: &'static str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
            reason,
        }
    }
}

/// Validates a POSIX user or group name (`[a-z_][a-z0-9_-]*`, 32 chars max).
///
/// # Errors
///
/// Returns [`IdentifierError`] when the name would not be accepted by
/// `useradd`/`groupadd`.
pub fn validate_account_name(kind: &'static str, value: &str) -> Result<(), IdentifierError> {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return Err(IdentifierError::new(kind, value, "must not be empty"));
    };
    if value.len() > 32 {
        return Err(IdentifierError::new(kind, value, "must be at most 32 characters"));
    }
    if !(first.is_ascii_lowercase() || first == '_') {
        return Err(IdentifierError::new(
            kind,
            value,
            "must start with a lowercase letter or underscore",
        ));
    }
    if !chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '_' | '-')) {
        return Err(IdentifierError::new(
            kind,
            value,
            "may only contain lowercase letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// Validates an RFC 1123 hostname label sequence.
///
/// # Errors
///
/// Returns [`IdentifierError`] for empty, overlong, or malformed labels.
pub fn validate_hostname(value: &str) -> Result<(), IdentifierError> {
    const KIND: &str = "hostname";
    if value.is_empty() || value.len() > 253 {
        return Err(IdentifierError::new(KIND, value, "must be 1-253 characters"));
    }
    for label in value.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(IdentifierError::new(
                KIND,
                value,
                "labels must be 1-63 characters",
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(IdentifierError::new(
                KIND,
                value,
                "labels must not start or end with '-'",
            ));
        }
        if !label.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-') {
            return Err(IdentifierError::new(
                KIND,
                value,
                "labels may only contain letters, digits and '-'",
            ));
        }
    }
    Ok(())
}
