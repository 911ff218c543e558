//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedHost`] stands in for a remote machine. Responses are chosen by
//! matching substrings of the executed script against rules; the most
//! recently added matching rule wins, so fixtures can describe a baseline
//! host and individual tests override single commands. Rules may be gated on
//! an earlier command having run, which lets a test describe how the host
//! changes after a mutation. A plain `cat` of a file written through the
//! transfer subsystem returns the written content.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::MutexGuard as AsyncMutexGuard;

use crate::session::{
    CommandOutput, Connector, Credential, RemoteSession, SessionError, SshTarget,
};
use crate::shell::ShellCommand;

/// Builds a successful output with `stdout`.
#[must_use]
pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_status: Some(0),
        stdout: stdout.to_owned(),
        stderr: String::new(),
    }
}

/// Builds a failed output with `code` and `stderr`.
#[must_use]
pub fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_status: Some(code),
        stdout: String::new(),
        stderr: stderr.to_owned(),
    }
}

#[derive(Clone, Debug)]
struct Rule {
    pattern: String,
    after: Option<String>,
    output: CommandOutput,
    remaining: Option<usize>,
}

/// One command observed by [`ScriptedHost`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    /// Script text as executed.
    pub script: String,
    /// Redacted rendering, as it would appear in logs.
    pub redacted: String,
    /// Bytes written to stdin.
    pub stdin: Option<String>,
}

#[derive(Debug, Default)]
struct HostState {
    rules: Vec<Rule>,
    invocations: Vec<Invocation>,
    executed: Vec<String>,
    files: BTreeMap<String, String>,
    write_failures: BTreeSet<String>,
    close_calls: usize,
    closed: bool,
}

impl HostState {
    fn respond(&mut self, script: &str) -> CommandOutput {
        let uploaded = script
            .strip_prefix("cat ")
            .and_then(|path| self.files.get(path));
        if let Some(content) = uploaded {
            return ok(content);
        }
        let seen = &self.executed;
        let chosen = self.rules.iter().rposition(|rule| {
            script.contains(&rule.pattern)
                && rule.remaining.is_none_or(|left| left > 0)
                && rule
                    .after
                    .as_ref()
                    .is_none_or(|gate| seen.iter().any(|ran| ran.contains(gate.as_str())))
        });
        let Some(index) = chosen else {
            return ok("");
        };
        let Some(rule) = self.rules.get_mut(index) else {
            return ok("");
        };
        if let Some(left) = rule.remaining.as_mut() {
            *left = left.saturating_sub(1);
        }
        rule.output.clone()
    }
}

/// Rule-driven fake remote host implementing [`RemoteSession`].
///
/// Clones share state, so a test can keep a handle while the orchestrator
/// owns the session. Commands with no matching rule succeed with empty output.
#[derive(Clone, Debug)]
pub struct ScriptedHost {
    target: SshTarget,
    peer: Option<IpAddr>,
    state: Arc<Mutex<HostState>>,
}

impl ScriptedHost {
    /// Creates a host reachable as `target`.
    #[must_use]
    pub fn new(target: SshTarget) -> Self {
        let peer = target.host.parse().ok();
        Self {
            target,
            peer,
            state: Arc::new(Mutex::new(HostState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overrides the peer address reported by the session.
    #[must_use]
    pub fn with_peer(mut self, peer: Option<IpAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// Answers every script containing `pattern` with `output`.
    pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.push_rule(pattern, None, output, None);
        self
    }

    /// Answers the next script containing `pattern` with `output`, once.
    pub fn once(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.push_rule(pattern, None, output, Some(1));
        self
    }

    /// Answers scripts containing `pattern` with `output`, but only after a
    /// script containing `after` has run.
    pub fn on_after(&self, after: &str, pattern: &str, output: CommandOutput) -> &Self {
        self.push_rule(pattern, Some(after), output, None);
        self
    }

    fn push_rule(
        &self,
        pattern: &str,
        after: Option<&str>,
        output: CommandOutput,
        remaining: Option<usize>,
    ) {
        self.state().rules.push(Rule {
            pattern: pattern.to_owned(),
            after: after.map(str::to_owned),
            output,
            remaining,
        });
    }

    /// Makes writes to `path` fail.
    pub fn fail_writes_to(&self, path: &str) {
        self.state().write_failures.insert(path.to_owned());
    }

    /// Snapshot of every invocation.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state().invocations.clone()
    }

    /// Redacted command lines in execution order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state()
            .invocations
            .iter()
            .map(|inv| inv.redacted.clone())
            .collect()
    }

    /// Index of the first invocation whose script contains `pattern`.
    #[must_use]
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.state()
            .invocations
            .iter()
            .position(|inv| inv.script.contains(pattern))
    }

    /// Number of invocations whose script contains `pattern`.
    #[must_use]
    pub fn count(&self, pattern: &str) -> usize {
        self.state()
            .invocations
            .iter()
            .filter(|inv| inv.script.contains(pattern))
            .count()
    }

    /// Files written through the transfer subsystem.
    #[must_use]
    pub fn written_files(&self) -> BTreeMap<String, String> {
        self.state().files.clone()
    }

    /// Number of `close` calls observed.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    /// Forgets recorded invocations, keeping rules and written files.
    ///
    /// Gates opened by earlier commands stay open, so the host keeps the
    /// state its mutations produced.
    pub fn clear_history(&self) {
        self.state().invocations.clear();
    }

    /// Reopens a closed session so the same host can serve another run.
    pub fn reopen(&self) {
        self.state().closed = false;
    }
}

impl RemoteSession for ScriptedHost {
    fn target(&self) -> &SshTarget {
        &self.target
    }

    fn peer_address(&self) -> Option<IpAddr> {
        self.peer
    }

    fn exec(
        &self,
        command: &ShellCommand,
        stdin: Option<&str>,
    ) -> Result<CommandOutput, SessionError> {
        let mut state = self.state();
        if state.closed {
            return Err(SessionError::Closed);
        }
        let script = command.script();
        let output = state.respond(&script);
        state.executed.push(script.clone());
        state.invocations.push(Invocation {
            script,
            redacted: command.redacted(),
            stdin: stdin.map(str::to_owned),
        });
        Ok(output)
    }

    fn write_file(&self, remote_path: &str, content: &str) -> Result<(), SessionError> {
        let mut state = self.state();
        if state.closed {
            return Err(SessionError::Closed);
        }
        if state.write_failures.contains(remote_path) {
            return Err(SessionError::Transfer {
                path: remote_path.to_owned(),
                message: String::from("simulated transfer failure"),
            });
        }
        state
            .files
            .insert(remote_path.to_owned(), content.to_owned());
        Ok(())
    }

    fn close(&mut self) -> Result<(), SessionError> {
        let mut state = self.state();
        state.close_calls += 1;
        state.closed = true;
        Ok(())
    }
}

type FailureFn = dyn Fn(&SshTarget, &Credential) -> Option<SessionError> + Send + Sync;

/// Connector handing out clones of one [`ScriptedHost`].
#[derive(Clone)]
pub struct ScriptedConnector {
    host: ScriptedHost,
    failure: Option<Arc<FailureFn>>,
    attempts: Arc<Mutex<Vec<(SshTarget, bool)>>>,
}

impl ScriptedConnector {
    /// Always connects to `host`.
    #[must_use]
    pub fn new(host: ScriptedHost) -> Self {
        Self {
            host,
            failure: None,
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails connections for which `failure` returns an error.
    #[must_use]
    pub fn failing_with<F>(mut self, failure: F) -> Self
    where
        F: Fn(&SshTarget, &Credential) -> Option<SessionError> + Send + Sync + 'static,
    {
        self.failure = Some(Arc::new(failure));
        self
    }

    /// Targets dialled so far, paired with whether a password was used.
    #[must_use]
    pub fn attempts(&self) -> Vec<(SshTarget, bool)> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        target: &SshTarget,
        credential: &Credential,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target.clone(), credential.password().is_some()));
        if let Some(err) = self.failure.as_ref().and_then(|fail| fail(target, credential)) {
            return Err(err);
        }
        self.host.reopen();
        let mut session = self.host.clone();
        session.target = target.clone();
        Ok(Box::new(session))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
