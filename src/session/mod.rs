//! Remote session abstraction over one authenticated SSH connection.
//!
//! A session executes one command per channel, captures both output streams
//! in full, and never interprets the exit status itself. Callers decide what
//! a non-zero status means.

use std::fmt;
use std::io;
use std::net::IpAddr;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::debug;

use crate::shell::{self, ShellCommand};

mod ssh;

pub use ssh::{SshConnector, SshSession};

/// Identity of the remote endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    /// Login user.
    pub user: String,
    /// Hostname or IP address.
    pub host: String,
    /// TCP port of the SSH daemon.
    pub port: u16,
}

impl SshTarget {
    /// Builds a target from its parts.
    #[must_use]
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// Returns the same endpoint with a different login user.
    #[must_use]
    pub fn with_user(&self, user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Authentication material for a session.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Password authentication.
    Password(String),
    /// Public key authentication from a private key file.
    Key {
        /// Path to the private key.
        path: Utf8PathBuf,
        /// Optional passphrase protecting the key.
        passphrase: Option<String>,
    },
}

impl Credential {
    /// Returns the password when this is password authentication.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        match self {
            Self::Password(password) => Some(password),
            Self::Key { .. } => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::Key { path, passphrase } => f
                .debug_struct("Key")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

/// Captured result of one remote command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status reported by the remote side, if any.
    pub exit_status: Option<i32>,
    /// Full standard output.
    pub stdout: String,
    /// Full standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_status, Some(0))
    }
}

/// Errors raised by the session transport.
///
/// These are connection-level failures. A command that runs and exits
/// non-zero is not a [`SessionError`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Raised when the host name cannot be resolved.
    #[error("could not resolve {address}")]
    Resolve {
        /// Address that failed to resolve.
        address: String,
    },
    /// Raised when the TCP connection cannot be established.
    #[error("could not reach {address}: {source}")]
    Unreachable {
        /// Address that was dialled.
        address: String,
        /// Socket error.
        #[source]
        source: io::Error,
    },
    /// Raised when the SSH protocol handshake fails.
    #[error("ssh handshake with {address} failed: {message}")]
    Handshake {
        /// Address of the peer.
        address: String,
        /// Transport error text.
        message: String,
    },
    /// Raised when the server offers no method the credential can use.
    ///
    /// For password logins this usually means password authentication has
    /// already been disabled on the host.
    #[error("no supported authentication methods remain for {user} (server offers: {offered})")]
    AuthMethodUnsupported {
        /// User that attempted to authenticate.
        user: String,
        /// Methods advertised by the server.
        offered: String,
    },
    /// Raised when the server rejects the credential.
    #[error("authentication rejected for {user}: {message}")]
    AuthRejected {
        /// User that attempted to authenticate.
        user: String,
        /// Transport error text.
        message: String,
    },
    /// Raised when the private key file is missing.
    #[error("private key {path} does not exist")]
    MissingKey {
        /// Path that was checked.
        path: Utf8PathBuf,
    },
    /// Raised when a channel cannot be opened or driven.
    #[error("ssh channel failed: {message}")]
    Channel {
        /// Transport error text.
        message: String,
    },
    /// Raised when a file transfer fails.
    #[error("failed to write remote file {path}: {message}")]
    Transfer {
        /// Remote path being written.
        path: String,
        /// Transport error text.
        message: String,
    },
    /// Raised when a command is issued after the session was closed.
    #[error("session already closed")]
    Closed,
}

impl SessionError {
    /// Returns `true` when the error means the credential type is no longer
    /// accepted by the host.
    #[must_use]
    pub const fn is_auth_method_unsupported(&self) -> bool {
        matches!(self, Self::AuthMethodUnsupported { .. })
    }
}

/// One authenticated connection to a remote host.
pub trait RemoteSession: Send {
    /// Endpoint this session is connected to.
    fn target(&self) -> &SshTarget;

    /// IP address of the peer carrying this session, when known.
    fn peer_address(&self) -> Option<IpAddr>;

    /// Executes `command` in a fresh channel, optionally feeding `stdin`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] for transport failures or after
    /// [`RemoteSession::close`].
    fn exec(&self, command: &ShellCommand, stdin: Option<&str>)
    -> Result<CommandOutput, SessionError>;

    /// Writes `content` to `remote_path` over the file-transfer subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transfer`] when the write fails.
    fn write_file(&self, remote_path: &str, content: &str) -> Result<(), SessionError>;

    /// Releases the transport. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the disconnect itself fails.
    fn close(&mut self) -> Result<(), SessionError>;

    /// Executes `command` without elevated privilege.
    ///
    /// # Errors
    ///
    /// Propagates [`RemoteSession::exec`] failures.
    fn run(&self, command: &ShellCommand) -> Result<CommandOutput, SessionError> {
        debug!(target_host = %self.target(), command = %command, "running command");
        self.exec(command, None)
    }

    /// Executes `command` as root through sudo.
    ///
    /// When `password` is given it is written to stdin ahead of `input`, so
    /// it never appears in the command line or in logs.
    ///
    /// # Errors
    ///
    /// Propagates [`RemoteSession::exec`] failures.
    fn run_privileged(
        &self,
        command: &ShellCommand,
        password: Option<&str>,
        input: Option<&str>,
    ) -> Result<CommandOutput, SessionError> {
        let wrapped = shell::privileged(command, password.is_some());
        debug!(target_host = %self.target(), command = %wrapped, "running privileged command");
        match password {
            Some(secret) => {
                let mut stdin = format!("{secret}\n");
                if let Some(extra) = input {
                    stdin.push_str(extra);
                }
                self.exec(&wrapped, Some(&stdin))
            }
            None => self.exec(&wrapped, input),
        }
    }
}

/// Opens sessions. Shared across threads by the discovery fan-out.
pub trait Connector: Send + Sync {
    /// Connects and authenticates against `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the host is unreachable or rejects the
    /// credential.
    fn connect(
        &self,
        target: &SshTarget,
        credential: &Credential,
    ) -> Result<Box<dyn RemoteSession>, SessionError>;
}
