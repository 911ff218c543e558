//! `ssh2` implementation of [`RemoteSession`].

use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use ssh2::Session;
use tracing::debug;

use super::{CommandOutput, Connector, Credential, RemoteSession, SessionError, SshTarget};
use crate::shell::ShellCommand;

/// Authenticated libssh2 session.
pub struct SshSession {
    session: Session,
    target: SshTarget,
    peer: Option<IpAddr>,
    closed: bool,
}

impl SshSession {
    /// Dials `target` and authenticates with `credential`.
    ///
    /// `io_timeout` bounds every blocking libssh2 call when set; layer runs
    /// leave it unset so long package installs are not interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when resolution, dialling, the handshake, or
    /// authentication fails. A password credential against a server that no
    /// longer offers `password` yields [`SessionError::AuthMethodUnsupported`].
    pub fn connect(
        target: &SshTarget,
        credential: &Credential,
        connect_timeout: Duration,
        io_timeout: Option<Duration>,
    ) -> Result<Self, SessionError> {
        let address = format!("{}:{}", target.host, target.port);
        let socket = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|_| SessionError::Resolve {
                address: address.clone(),
            })?
            .next()
            .ok_or_else(|| SessionError::Resolve {
                address: address.clone(),
            })?;

        let stream = TcpStream::connect_timeout(&socket, connect_timeout).map_err(|source| {
            SessionError::Unreachable {
                address: address.clone(),
                source,
            }
        })?;
        let peer = stream.peer_addr().ok().map(|addr| addr.ip());

        let mut session = Session::new().map_err(|err| SessionError::Handshake {
            address: address.clone(),
            message: err.to_string(),
        })?;
        if let Some(timeout) = io_timeout {
            session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        }
        session.set_tcp_stream(stream);
        session.handshake().map_err(|err| SessionError::Handshake {
            address: address.clone(),
            message: err.to_string(),
        })?;

        authenticate(&session, &target.user, credential)?;
        debug!(target_host = %target, "ssh session established");

        Ok(Self {
            session,
            target: target.clone(),
            peer,
            closed: false,
        })
    }

    const fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

fn authenticate(session: &Session, user: &str, credential: &Credential) -> Result<(), SessionError> {
    let rejected = |err: ssh2::Error| SessionError::AuthRejected {
        user: user.to_owned(),
        message: err.to_string(),
    };

    match credential {
        Credential::Password(password) => {
            let offered = session.auth_methods(user).map_err(rejected)?.to_owned();
            if !offered.split(',').any(|method| method.trim() == "password") {
                return Err(SessionError::AuthMethodUnsupported {
                    user: user.to_owned(),
                    offered,
                });
            }
            session.userauth_password(user, password).map_err(rejected)?;
        }
        Credential::Key { path, passphrase } => {
            if !path.as_std_path().exists() {
                return Err(SessionError::MissingKey { path: path.clone() });
            }
            session
                .userauth_pubkey_file(user, None, path.as_std_path(), passphrase.as_deref())
                .map_err(rejected)?;
        }
    }

    if session.authenticated() {
        Ok(())
    } else {
        Err(SessionError::AuthRejected {
            user: user.to_owned(),
            message: String::from("server did not accept the credential"),
        })
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reads whatever `reader` has buffered into `sink`.
///
/// `Ok(None)` means nothing is available yet.
fn read_available(
    reader: &mut impl Read,
    sink: &mut Vec<u8>,
    buffer: &mut [u8],
) -> io::Result<Option<usize>> {
    match reader.read(buffer) {
        Ok(read) => {
            sink.extend_from_slice(buffer.get(..read).unwrap_or_default());
            Ok(Some(read))
        }
        Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Drains both output streams of a non-blocking channel together, so a
/// remote command blocked on a full stderr window cannot stall stdout.
///
/// A zero-length read only ends a stream once `at_eof` agrees. With
/// `idle_timeout` set, the drain fails after that long without new output.
fn drain_streams<O: Read, E: Read>(
    stdout: &mut O,
    stderr: &mut E,
    at_eof: impl Fn() -> bool,
    idle_timeout: Option<Duration>,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buffer = [0_u8; 8192];
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut last_output = Instant::now();

    while !(stdout_done && stderr_done) {
        let mut progressed = false;
        if !stdout_done {
            match read_available(stdout, &mut out, &mut buffer)? {
                Some(0) => stdout_done = at_eof(),
                Some(_) => progressed = true,
                None => {}
            }
        }
        if !stderr_done {
            match read_available(stderr, &mut err, &mut buffer)? {
                Some(0) => stderr_done = at_eof(),
                Some(_) => progressed = true,
                None => {}
            }
        }

        if progressed {
            last_output = Instant::now();
        } else if !(stdout_done && stderr_done) {
            if idle_timeout.is_some_and(|limit| last_output.elapsed() >= limit) {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "remote command produced no output before the timeout",
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
    Ok((out, err))
}

fn channel_error(err: impl std::fmt::Display) -> SessionError {
    SessionError::Channel {
        message: err.to_string(),
    }
}

impl RemoteSession for SshSession {
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
        self.ensure_open()?;
        let mut channel = self.session.channel_session().map_err(channel_error)?;
        channel.exec(&command.script()).map_err(channel_error)?;

        if let Some(input) = stdin {
            channel.write_all(input.as_bytes()).map_err(channel_error)?;
            channel.flush().map_err(channel_error)?;
        }
        channel.send_eof().map_err(channel_error)?;

        let idle_timeout = match self.session.timeout() {
            0 => None,
            millis => Some(Duration::from_millis(u64::from(millis))),
        };
        let mut stdout_stream = channel.stream(0);
        let mut stderr_stream = channel.stderr();
        self.session.set_blocking(false);
        let drained = drain_streams(
            &mut stdout_stream,
            &mut stderr_stream,
            || channel.eof(),
            idle_timeout,
        );
        self.session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(channel_error)?;

        channel.wait_close().map_err(channel_error)?;
        let exit_status = channel.exit_status().map_err(channel_error)?;

        Ok(CommandOutput {
            exit_status: Some(exit_status),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn write_file(&self, remote_path: &str, content: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        let transfer_error = |message: String| SessionError::Transfer {
            path: remote_path.to_owned(),
            message,
        };
        let sftp = self
            .session
            .sftp()
            .map_err(|err| transfer_error(err.to_string()))?;
        let mut file = sftp
            .create(Path::new(remote_path))
            .map_err(|err| transfer_error(err.to_string()))?;
        file.write_all(content.as_bytes())
            .map_err(|err| transfer_error(err.to_string()))?;
        debug!(target_host = %self.target, path = remote_path, bytes = content.len(), "wrote remote file");
        Ok(())
    }

    fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session
            .disconnect(None, "provisioning finished", None)
            .map_err(channel_error)
    }
}

/// Opens [`SshSession`]s with fixed timeouts.
#[derive(Clone, Copy, Debug)]
pub struct SshConnector {
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
}

impl SshConnector {
    /// Connector for layer runs: bounded dial, unbounded commands.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout: None,
        }
    }

    /// Connector for probing: every step of the login is bounded.
    #[must_use]
    pub const fn probing(timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
            io_timeout: Some(timeout),
        }
    }
}

impl Connector for SshConnector {
    fn connect(
        &self,
        target: &SshTarget,
        credential: &Credential,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        let session = SshSession::connect(target, credential, self.connect_timeout, self.io_timeout)?;
        Ok(Box::new(session))
    }
}
