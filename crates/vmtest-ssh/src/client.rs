//! Blocking ssh2 session wrapped for async callers.
//!
//! libssh2 drives a plain TCP socket synchronously, so every operation runs
//! on the blocking thread pool and the session itself lives behind a mutex.
//! One client maps to one authenticated session; commands on the same client
//! run sequentially.

use crate::error::{Result, SshError};
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to open and authenticate one session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub address: String,
    pub port: u16,
    pub username: String,
    /// Private key used for pubkey authentication.
    pub key_path: PathBuf,
    /// Known-hosts file to verify against and record new host keys into.
    /// `None` skips host-key verification entirely.
    pub known_hosts_path: Option<PathBuf>,
    /// Timeout for the initial TCP connect.
    pub tcp_timeout: Duration,
}

impl ConnectParams {
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            address: address.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            key_path: key_path.into(),
            known_hosts_path: None,
            tcp_timeout: DEFAULT_TCP_TIMEOUT,
        }
    }
}

/// Outcome of one remote command.
#[derive(Debug)]
pub struct ExecResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// Remote exit status. `-1` when the command timed out.
    pub exit_code: i32,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl ExecResult {
    /// Turn a timeout or non-zero exit status into an error.
    pub fn check(self) -> Result<Self> {
        if self.timed_out {
            return Err(SshError::CommandTimeout {
                command: self.command,
                elapsed: self.elapsed,
            });
        }
        if self.exit_code != 0 {
            return Err(SshError::CommandFailed {
                command: self.command,
                exit_code: self.exit_code,
                stderr: self.stderr,
            });
        }
        Ok(self)
    }
}

/// An authenticated SSH session to one guest.
pub struct SshClient {
    session: Arc<Mutex<Session>>,
    address: String,
}

impl SshClient {
    /// Open a TCP connection, handshake, record the host key, and
    /// authenticate with the configured private key.
    pub async fn connect(params: ConnectParams) -> Result<Self> {
        let address = params.address.clone();
        let session = run_blocking(move || connect_blocking(&params)).await?;
        tracing::debug!(address = %address, "SSH session established");
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            address,
        })
    }

    /// The address this session is bound to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Run a command on the guest, collecting stdout and stderr.
    ///
    /// Output lines are logged at debug as they arrive. A command that
    /// outlives `timeout` is reported through [`ExecResult::timed_out`]
    /// rather than an error, so callers can still inspect partial output;
    /// [`ExecResult::check`] converts it into one.
    pub async fn run(&self, command: &str, timeout: Duration) -> Result<ExecResult> {
        let session = self.session.clone();
        let command = command.to_string();
        run_blocking(move || exec_blocking(&lock(&session), &command, timeout)).await
    }

    /// Copy a local file to the guest over SFTP.
    pub async fn upload(&self, local: impl AsRef<Path>, remote: impl AsRef<Path>) -> Result<u64> {
        let session = self.session.clone();
        let local = local.as_ref().to_path_buf();
        let remote = remote.as_ref().to_path_buf();
        run_blocking(move || {
            let session = lock(&session);
            let sftp = session.sftp()?;
            let mut src = std::fs::File::open(&local)?;
            let mut dst = sftp.create(&remote)?;
            Ok(std::io::copy(&mut src, &mut dst)?)
        })
        .await
    }

    /// Copy a file from the guest over SFTP.
    pub async fn download(&self, remote: impl AsRef<Path>, local: impl AsRef<Path>) -> Result<u64> {
        let session = self.session.clone();
        let remote = remote.as_ref().to_path_buf();
        let local = local.as_ref().to_path_buf();
        run_blocking(move || {
            let session = lock(&session);
            let sftp = session.sftp()?;
            let mut src = sftp.open(&remote)?;
            let mut dst = std::fs::File::create(&local)?;
            Ok(std::io::copy(&mut src, &mut dst)?)
        })
        .await
    }

    /// Disconnect cleanly.
    pub async fn close(self) -> Result<()> {
        let session = self.session;
        run_blocking(move || {
            lock(&session).disconnect(None, "session closed", None)?;
            Ok(())
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| SshError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    match session.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn connect_blocking(params: &ConnectParams) -> Result<Session> {
    let target = format!("{}:{}", params.address, params.port);
    let socket = target
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| SshError::Connect {
            address: params.address.clone(),
            detail: "address did not resolve".into(),
        })?;
    let tcp = TcpStream::connect_timeout(&socket, params.tcp_timeout).map_err(|e| {
        SshError::Connect {
            address: params.address.clone(),
            detail: e.to_string(),
        }
    })?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| SshError::Connect {
        address: params.address.clone(),
        detail: e.to_string(),
    })?;

    if let Some(path) = &params.known_hosts_path {
        record_host_key(&session, &params.address, params.port, path)?;
    }

    session
        .userauth_pubkey_file(&params.username, None, &params.key_path, None)
        .map_err(|_| SshError::Auth {
            address: params.address.clone(),
            username: params.username.clone(),
            key_path: params.key_path.clone(),
        })?;
    if !session.authenticated() {
        return Err(SshError::Auth {
            address: params.address.clone(),
            username: params.username.clone(),
            key_path: params.key_path.clone(),
        });
    }
    Ok(session)
}

/// Verify the server's host key against the known-hosts file, recording
/// unknown keys (trust-on-first-use). A key that contradicts an existing
/// entry is rejected.
fn record_host_key(session: &Session, host: &str, port: u16, path: &Path) -> Result<()> {
    let mut known_hosts = session.known_hosts()?;
    if path.exists() {
        known_hosts.read_file(path, KnownHostFileKind::OpenSSH)?;
    }
    let (key, key_type) = session.host_key().ok_or_else(|| SshError::Connect {
        address: host.to_string(),
        detail: "server offered no host key".into(),
    })?;
    match known_hosts.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(SshError::HostKeyMismatch {
            address: host.to_string(),
        }),
        CheckResult::NotFound | CheckResult::Failure => {
            known_hosts.add(host, key, "recorded by vmtest", key_type.into())?;
            known_hosts.write_file(path, KnownHostFileKind::OpenSSH)?;
            Ok(())
        }
    }
}

fn exec_blocking(session: &Session, command: &str, timeout: Duration) -> Result<ExecResult> {
    let started = Instant::now();
    // libssh2 applies this to every blocking call on the session; a read
    // that exceeds it returns an error we fold into `timed_out`.
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);

    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    let stdout_read = drain_stream(&mut channel, "stdout", &mut stdout)?;
    let stderr_read = drain_stream(&mut channel.stderr(), "stderr", &mut stderr)?;
    let mut timed_out = stdout_read == ReadOutcome::TimedOut || stderr_read == ReadOutcome::TimedOut;

    if !timed_out {
        channel.close().ok();
        if channel.wait_close().is_err() {
            timed_out = started.elapsed() >= timeout;
        }
    }
    let exit_code = if timed_out {
        -1
    } else {
        channel.exit_status()?
    };

    let elapsed = started.elapsed();
    tracing::debug!(command, exit_code, elapsed_ms = elapsed.as_millis() as u64, timed_out, "remote command finished");
    Ok(ExecResult {
        command: command.to_string(),
        stdout,
        stderr,
        exit_code,
        elapsed,
        timed_out,
    })
}

/// How a stream read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    Eof,
    TimedOut,
}

/// Read a stream to EOF, logging each complete line as it arrives.
///
/// A read cut short by the session timeout is reported as
/// [`ReadOutcome::TimedOut`]; any other read failure (connection reset,
/// channel error) is a real fault and propagates as its own error.
fn drain_stream(
    stream: &mut dyn Read,
    label: &'static str,
    sink: &mut String,
) -> Result<ReadOutcome> {
    let mut pending = String::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                if !pending.is_empty() {
                    tracing::debug!(stream = label, line = %pending.trim_end(), "remote output");
                }
                return Ok(ReadOutcome::Eof);
            }
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                sink.push_str(&chunk);
                pending.push_str(&chunk);
                while let Some(pos) = pending.find('\n') {
                    let line: String = pending.drain(..=pos).collect();
                    tracing::debug!(stream = label, line = %line.trim_end(), "remote output");
                }
            }
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) =>
            {
                return Ok(ReadOutcome::TimedOut);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
