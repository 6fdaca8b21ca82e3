//! SSH error types.

use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, SshError>;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("failed to connect to {address}: {detail}")]
    Connect { address: String, detail: String },

    #[error("host key for {address} does not match the known-hosts entry")]
    HostKeyMismatch { address: String },

    #[error("authentication for {username}@{address} with key {key_path} failed")]
    Auth {
        address: String,
        username: String,
        key_path: PathBuf,
    },

    #[error("command `{command}` exited with status {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("command `{command}` still running after {elapsed:?}")]
    CommandTimeout { command: String, elapsed: Duration },

    #[error("no connection to {address} after {elapsed:?}: {source}")]
    RetriesExhausted {
        address: String,
        elapsed: Duration,
        source: Box<SshError>,
    },

    #[error(transparent)]
    Vm(#[from] vmtest_vm::VmError),

    #[error(transparent)]
    Ssh(#[from] ssh2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
