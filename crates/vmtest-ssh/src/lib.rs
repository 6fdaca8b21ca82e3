//! SSH access to booted test VMs.
//!
//! [`SshClient`] wraps a blocking ssh2 session for async callers;
//! [`establish`] turns a freshly booted [`vmtest_vm::Vm`] into an
//! authenticated session, riding out address churn and slow sshd startup.

pub mod client;
pub mod error;
pub mod establish;

pub use client::{ConnectParams, ExecResult, SshClient};
pub use error::{Result, SshError};
pub use establish::{establish, establish_with, EstablishOptions, SessionConnector};
