//! Error types for vmtest-hv.

use thiserror::Error;

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HvError>;

/// Errors reported by a hypervisor backend.
#[derive(Debug, Error)]
pub enum HvError {
    /// The domain descriptor was rejected by the backend.
    #[error("malformed domain descriptor: {0}")]
    InvalidDescriptor(String),

    /// A domain with the same name is already defined.
    #[error("domain name already defined: {0}")]
    NameCollision(String),

    /// The domain handle does not refer to a known domain.
    #[error("domain not found: {0}")]
    DomainNotFound(String),

    /// A lifecycle operation failed on the backend.
    #[error("{op} failed for domain '{domain}': {detail}")]
    Operation {
        /// Operation that was attempted (e.g. "create-paused").
        op: &'static str,
        /// Name of the domain the operation targeted.
        domain: String,
        /// Backend-specific failure detail.
        detail: String,
    },

    /// Opening or driving the console stream failed.
    #[error("console stream error for domain '{domain}': {detail}")]
    Console {
        /// Name of the domain the stream belongs to.
        domain: String,
        /// Backend-specific failure detail.
        detail: String,
    },

    /// The event loop could not be started or stopped.
    #[error("event loop error: {0}")]
    EventLoop(String),
}
