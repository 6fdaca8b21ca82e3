//! Error types for the VM test-harness core.

use crate::spec::Architecture;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vmtest_hv::HvError;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while building, booting or tearing down a test VM.
#[derive(Debug, Error)]
pub enum VmError {
    /// Invalid spec or harness configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// No firmware descriptor matched the requested combination.
    #[error(
        "no firmware found for architecture={architecture}, machine={machine_model}, \
         secure-boot={secure_boot}"
    )]
    FirmwareNotFound {
        /// Requested guest architecture.
        architecture: Architecture,
        /// Requested machine model.
        machine_model: String,
        /// Whether secure-boot firmware was requested.
        secure_boot: bool,
    },

    /// A firmware descriptor file could not be parsed.
    #[error("failed to parse firmware descriptor {path}: {source}")]
    FirmwareParse {
        /// Descriptor file that failed to parse.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A firmware machine pattern is not a valid glob.
    #[error("invalid machine pattern '{pattern}': {source}")]
    MachinePattern {
        /// Offending pattern text.
        pattern: String,
        /// Underlying glob error.
        #[source]
        source: glob::PatternError,
    },

    /// Disk device names only cover indexes 0..=25 (vda..vdz).
    #[error("unsupported disk index: {0}")]
    UnsupportedDiskIndex(usize),

    /// The VM did not request an address before the timeout elapsed.
    ///
    /// Fatal to the test using this VM only; the OS likely failed to boot.
    #[error("no IP address found for '{vm_name}' after {waited:?}; OS might have failed to boot")]
    BootTimeout {
        /// Name of the VM that never produced a lease.
        vm_name: String,
        /// How long the harness waited.
        waited: Duration,
    },

    /// The VM was already started; a handle starts at most once.
    #[error("VM '{0}' was already started")]
    AlreadyStarted(String),

    /// Error from the hypervisor backend.
    #[error("hypervisor error: {0}")]
    Hv(#[from] HvError),

    /// XML emission failed.
    #[error("domain descriptor serialization failed: {0}")]
    Xml(#[from] xml::writer::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single failure recorded during best-effort teardown.
///
/// Teardown never aborts mid-sequence; failures are collected and surfaced
/// together once the whole batch completes.
#[derive(Debug)]
pub struct TeardownFailure {
    /// Name of the VM the failure belongs to.
    pub vm_name: String,
    /// Operation that failed ("destroy" or "undefine").
    pub op: &'static str,
    /// The underlying error.
    pub error: VmError,
}

impl std::fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed for '{}': {}", self.op, self.vm_name, self.error)
    }
}

/// Aggregated result of a batch teardown.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Every failure observed, in teardown order.
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Whether the whole batch tore down cleanly.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fold another handle's failures into this report.
    pub fn extend(&mut self, failures: Vec<TeardownFailure>) {
        self.failures.extend(failures);
    }
}

impl std::fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "teardown completed cleanly");
        }
        writeln!(f, "{} teardown failure(s):", self.failures.len())?;
        for failure in &self.failures {
            writeln!(f, "  - {failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_timeout_carries_vm_name() {
        let err = VmError::BootTimeout {
            vm_name: "vm-under-test".into(),
            waited: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("vm-under-test"));
    }

    #[test]
    fn test_teardown_report_display() {
        let mut report = TeardownReport::default();
        assert!(report.is_clean());
        assert_eq!(report.to_string(), "teardown completed cleanly");

        report.extend(vec![TeardownFailure {
            vm_name: "vm-a".into(),
            op: "undefine",
            error: VmError::Configuration("boom".into()),
        }]);
        assert!(!report.is_clean());
        let text = report.to_string();
        assert!(text.contains("1 teardown failure(s)"));
        assert!(text.contains("undefine failed for 'vm-a'"));
    }
}
