//! VM provisioning for OS image validation.
//!
//! This crate turns a portable [`VmSpec`] into a running, observable test
//! VM: firmware resolution against the QEMU firmware registry, domain
//! descriptor construction, lifecycle management, and console capture.
//! Remote access to the booted guest lives in the companion `vmtest-ssh`
//! crate.

pub mod config;
pub mod console;
pub mod domain;
pub mod error;
pub mod firmware;
pub mod spec;
pub mod vm;

pub use config::{AddressPolicy, HarnessConfig};
pub use console::{line_log_path, ConsoleLogger, LoggerState};
pub use domain::{disk_device_name, DomainBuilder, DomainDescriptor};
pub use error::{Result, TeardownFailure, TeardownReport, VmError};
pub use firmware::{resolve_firmware, FirmwareDescriptor, FirmwareSnapshot};
pub use spec::{unique_name, Architecture, BootType, VmSpec};
pub use vm::{close_all, Vm};
