//! # vmtest-hv
//!
//! Hypervisor abstraction layer for the VM test harness.
//!
//! The harness itself never talks to a hypervisor directly. Everything it
//! needs goes through the [`Hypervisor`] trait: define, create-paused,
//! resume, lease queries, destroy, undefine, and console streams. The
//! backend (libvirt/QEMU in production, [`MockHypervisor`] in tests) is a
//! caller-supplied collaborator.
//!
//! Backends that rely on a callback-driven event API drive those callbacks
//! from the process-wide [`EventLoop`] resource. Console output is delivered
//! as [`ConsoleEvent`] messages on a channel rather than as raw callbacks, so
//! exactly one consumer owns the stream.

mod console;
mod error;
mod events;
mod hypervisor;
pub mod mock;

pub use console::{ConsoleEvent, ConsoleStream};
pub use error::{HvError, Result};
pub use events::EventLoop;
pub use hypervisor::{DomainId, Hypervisor};
pub use mock::MockHypervisor;
