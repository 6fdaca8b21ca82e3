//! The `Hypervisor` trait - the boundary between the harness and the
//! virtualization backend.

use crate::console::ConsoleStream;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// Opaque identifier binding a defined domain to its backend object.
///
/// Returned by [`Hypervisor::define`] and passed back for every subsequent
/// lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainId {
    name: String,
    uuid: Uuid,
}

impl DomainId {
    /// Create an identifier for a freshly defined domain.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
        }
    }

    /// The domain name as it appears in the descriptor.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend-assigned UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Interface to the virtualization backend.
///
/// Production deployments implement this over a libvirt connection; tests
/// use [`crate::MockHypervisor`]. All methods correspond to primitives the
/// harness treats as external: it never assumes anything about how they are
/// carried out, only about their observable contract documented here.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Register a domain from its XML descriptor without starting it.
    ///
    /// # Errors
    /// Fails with [`crate::HvError::InvalidDescriptor`] on a malformed
    /// document and [`crate::HvError::NameCollision`] when a domain with
    /// the same name is already defined.
    async fn define(&self, xml: &str) -> Result<DomainId>;

    /// Create (boot) the domain in the paused state.
    ///
    /// The guest makes no progress until [`Hypervisor::resume`] is called,
    /// which gives the caller a window to attach a console stream before
    /// any guest output is produced.
    async fn create_paused(&self, id: &DomainId) -> Result<()>;

    /// Resume a paused domain.
    async fn resume(&self, id: &DomainId) -> Result<()>;

    /// Return one snapshot of the DHCP lease table for the domain's NIC.
    ///
    /// An empty vector means no lease has been handed out yet. The order of
    /// entries is the backend's order; selection among multiple addresses is
    /// the caller's policy.
    async fn lease_addresses(&self, id: &DomainId) -> Result<Vec<String>>;

    /// Hard-stop the domain. In libvirt terms, "destroy" means "stop".
    async fn destroy(&self, id: &DomainId) -> Result<()>;

    /// Remove the domain definition.
    ///
    /// Contract: also removes managed-save state, snapshot metadata, NVRAM
    /// (firmware variable) files and checkpoint metadata, so no backend
    /// state leaks once this returns.
    async fn undefine(&self, id: &DomainId) -> Result<()>;

    /// Open the domain's serial console as a non-blocking event stream.
    ///
    /// The backend must force-open the console (taking it over from any
    /// other client) and deliver events on its event-processing thread.
    async fn open_console(&self, id: &DomainId) -> Result<Box<dyn ConsoleStream>>;
}
