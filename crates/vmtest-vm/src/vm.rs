//! VM lifecycle management.
//!
//! A [`Vm`] binds one defined hypervisor domain to its console logger and
//! owns the retry/timeout policy around boot. Acquisition failures (define,
//! start) propagate immediately; teardown is best-effort and reports its
//! failures as data instead of raising mid-sequence, so tearing down a batch
//! of VMs never aborts half way and never leaks hypervisor state silently.

use crate::config::HarnessConfig;
use crate::console::ConsoleLogger;
use crate::domain::DomainDescriptor;
use crate::error::{Result, TeardownFailure, TeardownReport, VmError};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vmtest_hv::{DomainId, Hypervisor};

/// Handle to one defined (and possibly running) test VM.
///
/// Exclusive owner of at most one console logger session. A handle is
/// started at most once and closed at most once; `close` is safe to call
/// again but does nothing the second time.
pub struct Vm {
    hv: Arc<dyn Hypervisor>,
    id: DomainId,
    name: String,
    config: HarnessConfig,
    logger: Option<ConsoleLogger>,
    created: bool,
    started: bool,
    closed: bool,
    defined_at: DateTime<Utc>,
}

impl Vm {
    /// Register the domain with the hypervisor without starting it.
    pub async fn define(
        hv: Arc<dyn Hypervisor>,
        descriptor: &DomainDescriptor,
        config: HarnessConfig,
    ) -> Result<Self> {
        config.validate()?;
        let id = hv.define(descriptor.xml()).await?;
        tracing::info!(vm_name = %descriptor.name(), "VM defined");
        Ok(Self {
            hv,
            id,
            name: descriptor.name().to_string(),
            config,
            logger: None,
            created: false,
            started: false,
            closed: false,
            defined_at: Utc::now(),
        })
    }

    /// The VM name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hypervisor-side domain identifier.
    pub fn id(&self) -> &DomainId {
        &self.id
    }

    /// When the domain was defined.
    pub fn defined_at(&self) -> DateTime<Utc> {
        self.defined_at
    }

    /// Boot the VM, capturing its console to `console_log_path`.
    ///
    /// The domain is created paused, the console logger is attached, and
    /// only then is the guest resumed, so early firmware output has a
    /// logger to land in. The ordering is plain caller sequencing, not a
    /// lock; a guest cannot produce output while paused, but output emitted
    /// in the instant between resume and the backend wiring up the stream
    /// can still be lost.
    pub async fn start(&mut self, console_log_path: impl AsRef<Path>) -> Result<()> {
        if self.started {
            return Err(VmError::AlreadyStarted(self.name.clone()));
        }

        self.hv.create_paused(&self.id).await?;
        // The domain exists from here on; teardown must destroy it even if
        // the rest of the start sequence fails.
        self.created = true;

        let stream = self.hv.open_console(&self.id).await?;
        let logger = ConsoleLogger::attach(&self.name, stream, console_log_path).await?;
        self.logger = Some(logger);

        self.hv.resume(&self.id).await?;
        self.started = true;
        tracing::info!(vm_name = %self.name, "VM started");
        Ok(())
    }

    /// One lease-table snapshot, reduced to at most one address by the
    /// configured selection policy.
    pub async fn try_address(&self) -> Result<Option<String>> {
        let addresses = self.hv.lease_addresses(&self.id).await?;
        Ok(self
            .config
            .address_policy
            .select(&addresses)
            .map(str::to_string))
    }

    /// Wait for the VM to boot far enough to request an address.
    ///
    /// Polls the lease table at the configured interval. Fails with
    /// [`VmError::BootTimeout`] when `timeout` elapses first; fatal to the
    /// test using this VM, but nothing else.
    pub async fn address(&self, timeout: Duration) -> Result<String> {
        let start = Instant::now();
        loop {
            if let Some(address) = self.try_address().await? {
                tracing::debug!(
                    vm_name = %self.name,
                    address = %address,
                    waited_s = start.elapsed().as_secs(),
                    "VM requested IP address"
                );
                return Ok(address);
            }

            if start.elapsed() >= timeout {
                return Err(VmError::BootTimeout {
                    vm_name: self.name.clone(),
                    waited: start.elapsed(),
                });
            }

            tokio::time::sleep(self.config.address_poll_interval).await;
        }
    }

    /// Wait for an address using the configured default timeout.
    pub async fn address_default(&self) -> Result<String> {
        self.address(self.config.address_timeout).await
    }

    /// Tear the VM down: destroy, close the console, undefine.
    ///
    /// Every step runs regardless of earlier failures; each failure is
    /// logged and returned. The console is closed between destroy and
    /// undefine, since undefining while the stream is still closing can deadlock
    /// on some backends. Idempotent: a second call performs no hypervisor
    /// operations and returns no failures.
    pub async fn close(&mut self) -> Vec<TeardownFailure> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;

        let mut failures = Vec::new();

        tracing::debug!(vm_name = %self.name, "stopping VM");
        if self.created {
            if let Err(e) = self.hv.destroy(&self.id).await {
                tracing::warn!(vm_name = %self.name, error = %e, "VM stop failed");
                failures.push(TeardownFailure {
                    vm_name: self.name.clone(),
                    op: "destroy",
                    error: e.into(),
                });
            }
        }

        if let Some(mut logger) = self.logger.take() {
            tracing::debug!(vm_name = %self.name, "closing VM console log");
            logger.close(true).await;
        }

        tracing::debug!(vm_name = %self.name, "deleting VM");
        if let Err(e) = self.hv.undefine(&self.id).await {
            tracing::warn!(vm_name = %self.name, error = %e, "VM delete failed");
            failures.push(TeardownFailure {
                vm_name: self.name.clone(),
                op: "undefine",
                error: e.into(),
            });
        }

        failures
    }
}

/// Tear down a batch of VMs, aggregating every failure into one report.
///
/// Individual failures never interrupt the batch; the caller inspects the
/// report once everything has been attempted.
pub async fn close_all(vms: &mut [Vm]) -> TeardownReport {
    let mut report = TeardownReport::default();
    for vm in vms {
        report.extend(vm.close().await);
    }
    if !report.is_clean() {
        tracing::warn!(%report, "batch teardown finished with failures");
    }
    report
}
