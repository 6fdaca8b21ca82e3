//! Remote session establishment.
//!
//! A freshly booted guest is a moving target: its address can change while
//! cloud-init reconfigures networking, and sshd comes up well after the
//! first DHCP lease. Establishment therefore re-fetches the VM's current
//! address before every attempt instead of latching the first one, and
//! retries with a fixed backoff until an overall deadline.

use crate::client::{ConnectParams, SshClient};
use crate::error::{Result, SshError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use vmtest_vm::{Architecture, HarnessConfig, Vm};

/// Retry and authentication parameters for [`establish`].
#[derive(Debug, Clone)]
pub struct EstablishOptions {
    pub port: u16,
    pub username: String,
    pub key_path: PathBuf,
    pub known_hosts_path: Option<PathBuf>,
    /// How long one address fetch may wait for the guest to request a lease.
    pub address_timeout: Duration,
    /// Deadline across all connection attempts.
    pub overall_timeout: Duration,
    /// Fixed pause between failed attempts.
    pub backoff: Duration,
}

impl EstablishOptions {
    pub fn new(username: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            port: 22,
            username: username.into(),
            key_path: key_path.into(),
            known_hosts_path: None,
            address_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(360),
            backoff: Duration::from_secs(120),
        }
    }

    /// Adjust the address wait for the guest architecture. arm64 guests take
    /// considerably longer to reach the DHCP request than x86_64 ones.
    pub fn for_architecture(mut self, architecture: Architecture) -> Self {
        if architecture == Architecture::Aarch64 {
            self.address_timeout = Duration::from_secs(300);
        }
        self
    }

    /// Take the retry timings from a harness configuration.
    pub fn with_config(mut self, config: &HarnessConfig) -> Self {
        self.address_timeout = config.address_timeout;
        self.overall_timeout = config.connect_timeout;
        self.backoff = config.connect_backoff;
        self
    }
}

/// One attempt at turning an address into an authenticated session.
///
/// The production connector speaks ssh2; tests substitute their own to
/// exercise the retry loop without a live sshd.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    type Session: Send;

    async fn connect(&self, address: &str) -> Result<Self::Session>;
}

struct Ssh2Connector {
    opts: EstablishOptions,
}

#[async_trait]
impl SessionConnector for Ssh2Connector {
    type Session = SshClient;

    async fn connect(&self, address: &str) -> Result<SshClient> {
        let mut params = ConnectParams::new(address, &self.opts.username, &self.opts.key_path);
        params.port = self.opts.port;
        params.known_hosts_path = self.opts.known_hosts_path.clone();
        SshClient::connect(params).await
    }
}

/// Establish an authenticated SSH session to a booted VM.
///
/// Each iteration fetches the VM's current address and attempts one
/// connection. On failure the loop sleeps the configured backoff and tries
/// again with a freshly fetched address, until `overall_timeout` has
/// elapsed; the final error wraps the last attempt's failure. An address
/// fetch that times out fails immediately, since without a lease there is
/// nothing to retry against.
pub async fn establish(vm: &Vm, opts: &EstablishOptions) -> Result<SshClient> {
    let connector = Ssh2Connector { opts: opts.clone() };
    establish_with(vm, opts, &connector).await
}

/// [`establish`] with an explicit connector.
pub async fn establish_with<C: SessionConnector>(
    vm: &Vm,
    opts: &EstablishOptions,
    connector: &C,
) -> Result<C::Session> {
    let started = Instant::now();
    loop {
        let address = vm.address(opts.address_timeout).await?;
        tracing::debug!(vm_name = %vm.name(), address = %address, "attempting SSH connection");
        match connector.connect(&address).await {
            Ok(session) => {
                tracing::info!(
                    vm_name = %vm.name(),
                    address = %address,
                    waited_s = started.elapsed().as_secs(),
                    "SSH session established"
                );
                return Ok(session);
            }
            Err(error) => {
                let elapsed = started.elapsed();
                if elapsed >= opts.overall_timeout {
                    return Err(SshError::RetriesExhausted {
                        address,
                        elapsed,
                        source: Box::new(error),
                    });
                }
                tracing::warn!(
                    vm_name = %vm.name(),
                    address = %address,
                    error = %error,
                    backoff_s = opts.backoff.as_secs(),
                    "SSH connection failed, will retry"
                );
                tokio::time::sleep(opts.backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use vmtest_hv::{Hypervisor, MockHypervisor};
    use vmtest_vm::{BootType, DomainBuilder, VmError, VmSpec};

    struct FakeConnector {
        accept: &'static str,
        attempts: Mutex<Vec<String>>,
    }

    impl FakeConnector {
        fn accepting(address: &'static str) -> Self {
            Self {
                accept: address,
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        type Session = String;

        async fn connect(&self, address: &str) -> Result<String> {
            self.attempts.lock().unwrap().push(address.to_string());
            if address == self.accept {
                Ok(address.to_string())
            } else {
                Err(SshError::Connect {
                    address: address.to_string(),
                    detail: "connection refused".into(),
                })
            }
        }
    }

    fn fast_options() -> EstablishOptions {
        let mut opts = EstablishOptions::new("tester", "/keys/id_ed25519");
        opts.address_timeout = Duration::from_millis(100);
        opts.overall_timeout = Duration::from_secs(2);
        opts.backoff = Duration::from_millis(10);
        opts
    }

    async fn booted_vm(hv: &Arc<MockHypervisor>, name: &str) -> (Vm, tempfile::TempDir) {
        let spec = VmSpec {
            name: name.into(),
            memory_mib: 2048,
            vcpu_count: 2,
            disk_image_path: "/images/os.qcow2".into(),
            boot_type: BootType::Legacy,
            secure_boot: false,
            architecture: Architecture::X86_64,
        };
        let dir = tempfile::tempdir().unwrap();
        let descriptor = DomainBuilder::new(&spec, dir.path().join("console.log"))
            .host_architecture(Some(Architecture::X86_64))
            .build()
            .unwrap();
        let config = HarnessConfig {
            address_poll_interval: Duration::from_millis(10),
            address_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let mut vm = Vm::define(hv.clone() as Arc<dyn Hypervisor>, &descriptor, config)
            .await
            .unwrap();
        vm.start(dir.path().join("console.log")).await.unwrap();
        (vm, dir)
    }

    #[tokio::test]
    async fn test_establish_follows_address_churn() {
        let hv = Arc::new(MockHypervisor::new());
        let (mut vm, _dir) = booted_vm(&hv, "churn-vm").await;
        // The guest's address changes after two snapshots.
        hv.script_leases(
            vm.id(),
            vec![
                vec!["192.168.122.10".into()],
                vec!["192.168.122.10".into()],
                vec!["192.168.122.20".into()],
            ],
        );
        let connector = FakeConnector::accepting("192.168.122.20");

        let session = establish_with(&vm, &fast_options(), &connector)
            .await
            .unwrap();
        assert_eq!(session, "192.168.122.20");
        assert_eq!(
            connector.attempts(),
            vec!["192.168.122.10", "192.168.122.10", "192.168.122.20"]
        );
        vm.close().await;
    }

    #[tokio::test]
    async fn test_establish_gives_up_after_overall_timeout() {
        let hv = Arc::new(MockHypervisor::new());
        let (mut vm, _dir) = booted_vm(&hv, "refusing-vm").await;
        hv.script_leases(vm.id(), vec![vec!["192.168.122.30".into()]]);
        let connector = FakeConnector::accepting("10.0.0.1"); // never offered

        let mut opts = fast_options();
        opts.overall_timeout = Duration::from_millis(50);
        let err = establish_with(&vm, &opts, &connector).await.unwrap_err();
        match err {
            SshError::RetriesExhausted {
                address, source, ..
            } => {
                assert_eq!(address, "192.168.122.30");
                assert!(matches!(*source, SshError::Connect { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        vm.close().await;
    }

    #[tokio::test]
    async fn test_establish_fails_fast_without_a_lease() {
        let hv = Arc::new(MockHypervisor::new());
        let (mut vm, _dir) = booted_vm(&hv, "leaseless-vm").await;
        let connector = FakeConnector::accepting("192.168.122.40");

        let err = establish_with(&vm, &fast_options(), &connector)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Vm(VmError::BootTimeout { .. })));
        assert!(connector.attempts().is_empty());
        vm.close().await;
    }

    #[test]
    fn test_options_architecture_adjustment() {
        let opts = EstablishOptions::new("tester", "/keys/id").for_architecture(Architecture::Aarch64);
        assert_eq!(opts.address_timeout, Duration::from_secs(300));
        let opts = EstablishOptions::new("tester", "/keys/id").for_architecture(Architecture::X86_64);
        assert_eq!(opts.address_timeout, Duration::from_secs(30));
    }
}
