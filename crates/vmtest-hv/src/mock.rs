//! In-memory hypervisor backend for tests.
//!
//! Covers the full [`Hypervisor`] contract without any virtualization:
//! domains move through defined/paused/running states, lease queries replay
//! scripted snapshots, and console bytes injected by the test are delivered
//! through the same event-thread pump a real backend would use. Every
//! operation is recorded so tests can assert exactly which calls a code path
//! made (or, for idempotency, did not make).

use crate::console::{ConsoleEvent, ConsoleStream};
use crate::error::{HvError, Result};
use crate::hypervisor::{DomainId, Hypervisor};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Lifecycle state of a mock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockState {
    Defined,
    Paused,
    Running,
    Destroyed,
}

struct MockDomain {
    id: DomainId,
    state: MockState,
    /// Successive results for `lease_addresses`; the last entry repeats.
    lease_script: VecDeque<Vec<String>>,
    /// Console events queued by the test, delivered by `pump`.
    pending_console: VecDeque<ConsoleEvent>,
    console_tx: Option<mpsc::UnboundedSender<ConsoleEvent>>,
}

#[derive(Default)]
struct Inner {
    domains: HashMap<String, MockDomain>,
    calls: Vec<String>,
}

/// In-memory [`Hypervisor`] implementation.
#[derive(Default, Clone)]
pub struct MockHypervisor {
    inner: Arc<Mutex<Inner>>,
}

impl MockHypervisor {
    /// Create an empty mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the results of successive `lease_addresses` calls.
    ///
    /// Once the script is exhausted the last snapshot keeps repeating.
    pub fn script_leases(&self, id: &DomainId, snapshots: Vec<Vec<String>>) {
        let mut inner = self.lock();
        if let Some(domain) = inner.domains.get_mut(id.name()) {
            domain.lease_script = snapshots.into();
        }
    }

    /// Queue raw bytes for delivery on the domain's console stream.
    pub fn push_console(&self, id: &DomainId, data: &[u8]) {
        let mut inner = self.lock();
        if let Some(domain) = inner.domains.get_mut(id.name()) {
            domain
                .pending_console
                .push_back(ConsoleEvent::Data(Bytes::copy_from_slice(data)));
        }
    }

    /// Queue an EOF on the domain's console stream (guest-side close).
    pub fn close_console(&self, id: &DomainId) {
        let mut inner = self.lock();
        if let Some(domain) = inner.domains.get_mut(id.name()) {
            domain.pending_console.push_back(ConsoleEvent::Eof);
        }
    }

    /// Queue a stream error on the domain's console stream.
    pub fn fail_console(&self, id: &DomainId, detail: &str) {
        let mut inner = self.lock();
        if let Some(domain) = inner.domains.get_mut(id.name()) {
            domain
                .pending_console
                .push_back(ConsoleEvent::Error(detail.to_string()));
        }
    }

    /// Deliver queued console events to their consumers.
    ///
    /// This is the tick a test hands to [`crate::EventLoop`], mirroring how
    /// a real backend delivers stream callbacks from its event thread. Tests
    /// that do not care about threading may also call it directly.
    pub fn pump(&self) -> Result<()> {
        let mut inner = self.lock();
        for domain in inner.domains.values_mut() {
            let Some(tx) = domain.console_tx.clone() else {
                continue;
            };
            while let Some(event) = domain.pending_console.pop_front() {
                if tx.send(event).is_err() {
                    // Consumer went away; stop delivering for this domain.
                    domain.console_tx = None;
                    domain.pending_console.clear();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Every backend call made so far, in order, as "op:domain" strings.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Whether a domain with this name is currently defined.
    pub fn is_defined(&self, name: &str) -> bool {
        self.lock().domains.contains_key(name)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(inner: &mut Inner, op: &str, domain: &str) {
        inner.calls.push(format!("{op}:{domain}"));
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn define(&self, xml: &str) -> Result<DomainId> {
        let name = extract_name(xml)?;
        let mut inner = self.lock();
        Self::record(&mut inner, "define", &name);
        if inner.domains.contains_key(&name) {
            return Err(HvError::NameCollision(name));
        }
        let id = DomainId::new(&name);
        inner.domains.insert(
            name,
            MockDomain {
                id: id.clone(),
                state: MockState::Defined,
                lease_script: VecDeque::new(),
                pending_console: VecDeque::new(),
                console_tx: None,
            },
        );
        Ok(id)
    }

    async fn create_paused(&self, id: &DomainId) -> Result<()> {
        let mut inner = self.lock();
        Self::record(&mut inner, "create-paused", id.name());
        let domain = domain_mut(&mut inner, id)?;
        if domain.state != MockState::Defined {
            return Err(HvError::Operation {
                op: "create-paused",
                domain: id.name().to_string(),
                detail: format!("invalid state {:?}", domain.state),
            });
        }
        domain.state = MockState::Paused;
        Ok(())
    }

    async fn resume(&self, id: &DomainId) -> Result<()> {
        let mut inner = self.lock();
        Self::record(&mut inner, "resume", id.name());
        let domain = domain_mut(&mut inner, id)?;
        if domain.state != MockState::Paused {
            return Err(HvError::Operation {
                op: "resume",
                domain: id.name().to_string(),
                detail: format!("invalid state {:?}", domain.state),
            });
        }
        domain.state = MockState::Running;
        Ok(())
    }

    async fn lease_addresses(&self, id: &DomainId) -> Result<Vec<String>> {
        let mut inner = self.lock();
        Self::record(&mut inner, "lease-addresses", id.name());
        let domain = domain_mut(&mut inner, id)?;
        let snapshot = if domain.lease_script.len() > 1 {
            domain.lease_script.pop_front().unwrap_or_default()
        } else {
            domain.lease_script.front().cloned().unwrap_or_default()
        };
        Ok(snapshot)
    }

    async fn destroy(&self, id: &DomainId) -> Result<()> {
        let mut inner = self.lock();
        Self::record(&mut inner, "destroy", id.name());
        let domain = domain_mut(&mut inner, id)?;
        match domain.state {
            MockState::Paused | MockState::Running => {
                domain.state = MockState::Destroyed;
                // Hard stop hangs up the console.
                domain.pending_console.push_back(ConsoleEvent::Hangup);
                Ok(())
            }
            state => Err(HvError::Operation {
                op: "destroy",
                domain: id.name().to_string(),
                detail: format!("domain is not running ({state:?})"),
            }),
        }
    }

    async fn undefine(&self, id: &DomainId) -> Result<()> {
        let mut inner = self.lock();
        Self::record(&mut inner, "undefine", id.name());
        if inner.domains.remove(id.name()).is_none() {
            return Err(HvError::DomainNotFound(id.name().to_string()));
        }
        Ok(())
    }

    async fn open_console(&self, id: &DomainId) -> Result<Box<dyn ConsoleStream>> {
        let mut inner = self.lock();
        Self::record(&mut inner, "open-console", id.name());
        let domain = domain_mut(&mut inner, id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        domain.console_tx = Some(tx);
        Ok(Box::new(MockConsoleStream {
            hv: self.clone(),
            domain: id.name().to_string(),
            events: Some(rx),
        }))
    }
}

fn domain_mut<'a>(inner: &'a mut Inner, id: &DomainId) -> Result<&'a mut MockDomain> {
    inner
        .domains
        .get_mut(id.name())
        .filter(|d| d.id.uuid() == id.uuid())
        .ok_or_else(|| HvError::DomainNotFound(id.name().to_string()))
}

/// Minimal descriptor check: a well-formed document carries a non-empty
/// `<name>` element. Real backends validate the full schema.
fn extract_name(xml: &str) -> Result<String> {
    let start = xml
        .find("<name>")
        .ok_or_else(|| HvError::InvalidDescriptor("missing <name> element".into()))?;
    let rest = &xml[start + "<name>".len()..];
    let end = rest
        .find("</name>")
        .ok_or_else(|| HvError::InvalidDescriptor("unterminated <name> element".into()))?;
    let name = rest[..end].trim();
    if name.is_empty() {
        return Err(HvError::InvalidDescriptor("empty domain name".into()));
    }
    Ok(name.to_string())
}

struct MockConsoleStream {
    hv: MockHypervisor,
    domain: String,
    events: Option<mpsc::UnboundedReceiver<ConsoleEvent>>,
}

impl MockConsoleStream {
    fn detach(&self) {
        let mut inner = self.hv.lock();
        if let Some(domain) = inner.domains.get_mut(&self.domain) {
            domain.console_tx = None;
            domain.pending_console.clear();
        }
    }
}

#[async_trait]
impl ConsoleStream for MockConsoleStream {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConsoleEvent>> {
        self.events.take()
    }

    async fn abort(&mut self) -> Result<()> {
        self.detach();
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.detach();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    const XML: &str = "<domain><name>mock-vm</name></domain>";

    #[tokio::test]
    async fn test_define_rejects_duplicate_name() {
        let hv = MockHypervisor::new();
        hv.define(XML).await.unwrap();
        let err = hv.define(XML).await.unwrap_err();
        assert!(matches!(err, HvError::NameCollision(name) if name == "mock-vm"));
    }

    #[tokio::test]
    async fn test_define_rejects_missing_name() {
        let hv = MockHypervisor::new();
        let err = hv.define("<domain></domain>").await.unwrap_err();
        assert!(matches!(err, HvError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_state_transitions() {
        let hv = MockHypervisor::new();
        let id = hv.define(XML).await.unwrap();

        // Resume before create-paused is rejected.
        assert!(hv.resume(&id).await.is_err());

        assert_ok!(hv.create_paused(&id).await);
        assert_ok!(hv.resume(&id).await);
        assert_ok!(hv.destroy(&id).await);
        assert_ok!(hv.undefine(&id).await);
        assert!(!hv.is_defined("mock-vm"));
    }

    #[tokio::test]
    async fn test_lease_script_last_snapshot_repeats() {
        let hv = MockHypervisor::new();
        let id = hv.define(XML).await.unwrap();
        hv.script_leases(
            &id,
            vec![vec![], vec!["192.168.122.10".into(), "192.168.122.11".into()]],
        );

        assert!(hv.lease_addresses(&id).await.unwrap().is_empty());
        let addrs = hv.lease_addresses(&id).await.unwrap();
        assert_eq!(addrs.len(), 2);
        // Script exhausted: the last snapshot repeats.
        assert_eq!(hv.lease_addresses(&id).await.unwrap(), addrs);
    }

    #[tokio::test]
    async fn test_console_pump_delivers_events() {
        let hv = MockHypervisor::new();
        let id = hv.define(XML).await.unwrap();
        let mut stream = hv.open_console(&id).await.unwrap();
        let mut events = stream.take_events().unwrap();
        assert!(stream.take_events().is_none());

        hv.push_console(&id, b"hello");
        hv.close_console(&id);
        hv.pump().unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ConsoleEvent::Data(Bytes::from_static(b"hello"))
        );
        assert_eq!(events.recv().await.unwrap(), ConsoleEvent::Eof);
    }

    #[tokio::test]
    async fn test_abort_stops_delivery() {
        let hv = MockHypervisor::new();
        let id = hv.define(XML).await.unwrap();
        let mut stream = hv.open_console(&id).await.unwrap();
        let mut events = stream.take_events().unwrap();

        stream.abort().await.unwrap();
        hv.push_console(&id, b"late");
        hv.pump().unwrap();

        // Sender dropped on abort: channel reports closed, no data.
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let hv = MockHypervisor::new();
        let id = hv.define(XML).await.unwrap();
        hv.create_paused(&id).await.unwrap();
        assert_eq!(
            hv.calls(),
            vec!["define:mock-vm", "create-paused:mock-vm"]
        );
    }
}
