//! The shared hypervisor event-processing loop.
//!
//! Callback-driven backends (libvirt in particular) require one thread that
//! continuously runs their event iteration, and every stream/domain callback
//! in the process fires on that thread. Instead of a hidden module-level
//! singleton, the loop is an explicit resource the caller constructs once,
//! injects into the backend, and tears down at the end of the run.

use crate::error::{HvError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Body of one event-loop iteration.
///
/// For a libvirt backend this wraps `virEventRunDefaultImpl`; the mock
/// backend pumps pending console events. Errors are logged and the loop
/// keeps running: a single bad iteration must not strand every console
/// stream in the process.
pub type EventTick = Box<dyn FnMut() -> Result<()> + Send>;

/// Process-wide event-processing thread shared by all running VMs.
///
/// `ensure_started` is idempotent, so layered setup code can call it
/// defensively without tracking whether initialization already happened.
pub struct EventLoop {
    started: AtomicBool,
    shutdown: Arc<AtomicBool>,
    tick: Mutex<Option<EventTick>>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Default pause between iterations when the tick has no native
    /// blocking wait of its own.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);

    /// Create an event loop around the backend's tick function.
    ///
    /// The thread is not spawned until [`EventLoop::ensure_started`].
    pub fn new(tick: impl FnMut() -> Result<()> + Send + 'static) -> Self {
        Self::with_interval(tick, Self::DEFAULT_INTERVAL)
    }

    /// Create an event loop with an explicit iteration interval.
    pub fn with_interval(
        tick: impl FnMut() -> Result<()> + Send + 'static,
        interval: Duration,
    ) -> Self {
        Self {
            started: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            tick: Mutex::new(Some(Box::new(tick))),
            interval,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the event thread if it is not already running.
    ///
    /// Safe to call any number of times; only the first call spawns.
    pub fn ensure_started(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let mut tick = self
            .tick
            .lock()
            .map_err(|_| HvError::EventLoop("tick mutex poisoned".into()))?
            .take()
            .ok_or_else(|| HvError::EventLoop("tick already consumed".into()))?;

        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("hv-events".into())
            .spawn(move || {
                tracing::debug!("hypervisor event thread started");
                while !shutdown.load(Ordering::SeqCst) {
                    if let Err(e) = tick() {
                        tracing::warn!(error = %e, "event loop iteration failed");
                    }
                    std::thread::sleep(interval);
                }
                tracing::debug!("hypervisor event thread exiting");
            })
            .map_err(|e| HvError::EventLoop(format!("failed to spawn event thread: {e}")))?;

        *self
            .handle
            .lock()
            .map_err(|_| HvError::EventLoop("handle mutex poisoned".into()))? = Some(handle);
        Ok(())
    }

    /// Whether the event thread has been started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Signal the event thread to exit and wait for it.
    ///
    /// Idempotent; returns immediately when the loop never started.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self
            .handle
            .lock()
            .map_err(|_| HvError::EventLoop("handle mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| HvError::EventLoop("event thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Let the thread wind down on its own; joining here could hang a
        // caller that drops the loop from a callback context.
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
