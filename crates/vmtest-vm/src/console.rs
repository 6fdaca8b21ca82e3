//! Console stream capture.
//!
//! Mirrors the guest's serial console into two files: the raw byte stream,
//! and a parallel line log with ANSI escape sequences stripped (the QEMU
//! firmware is liberal with them). Lines are also emitted as structured
//! debug records tagged with the VM name so parallel runs stay attributable.
//!
//! The logger is a small state machine: Unattached -> Attached ->
//! Draining -> Closed. One tokio task owns the stream's event channel end to
//! end; stream failures are logged and converted into an abort-close, never
//! propagated to the caller.

use crate::error::{Result, VmError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use vmtest_hv::{ConsoleEvent, ConsoleStream};

/// Suffix appended to the raw log path for the stripped line log.
pub const LINE_LOG_SUFFIX: &str = ".lines";

/// Observable state of a console logger session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    /// Consuming events from the stream.
    Attached,
    /// Close initiated; flushing buffered output.
    Draining,
    /// Files closed, stream released, completion signalled.
    Closed,
}

fn strip_ansi(line: &str) -> String {
    static ANSI_ESCAPE: OnceLock<Regex> = OnceLock::new();
    let re = ANSI_ESCAPE.get_or_init(|| {
        // Covers both two-byte escapes and CSI sequences.
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("static pattern")
    });
    re.replace_all(line, "").into_owned()
}

/// Asynchronous capture of one VM's serial console.
///
/// Owned by exactly one VM handle. Dropping the logger without closing it
/// leaves the capture task running until the stream ends on its own.
pub struct ConsoleLogger {
    vm_name: String,
    abort_tx: Option<oneshot::Sender<()>>,
    state_rx: watch::Receiver<LoggerState>,
    task: Option<JoinHandle<()>>,
}

impl ConsoleLogger {
    /// Attach to a console stream, logging to `log_file_path` (raw) and
    /// `log_file_path + ".lines"` (stripped lines). Files are opened for
    /// append before any guest output can arrive.
    pub async fn attach(
        vm_name: impl Into<String>,
        mut stream: Box<dyn ConsoleStream>,
        log_file_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let vm_name = vm_name.into();
        let raw_path = log_file_path.as_ref().to_path_buf();
        let line_path = line_log_path(&raw_path);

        let raw_file = open_append(&raw_path).await?;
        let line_file = open_append(&line_path).await?;

        let events = stream.take_events().ok_or_else(|| {
            VmError::Configuration("console stream event channel already consumed".into())
        })?;

        let (abort_tx, abort_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(LoggerState::Attached);

        let worker = LoggerWorker {
            vm_name: vm_name.clone(),
            stream,
            events,
            raw_file,
            line_file,
            buffer: Vec::new(),
            state_tx,
        };
        let task = tokio::spawn(worker.run(abort_rx));

        tracing::debug!(vm_name = %vm_name, log = %raw_path.display(), "console logger attached");
        Ok(Self {
            vm_name,
            abort_tx: Some(abort_tx),
            state_rx,
            task: Some(task),
        })
    }

    /// Current state of the session.
    pub fn state(&self) -> LoggerState {
        *self.state_rx.borrow()
    }

    /// Close the session.
    ///
    /// With `abort` the stream is torn down immediately, discarding
    /// anything still in flight; without it the call waits for the stream's
    /// own EOF or hangup. Idempotent either way.
    pub async fn close(&mut self, abort: bool) {
        if abort {
            if let Some(tx) = self.abort_tx.take() {
                // The worker may already have exited on its own.
                let _ = tx.send(());
            }
        }
        self.wait_for_close().await;
    }

    /// Block until the close routine has completed.
    ///
    /// Typically used when gracefully shutting down a VM whose console is
    /// expected to reach EOF by itself.
    pub async fn wait_for_close(&mut self) {
        let mut state_rx = self.state_rx.clone();
        while *state_rx.borrow_and_update() != LoggerState::Closed {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(vm_name = %self.vm_name, error = %e, "console logger task failed");
            }
        }
    }
}

/// Path of the stripped line log next to the raw log.
pub fn line_log_path(raw_path: &Path) -> PathBuf {
    let mut os = raw_path.as_os_str().to_owned();
    os.push(LINE_LOG_SUFFIX);
    PathBuf::from(os)
}

async fn open_append(path: &Path) -> Result<File> {
    Ok(tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?)
}

struct LoggerWorker {
    vm_name: String,
    stream: Box<dyn ConsoleStream>,
    events: tokio::sync::mpsc::UnboundedReceiver<ConsoleEvent>,
    raw_file: File,
    line_file: File,
    buffer: Vec<u8>,
    state_tx: watch::Sender<LoggerState>,
}

impl LoggerWorker {
    async fn run(mut self, mut abort_rx: oneshot::Receiver<()>) {
        let graceful = loop {
            tokio::select! {
                _ = &mut abort_rx => {
                    tracing::debug!(vm_name = %self.vm_name, "console close requested (abort)");
                    break false;
                }
                event = self.events.recv() => match event {
                    Some(ConsoleEvent::Data(data)) => {
                        if let Err(e) = self.consume(&data).await {
                            tracing::warn!(vm_name = %self.vm_name, error = %e, "console write failed");
                            break false;
                        }
                    }
                    Some(ConsoleEvent::Eof) => {
                        tracing::warn!(vm_name = %self.vm_name, "console EOF");
                        break true;
                    }
                    Some(ConsoleEvent::Error(detail)) => {
                        tracing::warn!(vm_name = %self.vm_name, detail = %detail, "console stream error");
                        break false;
                    }
                    Some(ConsoleEvent::Hangup) => {
                        tracing::warn!(vm_name = %self.vm_name, "console hangup");
                        break false;
                    }
                    // Backend dropped the sender; nothing further will come.
                    None => break false,
                }
            }
        };
        self.close_session(graceful).await;
    }

    /// Write one burst of console bytes and reassemble complete lines.
    async fn consume(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.raw_file.write_all(data).await?;
        self.raw_file.flush().await?;

        self.buffer.extend_from_slice(data);
        if let Some(pos) = self.buffer.iter().rposition(|&b| b == b'\n') {
            let complete: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.emit_record(&complete[..complete.len() - 1]).await?;
        }
        Ok(())
    }

    /// Emit buffered content as one stripped record.
    async fn emit_record(&mut self, content: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(content);
        let line = strip_ansi(text.trim_end());
        tracing::debug!(vm_name = %self.vm_name, console = %line);
        self.line_file.write_all(line.as_bytes()).await?;
        self.line_file.write_all(b"\n").await?;
        self.line_file.flush().await?;
        Ok(())
    }

    /// The single close routine both the graceful and abort paths converge
    /// on. Runs exactly once; the worker exits afterwards.
    async fn close_session(mut self, graceful: bool) {
        let _ = self.state_tx.send(LoggerState::Draining);

        if !self.buffer.is_empty() {
            let remainder = std::mem::take(&mut self.buffer);
            if let Err(e) = self.emit_record(&remainder).await {
                tracing::warn!(vm_name = %self.vm_name, error = %e, "final console flush failed");
            }
        }
        if let Err(e) = self.raw_file.flush().await {
            tracing::warn!(vm_name = %self.vm_name, error = %e, "raw console log flush failed");
        }

        let release = if graceful {
            self.stream.finish().await
        } else {
            self.stream.abort().await
        };
        if let Err(e) = release {
            tracing::warn!(vm_name = %self.vm_name, error = %e, "console stream release failed");
        }

        let _ = self.state_tx.send(LoggerState::Closed);
        tracing::debug!(vm_name = %self.vm_name, graceful, "console logger closed");
    }
}
