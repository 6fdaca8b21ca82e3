//! Console stream events.
//!
//! Backends translate their native console callbacks (readable / error /
//! hangup) into [`ConsoleEvent`] messages pushed onto a channel from the
//! event-processing thread. The harness side consumes that channel from a
//! single owner, which keeps all line reassembly out of the callback path.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One event observed on a domain's console stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// A chunk of raw console bytes.
    Data(Bytes),
    /// The stream reached end of file (guest side closed cleanly).
    Eof,
    /// The backend reported a read error; carries its description.
    Error(String),
    /// The backend reported a hangup.
    Hangup,
}

/// A non-blocking console stream attached to a running domain.
#[async_trait]
pub trait ConsoleStream: Send {
    /// Hand out the event receiver.
    ///
    /// Returns `Some` exactly once; the stream has a single consumer.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConsoleEvent>>;

    /// Abort the stream immediately, discarding in-flight data.
    ///
    /// Idempotent. After this returns no further events are delivered.
    async fn abort(&mut self) -> Result<()>;

    /// Finish the stream gracefully after EOF.
    ///
    /// Idempotent. After this returns no further events are delivered.
    async fn finish(&mut self) -> Result<()>;
}
