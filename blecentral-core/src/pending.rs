//! Command correlation: single-use result sinks and the per-peripheral slots

use tokio::sync::oneshot;

use crate::error::BleError;
use crate::types::{CommandOutput, Notification, NotificationStream};

pub type CommandResult = Result<CommandOutput, BleError>;

/// Single-use completion handle for one command.
///
/// Resolving twice is a no-op; the second result is dropped.
#[derive(Debug)]
pub struct ResultSink {
    tx: Option<oneshot::Sender<CommandResult>>,
}

impl ResultSink {
    pub fn new() -> (Self, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver the result. Returns false if the sink was already used.
    pub fn resolve(&mut self, result: CommandResult) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // Caller may have stopped waiting; still counts as resolved
                let _ = tx.send(result);
                true
            }
            None => {
                log::trace!("result sink already resolved, dropping late result");
                false
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Connect,
    Disconnect,
    Write,
    Read,
    /// Subscribe whose descriptor write failed with the link going away;
    /// holds the slot until the disconnect resolves it
    Subscribe,
}

/// The single outstanding command of a peripheral
#[derive(Debug)]
pub struct PendingOperation {
    pub kind: OperationKind,
    /// Characteristic handle for Write/Read, matched against completion events
    pub handle: Option<u16>,
    pub sink: ResultSink,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, sink: ResultSink) -> Self {
        Self { kind, handle: None, sink }
    }

    pub fn on_handle(kind: OperationKind, handle: u16, sink: ResultSink) -> Self {
        Self { kind, handle: Some(handle), sink }
    }
}

/// A subscribe awaiting its descriptor write. Independent of the command slot.
#[derive(Debug)]
pub struct PendingSubscribe {
    pub handle: u16,
    pub sink: ResultSink,
    /// Handed to the caller once the descriptor write succeeds
    pub stream: Option<NotificationStream>,
}

/// Standing route for one subscribed characteristic
pub type NotifyRoute = tokio::sync::mpsc::UnboundedSender<Notification>;
