//! Ownership of one sandbox worker thread

use std::sync::mpsc::Sender;

use tokio::sync::mpsc::UnboundedReceiver;

use widgeon_protocol::{GuestMessage, HostMessage};
use widgeon_sandbox::{worker, CancellationToken, MessageLog, SandboxConfig};

use crate::EngineError;

/// Handle to a running sandbox worker.
///
/// Dropping the host cancels the worker and closes its inbox; the thread
/// winds down on its own. A worker stuck in JS is interrupted by the
/// cancellation flag rather than joined, so replacement never blocks on it.
pub struct ExecutionHost {
    sender: Sender<HostMessage>,
    cancel: CancellationToken,
}

impl ExecutionHost {
    /// Spawn a fresh worker thread. Returns the host handle and the stream
    /// of messages the worker sends back.
    pub fn start(config: SandboxConfig, log: MessageLog) -> (Self, UnboundedReceiver<GuestMessage>) {
        let (sender, inbox) = std::sync::mpsc::channel();
        let (outbox, receiver) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            std::thread::spawn(move || worker::run(config, log, inbox, outbox, cancel));
        }
        (Self { sender, cancel }, receiver)
    }

    pub fn send(&self, message: HostMessage) -> Result<(), EngineError> {
        self.sender
            .send(message)
            .map_err(|_| EngineError::WorkerGone)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ExecutionHost {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
