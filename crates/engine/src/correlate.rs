//! Request correlation between host calls and worker replies

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use widgeon_protocol::{CallOutcome, RequestId};

use crate::{EngineError, MutexExt};

/// What a pending request is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Upload,
    Execute,
}

struct PendingCall {
    kind: CallKind,
    completion: oneshot::Sender<Result<CallOutcome, EngineError>>,
}

/// Outstanding calls keyed by request id.
///
/// Ids come from a strictly incrementing counter and are never reused, so
/// a reply from a worker that was already replaced cannot be mistaken for
/// a live call; it simply finds no entry.
#[derive(Default)]
pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a request id and park a completion channel for it
    pub fn register(
        &self,
        kind: CallKind,
    ) -> (
        RequestId,
        oneshot::Receiver<Result<CallOutcome, EngineError>>,
    ) {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock_or_recover().insert(
            id,
            PendingCall {
                kind,
                completion: tx,
            },
        );
        (id, rx)
    }

    /// Complete a pending call with the worker's outcome
    pub fn resolve(&self, id: RequestId, outcome: CallOutcome) -> Result<(), EngineError> {
        let Some(call) = self.pending.lock_or_recover().remove(&id) else {
            return Err(EngineError::UnrecognizedReply(id));
        };
        let _ = call.completion.send(Ok(outcome));
        Ok(())
    }

    /// Drop a registration whose request was never delivered
    pub fn discard(&self, id: RequestId) {
        self.pending.lock_or_recover().remove(&id);
    }

    /// Fail every pending call, uploads included. Used when the worker is
    /// replaced; nothing in flight can ever resolve afterwards.
    pub fn fail_all(&self) {
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock_or_recover();
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            tracing::debug!(kind = ?call.kind, "failing in-flight call");
            let _ = call.completion.send(Err(EngineError::TimedOut));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock_or_recover().len()
    }
}
