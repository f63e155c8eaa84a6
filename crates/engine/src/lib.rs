//! Widgeon Engine
//!
//! Host-side supervision of the sandbox worker: request correlation,
//! execute timeouts, worker replacement and action dispatch.
//!
//! The central type is [`SupervisedTaskRunner`]. It owns the worker thread
//! behind an [`ExecutionHost`], correlates replies through a
//! [`CorrelationTable`], and replaces the worker wholesale when an execute
//! overruns its deadline, failing every call that was in flight.

mod actions;
mod correlate;
mod host;
mod runner;

pub use actions::{ActionExecutor, ActionRouter};
pub use correlate::{CallKind, CorrelationTable};
pub use host::ExecutionHost;
pub use runner::{RunnerConfig, SupervisedTaskRunner};

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use widgeon_protocol::RequestId;

/// Errors surfaced to callers of the runner
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("call terminated by timeout")]
    TimedOut,

    #[error("widget fault: {0}")]
    Script(String),

    #[error("sandbox worker is gone")]
    WorkerGone,

    #[error("reply with unrecognized request id {0}")]
    UnrecognizedReply(RequestId),
}

pub(crate) trait MutexExt<T> {
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("engine lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
