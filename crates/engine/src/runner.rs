//! Supervised widget call execution
//!
//! The runner serializes calls to one sandbox worker and enforces a
//! deadline on every execute. A deadline miss is treated as a wedged
//! worker: every in-flight call fails, the worker is cancelled and
//! abandoned, and a fresh one takes its place. Request ids are never
//! reused, so stragglers from the abandoned worker resolve nothing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use widgeon_protocol::{
    ActionRequest, AudioId, CallOutcome, FunctionSpec, GuestMessage, HostMessage, RequestId,
    Screenshot, ViewerRelationship,
};
use widgeon_sandbox::{MessageLog, SandboxConfig};

use crate::correlate::{CallKind, CorrelationTable};
use crate::host::ExecutionHost;
use crate::{EngineError, MutexExt};

/// Configuration for the runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Deadline for a single execute call
    pub execute_timeout: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            execute_timeout: Duration::from_millis(1000),
            sandbox: SandboxConfig::default(),
        }
    }
}

struct RunnerInner {
    config: RunnerConfig,
    log: MessageLog,
    table: CorrelationTable,
    host: Mutex<ExecutionHost>,
    subscribers: Mutex<Vec<UnboundedSender<ActionRequest>>>,
    /// Bumped on every worker replacement; the pump of an abandoned worker
    /// notices and stops forwarding
    generation: AtomicU64,
    terminated: AtomicBool,
}

/// Cheaply cloneable handle to one supervised worker.
///
/// Must be created inside a tokio runtime; the reply pump runs as a task.
#[derive(Clone)]
pub struct SupervisedTaskRunner {
    inner: Arc<RunnerInner>,
}

impl SupervisedTaskRunner {
    pub fn new(config: RunnerConfig, log: MessageLog) -> Self {
        let (host, receiver) = ExecutionHost::start(config.sandbox.clone(), log.clone());
        let inner = Arc::new(RunnerInner {
            config,
            log,
            table: CorrelationTable::new(),
            host: Mutex::new(host),
            subscribers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
        });
        spawn_pump(inner.clone(), receiver, 0);
        Self { inner }
    }

    /// Stage a widget function. Resolves to whether the worker accepted it;
    /// a sealed worker rejects with `false`. No deadline applies, but a
    /// worker replacement triggered by a concurrent execute fails this too.
    pub async fn upload(&self, function: FunctionSpec) -> Result<bool, EngineError> {
        let (request_id, receiver) = self.inner.table.register(CallKind::Upload);
        self.send_or_discard(
            HostMessage::Upload {
                request_id,
                function,
            },
            request_id,
        )?;
        match receiver.await {
            Ok(Ok(CallOutcome::Return { value })) => Ok(value.as_bool().unwrap_or(false)),
            Ok(Ok(CallOutcome::Fault { message })) => Err(EngineError::Script(message)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(EngineError::WorkerGone),
        }
    }

    /// Call an uploaded function with the default deadline
    pub async fn execute(
        &self,
        function: &str,
        values: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, EngineError> {
        self.execute_with_timeout(function, values, self.inner.config.execute_timeout)
            .await
    }

    /// Call an uploaded function. On deadline the worker is replaced and
    /// every in-flight call fails with [`EngineError::TimedOut`].
    pub async fn execute_with_timeout(
        &self,
        function: &str,
        values: Vec<serde_json::Value>,
        deadline: Duration,
    ) -> Result<serde_json::Value, EngineError> {
        let (request_id, receiver) = self.inner.table.register(CallKind::Execute);
        let mut args = Vec::with_capacity(values.len() + 1);
        args.push(serde_json::Value::String(function.to_string()));
        args.extend(values);
        self.send_or_discard(HostMessage::Execute { request_id, args }, request_id)?;

        match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(Ok(CallOutcome::Return { value }))) => Ok(value),
            Ok(Ok(Ok(CallOutcome::Fault { message }))) => Err(EngineError::Script(message)),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(EngineError::WorkerGone),
            Err(_) => {
                self.replace_worker();
                Err(EngineError::TimedOut)
            }
        }
    }

    /// Stream of widget-initiated actions. Every subscriber sees every
    /// action; round-trip actions must be answered through the matching
    /// `resolve_*` method or the widget blocks until its internal timeout.
    pub fn subscribe_actions(&self) -> UnboundedReceiver<ActionRequest> {
        let (tx, rx) = unbounded_channel();
        self.inner.subscribers.lock_or_recover().push(tx);
        rx
    }

    pub fn resolve_screenshot(&self, screenshot: Screenshot) {
        let _ = self.send(HostMessage::CaptureScreenshot { screenshot });
    }

    pub fn resolve_relationship(
        &self,
        viewer: String,
        channel: String,
        relationship: Option<ViewerRelationship>,
    ) {
        let _ = self.send(HostMessage::Relationship {
            viewer,
            channel,
            relationship,
        });
    }

    pub fn resolve_audio(&self, request_id: AudioId, success: bool) {
        let _ = self.send(HostMessage::PlayAudio {
            request_id,
            success,
        });
    }

    /// The shared chat log the worker reads from
    pub fn message_log(&self) -> &MessageLog {
        &self.inner.log
    }

    /// Cancel the worker and fail everything in flight. The runner is dead
    /// afterwards; later calls report [`EngineError::WorkerGone`].
    pub fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        self.inner.table.fail_all();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.host.lock_or_recover().shutdown();
    }

    fn send(&self, message: HostMessage) -> Result<(), EngineError> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(EngineError::WorkerGone);
        }
        self.inner.host.lock_or_recover().send(message)
    }

    fn send_or_discard(&self, message: HostMessage, id: RequestId) -> Result<(), EngineError> {
        if let Err(err) = self.send(message) {
            self.inner.table.discard(id);
            return Err(err);
        }
        Ok(())
    }

    fn replace_worker(&self) {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return;
        }
        self.inner.table.fail_all();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (fresh, receiver) =
            ExecutionHost::start(self.inner.config.sandbox.clone(), self.inner.log.clone());
        {
            let mut host = self.inner.host.lock_or_recover();
            host.shutdown();
            *host = fresh;
        }
        spawn_pump(self.inner.clone(), receiver, generation);
        tracing::warn!(generation, "sandbox worker replaced after timeout");
    }
}

/// Forward one worker's messages: replies to the correlation table, actions
/// to subscribers. Stops when the worker's generation is superseded.
fn spawn_pump(
    inner: Arc<RunnerInner>,
    mut receiver: UnboundedReceiver<GuestMessage>,
    generation: u64,
) {
    tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            if inner.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!(generation, "discarding message from replaced worker");
                continue;
            }
            match message {
                GuestMessage::Reply { request_id, result } => {
                    if let Err(err) = inner.table.resolve(request_id, result) {
                        tracing::error!(%err, "dropping unrecognized reply");
                    }
                }
                GuestMessage::Action { action } => {
                    inner
                        .subscribers
                        .lock_or_recover()
                        .retain(|subscriber| subscriber.send(action.clone()).is_ok());
                }
            }
        }
        tracing::debug!(generation, "worker message pump stopped");
    });
}
