//! Sandbox worker loop
//!
//! Runs on a dedicated OS thread since the QuickJS context is not `Send`.
//! The host feeds [`HostMessage`]s through a blocking channel; replies and
//! widget-initiated actions flow back through an unbounded channel the host
//! drains from async code.
//!
//! While a widget call is blocked on a host round-trip, the worker keeps
//! pumping its inbox: resolutions are routed to the round-trip broker and
//! any other message is deferred until the current call finishes. The host
//! never issues a second execute before the first one resolves, so deferral
//! only reorders resolutions against calls, never calls against calls.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::{Context, Ctx, Runtime};
use tokio::sync::mpsc::UnboundedSender;

use widgeon_protocol::{now_ms, GuestMessage, HostMessage};

use crate::bindings::{self, BindingContext};
use crate::broker::RoundTripBroker;
use crate::convert;
use crate::linkset::{self, FunctionLinkSet};
use crate::tick::{MessageLog, TickWindow};
use crate::{CancellationToken, SandboxConfig, SandboxError};

/// Worker inbox with a deferral queue for messages that arrive while a
/// call is blocked on a round-trip
pub(crate) struct Mailbox {
    rx: Receiver<HostMessage>,
    deferred: VecDeque<HostMessage>,
}

impl Mailbox {
    pub(crate) fn new(rx: Receiver<HostMessage>) -> Self {
        Self {
            rx,
            deferred: VecDeque::new(),
        }
    }

    /// Next message, deferred ones first. `None` means the host hung up.
    fn next(&mut self) -> Option<HostMessage> {
        if let Some(message) = self.deferred.pop_front() {
            return Some(message);
        }
        self.rx.recv().ok()
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<HostMessage, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    fn defer(&mut self, message: HostMessage) {
        self.deferred.push_back(message);
    }
}

/// Pump the inbox until `waiter` resolves or `timeout` passes. Non-resolution
/// messages are deferred for the main loop.
pub(crate) fn await_resolution<T>(
    mailbox: &Rc<RefCell<Mailbox>>,
    broker: &Rc<RefCell<RoundTripBroker>>,
    waiter: &Receiver<T>,
    timeout: Duration,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(value) = waiter.try_recv() {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let slice = (deadline - now).min(Duration::from_millis(25));
        let received = mailbox.borrow_mut().recv_timeout(slice);
        match received {
            Ok(message) => {
                let leftover = broker.borrow_mut().resolve(message);
                if let Some(other) = leftover {
                    mailbox.borrow_mut().defer(other);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return waiter.try_recv().ok(),
        }
    }
}

/// Run the worker until cancellation or host disconnect. Entry point for
/// the host's worker thread.
pub fn run(
    config: SandboxConfig,
    log: MessageLog,
    inbox: Receiver<HostMessage>,
    outbox: UnboundedSender<GuestMessage>,
    cancel: CancellationToken,
) {
    match serve(config, log, inbox, outbox, cancel) {
        Ok(()) | Err(SandboxError::Cancelled) | Err(SandboxError::HostDisconnected) => {
            tracing::debug!("sandbox worker stopped");
        }
        Err(err) => tracing::error!(%err, "sandbox worker failed"),
    }
}

fn serve(
    config: SandboxConfig,
    log: MessageLog,
    inbox: Receiver<HostMessage>,
    outbox: UnboundedSender<GuestMessage>,
    cancel: CancellationToken,
) -> Result<(), SandboxError> {
    let runtime = Runtime::new().map_err(|e| SandboxError::Init(e.to_string()))?;
    runtime.set_memory_limit(config.memory_limit);

    // The interrupt handler aborts JS on cancellation or when the current
    // call overruns its hard deadline, expressed in ms since worker start.
    // A zero deadline means no call is running.
    let started = Instant::now();
    let deadline = Arc::new(AtomicU64::new(0));
    {
        let cancel_flag = cancel.flag();
        let deadline = deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return true;
            }
            let limit = deadline.load(Ordering::SeqCst);
            limit != 0 && started.elapsed().as_millis() as u64 > limit
        })));
    }

    let context = Context::full(&runtime).map_err(|e| SandboxError::Init(e.to_string()))?;

    let mailbox = Rc::new(RefCell::new(Mailbox::new(inbox)));
    let broker = Rc::new(RefCell::new(RoundTripBroker::new()));
    let window = Rc::new(RefCell::new(TickWindow::new(now_ms())));
    let binding = BindingContext {
        outbox: outbox.clone(),
        mailbox: mailbox.clone(),
        broker: broker.clone(),
        window: window.clone(),
        log,
        round_trip_timeout: Duration::from_millis(config.round_trip_timeout_ms),
    };

    let mut links = FunctionLinkSet::new();
    context.with(|ctx| -> Result<(), SandboxError> {
        let env = bindings::install(&ctx, &binding)?;
        links.add_dependency("session", env.session)?;
        links.add_dependency("chat", env.chat)?;
        links.add_dependency("host", env.host)?;
        links.add_dependency("messages", env.messages)?;
        Ok(())
    })?;

    loop {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        let message = {
            let mut mailbox = mailbox.borrow_mut();
            mailbox.next()
        };
        let Some(message) = message else {
            return Err(SandboxError::HostDisconnected);
        };

        match message {
            HostMessage::Upload {
                request_id,
                function,
            } => {
                let accepted = links
                    .add(
                        function.is_async,
                        function.name,
                        function.parameters,
                        function.source_code,
                    )
                    .is_ok();
                let reply = GuestMessage::reply(request_id, serde_json::Value::Bool(accepted));
                if outbox.send(reply).is_err() {
                    return Err(SandboxError::HostDisconnected);
                }
            }
            HostMessage::Execute { request_id, args } => {
                let limit = started.elapsed().as_millis() as u64 + config.hard_timeout_ms;
                deadline.store(limit, Ordering::SeqCst);
                window.borrow_mut().enter_tick();
                let outcome = context.with(|ctx| execute_call(&ctx, &mut links, &args));
                window.borrow_mut().leave_tick(now_ms());
                deadline.store(0, Ordering::SeqCst);

                // An interrupt-induced error after cancellation is not a
                // widget fault; exit without replying.
                if cancel.is_cancelled() {
                    return Err(SandboxError::Cancelled);
                }
                let reply = match outcome {
                    Ok(value) => GuestMessage::reply(request_id, value),
                    Err(err) => GuestMessage::fault(request_id, err.to_string()),
                };
                if outbox.send(reply).is_err() {
                    return Err(SandboxError::HostDisconnected);
                }
            }
            resolution => {
                // Stale resolution; nothing is blocked on it anymore
                let _ = broker.borrow_mut().resolve(resolution);
            }
        }
    }
}

fn execute_call<'js>(
    ctx: &Ctx<'js>,
    links: &mut FunctionLinkSet,
    args: &[serde_json::Value],
) -> Result<serde_json::Value, SandboxError> {
    let Some(serde_json::Value::String(name)) = args.first() else {
        return Err(SandboxError::Js(
            "execute args must start with a function name".into(),
        ));
    };

    // First execute seals the set
    if !links.sealed() {
        links.compose(ctx)?;
    }

    let mut values = Vec::with_capacity(args.len().saturating_sub(1));
    for arg in &args[1..] {
        values.push(convert::json_to_js(ctx, arg).map_err(|e| SandboxError::Js(e.to_string()))?);
    }
    let result = links.call(ctx, name, values)?;
    let result = linkset::settle(ctx, result)?;
    let mut value = convert::js_to_json(&result);

    // The model-update entry point replies with the new model alongside the
    // input that produced it
    if name == "onUpdate" {
        let input = args.get(1).cloned().unwrap_or(serde_json::Value::Null);
        value = serde_json::json!({ "model": value, "input": input });
    }
    Ok(value)
}
