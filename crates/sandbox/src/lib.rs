//! Widgeon Sandbox
//!
//! QuickJS worker that compiles and runs widget functions with a
//! capability-limited host API.
//!
//! ## Widget API
//!
//! Widget functions have access to the following globals:
//!
//! - `chat.sendMessage(text)` - Post a chat message
//! - `chat.deleteMessage(messageId)` - Remove a chat message
//! - `chat.banUser(login, expiresIn, reason)` - Time out or ban a viewer
//! - `host.captureScreenshot(format)` - Capture the current video frame
//! - `host.relationship(viewer, channel)` - Look up a viewer/channel relationship
//! - `host.playAudio(url)` - Play an audio clip, resolves to success
//! - `messages.sinceLastTick(filter)` - Chat messages since the last tick
//! - `session` - Autovivified scratch object shared across calls
//!
//! The worker runs on a dedicated OS thread and communicates with the host
//! through channels; see [`worker::run`].

mod bindings;
mod broker;
mod convert;
mod linkset;
mod tick;
pub mod worker;

pub use broker::RoundTripBroker;
pub use linkset::FunctionLinkSet;
pub use tick::{MessageLog, TickWindow};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Errors from widget compilation and execution
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("function set was already composed")]
    AlreadySealed,

    #[error("no function named '{0}' was uploaded")]
    UnknownFunction(String),

    #[error("JavaScript error: {0}")]
    Js(String),

    #[error("runtime initialization failed: {0}")]
    Init(String),

    #[error("widget was cancelled")]
    Cancelled,

    #[error("host channel disconnected")]
    HostDisconnected,
}

/// Configuration for the sandbox worker
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory usage in bytes
    pub memory_limit: usize,
    /// Backstop on a single call's JS execution time, in milliseconds.
    /// The supervising host normally gives up long before this fires.
    pub hard_timeout_ms: u64,
    /// How long a blocking host round-trip (screenshot, relationship,
    /// audio) waits for its resolution before returning the empty result.
    pub round_trip_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024, // 64 MB
            hard_timeout_ms: 30_000,        // 30 seconds
            round_trip_timeout_ms: 10_000,  // 10 seconds
        }
    }
}

/// Thread-safe cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}
