//! Widgeon Protocol
//!
//! Defines the message types exchanged between the host and the sandboxed
//! widget worker. This crate is the source of truth for everything that
//! crosses the worker boundary.

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;
