//! Chat message log and per-tick consumption window
//!
//! The log is append-only and shared between the host (producer) and the
//! sandbox worker (consumer). [`TickWindow`] tracks which messages a widget
//! has already seen so that each message is handed out at most once, even
//! when several messages share one timestamp.

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use widgeon_protocol::{ChatMessage, Timestamp};

trait RwLockExt<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| {
            tracing::warn!("message log lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| {
            tracing::warn!("message log lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Shared append-only chat message log
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Arc<RwLock<Vec<ChatMessage>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, message: ChatMessage) {
        self.entries.write_or_recover().push(message);
    }

    /// All messages with `timestamp >= since`, in insertion order
    pub fn query_since(&self, since: Timestamp) -> Vec<ChatMessage> {
        self.entries
            .read_or_recover()
            .iter()
            .filter(|m| m.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read_or_recover().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tracks which log messages the widget has consumed.
///
/// State is a high-water-mark timestamp plus the set of already-consumed
/// message ids at exactly that timestamp. A query returns messages at or
/// above the mark, minus that set; committing a non-empty result advances
/// the mark to the newest returned timestamp and replaces the set with the
/// ids seen at it. When a tick ends without any query, the mark jumps to
/// the present so idle periods are not replayed later.
#[derive(Debug)]
pub struct TickWindow {
    high_water_mark: Timestamp,
    consumed_at_mark: HashSet<String>,
    queried_this_tick: bool,
}

impl TickWindow {
    /// Start a window at `now`; messages older than creation are never seen.
    pub fn new(now: Timestamp) -> Self {
        Self {
            high_water_mark: now,
            consumed_at_mark: HashSet::new(),
            queried_this_tick: false,
        }
    }

    pub fn enter_tick(&mut self) {
        self.queried_this_tick = false;
    }

    /// End the current tick. If no query happened during it, the mark
    /// advances to `now` and the consumed set resets.
    pub fn leave_tick(&mut self, now: Timestamp) {
        if !self.queried_this_tick {
            self.high_water_mark = now;
            self.consumed_at_mark.clear();
        }
    }

    /// Candidate messages for this tick, sorted by ascending timestamp.
    ///
    /// Does not advance the window; pair with [`TickWindow::commit`] after
    /// any caller-side filtering has settled which messages were consumed.
    pub fn query(&mut self, log: &MessageLog) -> Vec<ChatMessage> {
        self.queried_this_tick = true;
        let mut rows = log.query_since(self.high_water_mark);
        rows.retain(|m| !self.consumed_at_mark.contains(&m.id));
        rows.sort_by_key(|m| m.timestamp);
        rows
    }

    /// Record consumption up to `top`, remembering `ids` as the messages
    /// already seen at exactly that timestamp.
    pub fn commit(&mut self, top: Timestamp, ids: impl IntoIterator<Item = String>) {
        self.high_water_mark = top;
        self.consumed_at_mark = ids.into_iter().collect();
    }

    /// Query and commit in one step, keeping only rows matching `filter`.
    pub fn call<F>(&mut self, log: &MessageLog, mut filter: F) -> Vec<ChatMessage>
    where
        F: FnMut(&ChatMessage) -> bool,
    {
        let mut rows = self.query(log);
        rows.retain(|m| filter(m));
        if let Some(top) = rows.last().map(|m| m.timestamp) {
            let ids: Vec<String> = rows
                .iter()
                .filter(|m| m.timestamp == top)
                .map(|m| m.id.clone())
                .collect();
            self.commit(top, ids);
        }
        rows
    }

    pub fn high_water_mark(&self) -> Timestamp {
        self.high_water_mark
    }
}
