//! Correlation of blocking host round-trips
//!
//! While a widget call is blocked inside `host.captureScreenshot`,
//! `host.relationship` or `host.playAudio`, the worker keeps draining its
//! inbox. Resolutions that arrive during the wait are routed here to the
//! channel the blocked binding is parked on; anything else is deferred.
//!
//! Each round-trip kind has its own correlation scheme:
//!
//! - screenshot: a single slot, a newer request pre-empts the older one
//! - relationship: keyed by the (viewer, channel) request payload
//! - audio: keyed by a guest-minted incrementing [`AudioId`]

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};

use widgeon_protocol::{AudioId, HostMessage, Screenshot, ViewerRelationship};

#[derive(Debug, Default)]
pub struct RoundTripBroker {
    screenshot: Option<Sender<Screenshot>>,
    relationships: HashMap<(String, String), Sender<Option<ViewerRelationship>>>,
    audio: HashMap<AudioId, Sender<bool>>,
    next_audio_id: u64,
}

impl RoundTripBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a screenshot request. A previously parked request is resolved
    /// with the empty discard frame; its resolution, if it ever arrives,
    /// goes to the new waiter instead.
    pub fn begin_screenshot(&mut self) -> Receiver<Screenshot> {
        let (tx, rx) = channel();
        if let Some(stale) = self.screenshot.replace(tx) {
            let _ = stale.send(Screenshot::default());
        }
        rx
    }

    /// Park a relationship lookup keyed by its request payload
    pub fn begin_relationship(
        &mut self,
        viewer: String,
        channel_name: String,
    ) -> Receiver<Option<ViewerRelationship>> {
        let (tx, rx) = channel();
        self.relationships.insert((viewer, channel_name), tx);
        rx
    }

    /// Park an audio playback, minting a fresh correlation id for it
    pub fn begin_audio(&mut self) -> (AudioId, Receiver<bool>) {
        let id = AudioId(self.next_audio_id);
        self.next_audio_id += 1;
        let (tx, rx) = channel();
        self.audio.insert(id, tx);
        (id, rx)
    }

    /// Route a resolution to its waiter. Returns the message back when it
    /// is not a round-trip resolution so the caller can defer it; stale
    /// resolutions with no waiter are dropped.
    pub fn resolve(&mut self, message: HostMessage) -> Option<HostMessage> {
        match message {
            HostMessage::CaptureScreenshot { screenshot } => {
                if let Some(waiter) = self.screenshot.take() {
                    let _ = waiter.send(screenshot);
                } else {
                    tracing::debug!("dropping screenshot with no waiter");
                }
                None
            }
            HostMessage::Relationship {
                viewer,
                channel,
                relationship,
            } => {
                if let Some(waiter) = self.relationships.remove(&(viewer.clone(), channel.clone()))
                {
                    let _ = waiter.send(relationship);
                } else {
                    tracing::debug!(%viewer, %channel, "dropping relationship with no waiter");
                }
                None
            }
            HostMessage::PlayAudio {
                request_id,
                success,
            } => {
                if let Some(waiter) = self.audio.remove(&request_id) {
                    let _ = waiter.send(success);
                } else {
                    tracing::debug!(%request_id, "dropping audio result with no waiter");
                }
                None
            }
            other => Some(other),
        }
    }
}
