//! Common types used across host and guest messages

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation id for host-issued calls (upload/execute).
///
/// Allocated from a strictly incrementing counter owned by the host, never
/// reused within a host lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id for audio playback round-trips.
///
/// Minted by the guest from its own incrementing counter; independent of
/// [`RequestId`] numbering since multiple concurrent playbacks must not be
/// conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioId(pub u64);

impl std::fmt::Display for AudioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a widget instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WidgetId(pub Uuid);

impl WidgetId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WidgetId {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`]
#[must_use]
pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One chat message record in the append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub room_display_name: String,
    pub user_id: String,
    pub display_name: String,
    pub text: String,
    pub subscriber: bool,
    pub moderator: bool,
    pub vip: bool,
    pub turbo: bool,
    pub returning: bool,
    pub first_message: bool,
    /// `title:discriminator` pairs
    pub badges: Vec<String>,
    pub color: String,
    pub timestamp: Timestamp,
}

/// A captured video frame.
///
/// The default value (zero dimensions, no bytes) is the empty discard result
/// used when a capture request is pre-empted or cannot be served.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub image: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Subscription details within a viewer/channel relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub is_gift: bool,
    pub purchased_with_prime: bool,
    pub tier: String,
}

/// Social relationship between a viewer and a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRelationship {
    /// When the viewer followed the channel, if ever
    pub followed_at: Option<Timestamp>,
    pub total_subscribed_months: u32,
    pub subscription_days_remaining: u32,
    pub subscription: Option<SubscriptionInfo>,
}

/// An independently-submitted function body, as uploaded by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    #[serde(rename = "async")]
    pub is_async: bool,
    pub name: String,
    pub parameters: Vec<String>,
    pub source_code: String,
}

impl FunctionSpec {
    #[must_use]
    pub fn sync(name: impl Into<String>, parameters: Vec<String>, source: impl Into<String>) -> Self {
        Self {
            is_async: false,
            name: name.into(),
            parameters,
            source_code: source.into(),
        }
    }

    #[must_use]
    pub fn asynchronous(
        name: impl Into<String>,
        parameters: Vec<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            is_async: true,
            name: name.into(),
            parameters,
            source_code: source.into(),
        }
    }
}
