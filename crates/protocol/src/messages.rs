//! Host ↔ guest message vocabulary
//!
//! Host→guest messages are either correlated calls (`upload`, `execute`) or
//! resolutions for round-trip requests the guest is blocked on. Guest→host
//! messages are either correlated replies or unsolicited action requests
//! that carry no request id.

use serde::{Deserialize, Serialize};

use crate::{AudioId, FunctionSpec, RequestId, Screenshot, ViewerRelationship};

/// Messages sent from the host into the sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    /// Upload a function body for compilation
    #[serde(rename_all = "camelCase")]
    Upload {
        request_id: RequestId,
        #[serde(flatten)]
        function: FunctionSpec,
    },

    /// Invoke an uploaded function. `args[0]` is the function name, the
    /// remaining elements are its argument values.
    #[serde(rename_all = "camelCase")]
    Execute {
        request_id: RequestId,
        args: Vec<serde_json::Value>,
    },

    /// Resolution for the single outstanding screenshot request
    CaptureScreenshot { screenshot: Screenshot },

    /// Resolution for a relationship lookup, correlated by (viewer, channel)
    Relationship {
        viewer: String,
        channel: String,
        relationship: Option<ViewerRelationship>,
    },

    /// Resolution for an audio playback, correlated by the guest-minted id
    #[serde(rename_all = "camelCase")]
    PlayAudio { request_id: AudioId, success: bool },
}

/// Messages sent from the sandbox back to the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuestMessage {
    /// Correlated reply to an upload or execute call
    #[serde(rename_all = "camelCase")]
    Reply {
        request_id: RequestId,
        #[serde(flatten)]
        result: CallOutcome,
    },

    /// Unsolicited host-bound request; carries no request id
    Action {
        #[serde(flatten)]
        action: ActionRequest,
    },
}

impl GuestMessage {
    #[must_use]
    pub fn reply(request_id: RequestId, value: serde_json::Value) -> Self {
        Self::Reply {
            request_id,
            result: CallOutcome::Return { value },
        }
    }

    #[must_use]
    pub fn fault(request_id: RequestId, message: impl Into<String>) -> Self {
        Self::Reply {
            request_id,
            result: CallOutcome::Fault {
                message: message.into(),
            },
        }
    }
}

/// Result payload of an upload/execute reply.
///
/// Script runtime faults travel as an error payload here rather than
/// crashing the worker; only the supervising host distinguishes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallOutcome {
    #[serde(rename_all = "camelCase")]
    Fault { message: String },
    #[serde(rename_all = "camelCase")]
    Return {
        #[serde(rename = "return")]
        value: serde_json::Value,
    },
}

/// Host-bound requests emitted mid-execution by the sandboxed code.
///
/// `SendMessage`, `DeleteMessage` and `BanUser` are fire-and-forget; the
/// rest are round-trips the guest blocks on until a matching [`HostMessage`]
/// resolution arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ActionRequest {
    SendMessage { text: String },
    #[serde(rename_all = "camelCase")]
    DeleteMessage { message_id: String },
    #[serde(rename_all = "camelCase")]
    BanUser {
        login: String,
        expires_in: String,
        reason: String,
    },
    CaptureScreenshot { format: String },
    Relationship { viewer: String, channel: String },
    #[serde(rename_all = "camelCase")]
    PlayAudio { request_id: AudioId, url: String },
}
