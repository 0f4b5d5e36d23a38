//! Events emitted to the consumer of a session.
//!
//! Serialized names follow the method-channel callbacks the chat UI listens for.

use serde::{Deserialize, Serialize};

use crate::identity::EndpointId;

/// Final outcome of a connection attempt, as reported to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionOutcome {
    Connected,
    Rejected,
    Error,
}

/// One item of the session's ordered outbound event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SessionEvent {
    #[serde(rename = "onEndpointFound")]
    EndpointFound {
        #[serde(rename = "id")]
        endpoint_id: EndpointId,
        name: String,
    },
    #[serde(rename = "onEndpointLost", rename_all = "camelCase")]
    EndpointLost { endpoint_id: EndpointId },
    #[serde(rename = "onConnectionResult", rename_all = "camelCase")]
    ConnectionResult {
        endpoint_id: EndpointId,
        endpoint_name: String,
        status: ConnectionOutcome,
    },
    #[serde(rename = "onDisconnected", rename_all = "camelCase")]
    Disconnected {
        endpoint_id: EndpointId,
        endpoint_name: String,
    },
    #[serde(rename = "onPayloadReceived", rename_all = "camelCase")]
    MessageReceived {
        endpoint_id: EndpointId,
        message: String,
    },
    #[serde(rename = "onTypingStatusChanged", rename_all = "camelCase")]
    TypingChanged {
        endpoint_id: EndpointId,
        is_typing: bool,
    },
    #[serde(rename = "onMessageRead", rename_all = "camelCase")]
    ReadReceiptReceived {
        endpoint_id: EndpointId,
        message_id: String,
    },
}

impl SessionEvent {
    pub fn endpoint_id(&self) -> &EndpointId {
        match self {
            SessionEvent::EndpointFound { endpoint_id, .. }
            | SessionEvent::EndpointLost { endpoint_id }
            | SessionEvent::ConnectionResult { endpoint_id, .. }
            | SessionEvent::Disconnected { endpoint_id, .. }
            | SessionEvent::MessageReceived { endpoint_id, .. }
            | SessionEvent::TypingChanged { endpoint_id, .. }
            | SessionEvent::ReadReceiptReceived { endpoint_id, .. } => endpoint_id,
        }
    }
}
