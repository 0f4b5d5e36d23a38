//! Transport adapter seam: the proximity transport capability the session drives, the three
//! callback interfaces it reports through, and the typed event those callbacks become.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::identity::EndpointId;

/// Status code for a successful connection (Nearby Connections numbering).
pub const STATUS_OK: i32 = 0;
/// Generic error status code.
pub const STATUS_ERROR: i32 = 13;
/// Status code for a connection the remote side rejected.
pub const STATUS_CONNECTION_REJECTED: i32 = 8004;

/// Outcome the transport reports for an initiated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Ok,
    Rejected,
    /// Any other non-OK status, with the transport's code.
    Error(i32),
}

impl ConnectionStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            STATUS_OK => ConnectionStatus::Ok,
            STATUS_CONNECTION_REJECTED => ConnectionStatus::Rejected,
            other => ConnectionStatus::Error(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ConnectionStatus::Ok => STATUS_OK,
            ConnectionStatus::Rejected => STATUS_CONNECTION_REJECTED,
            ConnectionStatus::Error(code) => code,
        }
    }
}

/// Error reported by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {0} is not connected")]
    NotConnected(EndpointId),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("already {0}")]
    AlreadyActive(&'static str),
    #[error("transport i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Discovery callbacks. Called from any thread.
pub trait DiscoveryListener: Send + Sync {
    fn on_endpoint_found(&self, endpoint_id: EndpointId, name: String);
    fn on_endpoint_lost(&self, endpoint_id: EndpointId);
}

/// Connection lifecycle callbacks. Called from any thread.
pub trait LifecycleListener: Send + Sync {
    /// A connection is pending on either side; `name` is the remote endpoint's name.
    fn on_connection_initiated(&self, endpoint_id: EndpointId, name: String);
    fn on_connection_result(&self, endpoint_id: EndpointId, status: ConnectionStatus);
    fn on_disconnected(&self, endpoint_id: EndpointId);
}

/// Payload callbacks for an accepted connection. Called from any thread.
pub trait PayloadListener: Send + Sync {
    fn on_payload_received(&self, endpoint_id: EndpointId, bytes: Vec<u8>);
}

/// Proximity transport capability (advertise, discover, connect, send bytes).
///
/// Every method completes once the transport has accepted the request; the outcome of
/// network-dependent work arrives later through the listeners.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Broadcast presence as `local_name`. Incoming connections report through `lifecycle`.
    async fn advertise(
        &self,
        service_id: &str,
        local_name: &str,
        lifecycle: Arc<dyn LifecycleListener>,
    ) -> Result<(), TransportError>;

    /// Scan for advertisers of `service_id`.
    async fn discover(
        &self,
        service_id: &str,
        discovery: Arc<dyn DiscoveryListener>,
    ) -> Result<(), TransportError>;

    async fn request_connection(
        &self,
        local_name: &str,
        endpoint_id: &EndpointId,
        lifecycle: Arc<dyn LifecycleListener>,
    ) -> Result<(), TransportError>;

    async fn accept_connection(
        &self,
        endpoint_id: &EndpointId,
        payload: Arc<dyn PayloadListener>,
    ) -> Result<(), TransportError>;

    /// Queue `bytes` as one payload to a connected endpoint.
    async fn send_bytes(&self, endpoint_id: &EndpointId, bytes: Vec<u8>)
        -> Result<(), TransportError>;

    async fn stop_discovery(&self);

    async fn stop_advertising(&self);

    /// Stop advertising and discovery and drop every connection.
    async fn stop_all(&self);
}

/// Typed form of every transport callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    EndpointFound {
        endpoint_id: EndpointId,
        name: String,
    },
    EndpointLost {
        endpoint_id: EndpointId,
    },
    ConnectionInitiated {
        endpoint_id: EndpointId,
        name: String,
    },
    ConnectionResult {
        endpoint_id: EndpointId,
        status: ConnectionStatus,
    },
    Disconnected {
        endpoint_id: EndpointId,
    },
    BytesReceived {
        endpoint_id: EndpointId,
        bytes: Vec<u8>,
    },
}

impl TransportEvent {
    pub fn endpoint_id(&self) -> &EndpointId {
        match self {
            TransportEvent::EndpointFound { endpoint_id, .. }
            | TransportEvent::EndpointLost { endpoint_id }
            | TransportEvent::ConnectionInitiated { endpoint_id, .. }
            | TransportEvent::ConnectionResult { endpoint_id, .. }
            | TransportEvent::Disconnected { endpoint_id }
            | TransportEvent::BytesReceived { endpoint_id, .. } => endpoint_id,
        }
    }
}

/// Implements all three listeners by queueing a [`TransportEvent`]. Never blocks.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx }
    }

    pub fn push(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("session closed; dropping transport event");
        }
    }
}

impl DiscoveryListener for EventSink {
    fn on_endpoint_found(&self, endpoint_id: EndpointId, name: String) {
        self.push(TransportEvent::EndpointFound { endpoint_id, name });
    }

    fn on_endpoint_lost(&self, endpoint_id: EndpointId) {
        self.push(TransportEvent::EndpointLost { endpoint_id });
    }
}

impl LifecycleListener for EventSink {
    fn on_connection_initiated(&self, endpoint_id: EndpointId, name: String) {
        self.push(TransportEvent::ConnectionInitiated { endpoint_id, name });
    }

    fn on_connection_result(&self, endpoint_id: EndpointId, status: ConnectionStatus) {
        self.push(TransportEvent::ConnectionResult {
            endpoint_id,
            status,
        });
    }

    fn on_disconnected(&self, endpoint_id: EndpointId) {
        self.push(TransportEvent::Disconnected { endpoint_id });
    }
}

impl PayloadListener for EventSink {
    fn on_payload_received(&self, endpoint_id: EndpointId, bytes: Vec<u8>) {
        self.push(TransportEvent::BytesReceived { endpoint_id, bytes });
    }
}
