//! Offgrid session core: proximity connection lifecycle and in-band control protocol.
//! Host-driven: SessionCore does no I/O; Session drives it over a Transport adapter.

pub mod core;
pub mod dispatch;
pub mod event;
pub mod identity;
pub mod lifecycle;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod wire;

pub use crate::core::{Action, SessionCore};
pub use dispatch::{MethodCall, MethodReply};
pub use event::{ConnectionOutcome, SessionEvent};
pub use identity::{EndpointId, LocalIdentity, SessionConfig, DEFAULT_SERVICE_ID};
pub use lifecycle::ConnectionState;
pub use memory::MemoryTransport;
pub use protocol::ControlMessage;
pub use registry::{EndpointRecord, EndpointRegistry, UNKNOWN_DEVICE};
pub use session::{EventStream, Session, SessionError};
pub use transport::{
    ConnectionStatus, DiscoveryListener, EventSink, LifecycleListener, PayloadListener,
    Transport, TransportError, TransportEvent,
};
pub use wire::{decode_payload, encode_payload};
