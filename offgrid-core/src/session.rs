//! Session facade: the public operation surface over a transport adapter.
//!
//! Transport callbacks are queued by an [`EventSink`] and drained by one pump task, which applies
//! them to the [`SessionCore`] under the session lock and executes the resulting actions. Facade
//! operations that change lifecycle state take the same lock, so every transition is serialized
//! and each endpoint's events reach the consumer in order.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::core::{Action, SessionCore};
use crate::event::SessionEvent;
use crate::identity::{EndpointId, LocalIdentity, SessionConfig};
use crate::lifecycle::ConnectionState;
use crate::protocol::ControlMessage;
use crate::registry::EndpointRegistry;
use crate::transport::{
    ConnectionStatus, EventSink, Transport, TransportError, TransportEvent, STATUS_ERROR,
};
use crate::wire;

/// Error returned by a facade operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A required identifier or text argument was absent.
    #[error("missing argument: {0}")]
    ArgumentMissing(&'static str),
    /// The transport refused the operation. Not retried.
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
    /// The dispatcher does not know this method.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("username cannot change while advertising, discovering or connected")]
    IdentityLocked,
}

impl SessionError {
    /// Short machine-readable code, as reported over the method channel.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::ArgumentMissing(_) => "ARG_ERROR",
            SessionError::TransportFailure(_) => "TRANSPORT_ERROR",
            SessionError::UnknownOperation(_) => "NOT_IMPLEMENTED",
            SessionError::IdentityLocked => "IDENTITY_LOCKED",
        }
    }
}

struct SessionState {
    core: SessionCore,
    identity: LocalIdentity,
}

struct Inner {
    transport: Arc<dyn Transport>,
    service_id: String,
    sink: Arc<EventSink>,
    state: Mutex<SessionState>,
    registry: Arc<EndpointRegistry>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Ordered stream of [`SessionEvent`]s. Drain it from whatever task or thread suits the consumer.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive for consumers outside the async runtime.
    pub fn blocking_next(&mut self) -> Option<SessionEvent> {
        self.rx.blocking_recv()
    }
}

/// One proximity chat session over a transport. Must be created inside a tokio runtime.
pub struct Session {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl Session {
    pub fn new<T: Transport>(transport: Arc<T>, config: SessionConfig) -> (Session, EventStream) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(EndpointRegistry::new());
        let inner = Arc::new(Inner {
            transport,
            service_id: config.service_id,
            sink: Arc::new(EventSink::new(transport_tx)),
            state: Mutex::new(SessionState {
                core: SessionCore::with_registry(registry.clone()),
                identity: config.identity,
            }),
            registry,
            events: events_tx,
        });
        let pump = tokio::spawn(run_pump(transport_rx, inner.clone()));
        (Session { inner, pump }, EventStream { rx: events_rx })
    }

    /// Listener handle to inject transport events directly (for adapters that push events
    /// rather than call the listeners handed to them).
    pub fn event_sink(&self) -> Arc<EventSink> {
        self.inner.sink.clone()
    }

    pub fn registry(&self) -> Arc<EndpointRegistry> {
        self.inner.registry.clone()
    }

    pub fn service_id(&self) -> &str {
        &self.inner.service_id
    }

    pub async fn identity(&self) -> LocalIdentity {
        self.inner.state.lock().await.identity.clone()
    }

    pub async fn state(&self, endpoint_id: &EndpointId) -> ConnectionState {
        self.inner.state.lock().await.core.state(endpoint_id)
    }

    pub async fn connected_endpoints(&self) -> Vec<EndpointId> {
        self.inner.state.lock().await.core.connected_endpoints()
    }

    pub async fn is_discovering(&self) -> bool {
        self.inner.state.lock().await.core.is_discovering()
    }

    pub async fn is_advertising(&self) -> bool {
        self.inner.state.lock().await.core.is_advertising()
    }

    /// Change the username. Only allowed while nothing is advertising, discovering or connected.
    pub async fn rename(&self, username: &str) -> Result<(), SessionError> {
        let mut st = self.inner.state.lock().await;
        set_username(&mut st, Some(username))
    }

    /// Start scanning for advertisers. `username` (if given) becomes the session name.
    pub async fn start_discovery(&self, username: Option<&str>) -> Result<(), SessionError> {
        let mut st = self.inner.state.lock().await;
        set_username(&mut st, username)?;
        if !st.core.begin_discovery() {
            tracing::debug!("discovery already running");
            return Ok(());
        }
        let sink = self.inner.sink.clone();
        if let Err(e) = self
            .inner
            .transport
            .discover(&self.inner.service_id, sink)
            .await
        {
            st.core.discovery_failed();
            tracing::warn!(error = %e, "discovery failed to start");
            return Err(e.into());
        }
        tracing::info!(service = %self.inner.service_id, username = %st.identity.username(), "discovery started");
        Ok(())
    }

    /// Start advertising presence. `username` (if given) becomes the session name.
    pub async fn start_advertising(&self, username: Option<&str>) -> Result<(), SessionError> {
        let mut st = self.inner.state.lock().await;
        set_username(&mut st, username)?;
        if !st.core.begin_advertising() {
            tracing::debug!("advertising already running");
            return Ok(());
        }
        let sink = self.inner.sink.clone();
        let name = st.identity.username().to_owned();
        if let Err(e) = self
            .inner
            .transport
            .advertise(&self.inner.service_id, &name, sink)
            .await
        {
            st.core.advertising_failed();
            tracing::warn!(error = %e, "advertising failed to start");
            return Err(e.into());
        }
        tracing::info!(service = %self.inner.service_id, username = %name, "advertising started");
        Ok(())
    }

    /// Request a connection to a discovered endpoint. A no-op if one is already pending or up.
    pub async fn connect(&self, endpoint_id: &EndpointId) -> Result<(), SessionError> {
        if endpoint_id.is_empty() {
            return Err(SessionError::ArgumentMissing("endpointId"));
        }
        let mut st = self.inner.state.lock().await;
        let Some(previous) = st.core.begin_connect(endpoint_id) else {
            tracing::debug!(endpoint = %endpoint_id, "connection already pending or up");
            return Ok(());
        };
        let name = st.identity.username().to_owned();
        let sink = self.inner.sink.clone();
        if let Err(e) = self
            .inner
            .transport
            .request_connection(&name, endpoint_id, sink)
            .await
        {
            st.core.connect_failed(endpoint_id, previous);
            tracing::warn!(endpoint = %endpoint_id, error = %e, "connection request failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Send chat text.
    pub async fn send(&self, endpoint_id: &EndpointId, text: &str) -> Result<(), SessionError> {
        self.send_message(endpoint_id, &ControlMessage::chat(text))
            .await
    }

    /// Send a typing-start or typing-stop signal.
    pub async fn send_typing(
        &self,
        endpoint_id: &EndpointId,
        is_typing: bool,
    ) -> Result<(), SessionError> {
        self.send_message(endpoint_id, &ControlMessage::typing(is_typing))
            .await
    }

    /// Tell the peer that `message_id` has been read.
    pub async fn send_read_receipt(
        &self,
        endpoint_id: &EndpointId,
        message_id: &str,
    ) -> Result<(), SessionError> {
        if message_id.is_empty() {
            return Err(SessionError::ArgumentMissing("messageId"));
        }
        self.send_message(endpoint_id, &ControlMessage::read_receipt(message_id))
            .await
    }

    /// Encode and hand one control message to the transport. Fire-and-forget; not retried.
    pub async fn send_message(
        &self,
        endpoint_id: &EndpointId,
        msg: &ControlMessage,
    ) -> Result<(), SessionError> {
        if endpoint_id.is_empty() {
            return Err(SessionError::ArgumentMissing("endpointId"));
        }
        let bytes = wire::encode_payload(msg);
        self.inner
            .transport
            .send_bytes(endpoint_id, bytes)
            .await
            .map_err(|e| {
                tracing::debug!(endpoint = %endpoint_id, error = %e, "send failed");
                SessionError::from(e)
            })
    }

    /// Stop advertising, discovery and every connection. Safe from any state.
    pub async fn stop_all(&self) -> Result<(), SessionError> {
        let mut st = self.inner.state.lock().await;
        self.inner.transport.stop_all().await;
        let actions = st.core.stop_all();
        self.inner.execute(&mut st.core, actions).await;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn set_username(st: &mut SessionState, username: Option<&str>) -> Result<(), SessionError> {
    let Some(name) = username else {
        return Ok(());
    };
    if name.is_empty() {
        return Err(SessionError::ArgumentMissing("username"));
    }
    if name == st.identity.username() {
        return Ok(());
    }
    if st.core.is_active() {
        return Err(SessionError::IdentityLocked);
    }
    st.identity = LocalIdentity::new(name);
    Ok(())
}

async fn run_pump(mut rx: mpsc::UnboundedReceiver<TransportEvent>, inner: Arc<Inner>) {
    while let Some(event) = rx.recv().await {
        let mut st = inner.state.lock().await;
        let actions = st.core.on_transport_event(event);
        inner.execute(&mut st.core, actions).await;
    }
}

impl Inner {
    /// Execute actions in order. Called with the session lock held.
    async fn execute(&self, core: &mut SessionCore, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::AcceptConnection(id) => {
                    let sink = self.sink.clone();
                    if let Err(e) = self.transport.accept_connection(&id, sink).await {
                        tracing::warn!(endpoint = %id, error = %e, "accept failed");
                        queue.extend(core.on_transport_event(TransportEvent::ConnectionResult {
                            endpoint_id: id,
                            status: ConnectionStatus::Error(STATUS_ERROR),
                        }));
                    }
                }
                Action::StopDiscovery => self.transport.stop_discovery().await,
                Action::StopAdvertising => self.transport.stop_advertising().await,
                Action::Emit(event) => {
                    if self.events.send(event).is_err() {
                        tracing::debug!("event stream dropped; event discarded");
                    }
                }
            }
        }
    }
}
