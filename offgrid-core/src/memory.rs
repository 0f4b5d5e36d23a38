//! In-memory transport: records every call and lets the host inject transport callbacks.
//! Used by the test suite and as a loopback adapter for hosts without a radio.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::identity::EndpointId;
use crate::transport::{
    ConnectionStatus, DiscoveryListener, LifecycleListener, PayloadListener, Transport,
    TransportError,
};

/// One call made against the transport, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Advertise {
        service_id: String,
        local_name: String,
    },
    Discover {
        service_id: String,
    },
    RequestConnection {
        local_name: String,
        endpoint_id: EndpointId,
    },
    AcceptConnection {
        endpoint_id: EndpointId,
    },
    SendBytes {
        endpoint_id: EndpointId,
        bytes: Vec<u8>,
    },
    StopDiscovery,
    StopAdvertising,
    StopAll,
}

#[derive(Default)]
struct MemoryState {
    calls: Vec<TransportCall>,
    discovery: Option<Arc<dyn DiscoveryListener>>,
    lifecycle: Option<Arc<dyn LifecycleListener>>,
    payload: HashMap<EndpointId, Arc<dyn PayloadListener>>,
    connected: HashSet<EndpointId>,
    fail_next: Option<TransportError>,
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls made so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: &TransportCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// Make the next fallible call return `err`.
    pub fn fail_next(&self, err: TransportError) {
        self.lock().fail_next = Some(err);
    }

    pub fn is_connected(&self, id: &EndpointId) -> bool {
        self.lock().connected.contains(id)
    }

    fn record(&self, call: TransportCall) -> Result<(), TransportError> {
        let mut st = self.lock();
        if let Some(err) = st.fail_next.take() {
            return Err(err);
        }
        st.calls.push(call);
        Ok(())
    }

    /// Report an advertiser found by discovery. No-op unless discovering.
    pub fn find(&self, id: &str, name: &str) {
        let listener = self.lock().discovery.clone();
        if let Some(l) = listener {
            l.on_endpoint_found(id.into(), name.to_owned());
        }
    }

    /// Report a discovered advertiser as lost. No-op unless discovering.
    pub fn lose(&self, id: &str) {
        let listener = self.lock().discovery.clone();
        if let Some(l) = listener {
            l.on_endpoint_lost(id.into());
        }
    }

    /// Report a connection being initiated with `id`, named `name`.
    pub fn initiate(&self, id: &str, name: &str) {
        let listener = self.lock().lifecycle.clone();
        if let Some(l) = listener {
            l.on_connection_initiated(id.into(), name.to_owned());
        }
    }

    /// Report the connection result for `id`. An OK result opens the link for sends.
    pub fn resolve(&self, id: &str, status: ConnectionStatus) {
        let listener = {
            let mut st = self.lock();
            if status == ConnectionStatus::Ok {
                st.connected.insert(id.into());
            }
            st.lifecycle.clone()
        };
        if let Some(l) = listener {
            l.on_connection_result(id.into(), status);
        }
    }

    /// Drop the link to `id` and report the disconnect.
    pub fn disconnect(&self, id: &str) {
        let listener = {
            let mut st = self.lock();
            st.connected.remove(&EndpointId::from(id));
            st.payload.remove(&EndpointId::from(id));
            st.lifecycle.clone()
        };
        if let Some(l) = listener {
            l.on_disconnected(id.into());
        }
    }

    /// Deliver a payload from `id` to the listener registered when it was accepted.
    pub fn deliver(&self, id: &str, bytes: &[u8]) {
        let listener = self.lock().payload.get(&EndpointId::from(id)).cloned();
        if let Some(l) = listener {
            l.on_payload_received(id.into(), bytes.to_vec());
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn advertise(
        &self,
        service_id: &str,
        local_name: &str,
        lifecycle: Arc<dyn LifecycleListener>,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Advertise {
            service_id: service_id.to_owned(),
            local_name: local_name.to_owned(),
        })?;
        self.lock().lifecycle = Some(lifecycle);
        Ok(())
    }

    async fn discover(
        &self,
        service_id: &str,
        discovery: Arc<dyn DiscoveryListener>,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Discover {
            service_id: service_id.to_owned(),
        })?;
        self.lock().discovery = Some(discovery);
        Ok(())
    }

    async fn request_connection(
        &self,
        local_name: &str,
        endpoint_id: &EndpointId,
        lifecycle: Arc<dyn LifecycleListener>,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::RequestConnection {
            local_name: local_name.to_owned(),
            endpoint_id: endpoint_id.clone(),
        })?;
        self.lock().lifecycle = Some(lifecycle);
        Ok(())
    }

    async fn accept_connection(
        &self,
        endpoint_id: &EndpointId,
        payload: Arc<dyn PayloadListener>,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::AcceptConnection {
            endpoint_id: endpoint_id.clone(),
        })?;
        self.lock().payload.insert(endpoint_id.clone(), payload);
        Ok(())
    }

    async fn send_bytes(
        &self,
        endpoint_id: &EndpointId,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        if !self.is_connected(endpoint_id) {
            return Err(TransportError::NotConnected(endpoint_id.clone()));
        }
        self.record(TransportCall::SendBytes {
            endpoint_id: endpoint_id.clone(),
            bytes,
        })
    }

    async fn stop_discovery(&self) {
        let mut st = self.lock();
        st.calls.push(TransportCall::StopDiscovery);
        st.discovery = None;
    }

    async fn stop_advertising(&self) {
        self.lock().calls.push(TransportCall::StopAdvertising);
    }

    async fn stop_all(&self) {
        let mut st = self.lock();
        st.calls.push(TransportCall::StopAll);
        st.discovery = None;
        st.lifecycle = None;
        st.payload.clear();
        st.connected.clear();
    }
}
