//! LAN transport: advertisers beacon over multicast and accept TCP links; discoverers dial the
//! advertised port. A link is connected once both sides have sent `Accept`.
//!
//! When two devices dial each other at once, both keep the TCP stream dialed by the device
//! with the smaller endpoint id. A local accept is remembered per endpoint rather than per
//! stream, so it carries over to whichever stream survives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use offgrid_core::transport::STATUS_ERROR;
use offgrid_core::{
    ConnectionStatus, DiscoveryListener, EndpointId, LifecycleListener, PayloadListener,
    Transport, TransportError,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::discovery::{self, Beacon, PeerTable};
use crate::frame::{read_frame, write_frame, Frame};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LanSettings {
    pub discovery_port: u16,
    pub beacon_interval: Duration,
    pub endpoint_timeout: Duration,
}

struct Link {
    generation: u64,
    /// We dialed this stream.
    outbound: bool,
    tx: mpsc::UnboundedSender<Frame>,
    lifecycle: Arc<dyn LifecycleListener>,
    payload: Option<Arc<dyn PayloadListener>>,
    local_accepted: bool,
    remote_accepted: bool,
    connected: bool,
    tasks: [JoinHandle<()>; 2],
}

impl Link {
    fn abort(&self) {
        for t in &self.tasks {
            t.abort();
        }
    }

    /// Newly connected once both sides accepted.
    fn settle(&mut self) -> Option<Arc<dyn LifecycleListener>> {
        if self.local_accepted && self.remote_accepted && !self.connected {
            self.connected = true;
            return Some(self.lifecycle.clone());
        }
        None
    }
}

#[derive(Default)]
struct LanState {
    discovery_tasks: Vec<JoinHandle<()>>,
    advertising_tasks: Vec<JoinHandle<()>>,
    links: HashMap<EndpointId, Link>,
    /// Endpoints accepted locally, with their payload listener.
    accepted: HashMap<EndpointId, Arc<dyn PayloadListener>>,
    /// Unaccepted outbound links that closed while the peer may still be dialing us.
    yielding: HashMap<EndpointId, u64>,
    next_generation: u64,
}

struct Shared {
    local_id: String,
    settings: LanSettings,
    peers: Arc<PeerTable>,
    state: Mutex<LanState>,
}

pub struct LanTransport {
    shared: Arc<Shared>,
}

/// Random 8-hex-digit endpoint id, e.g. `3F9A01C2`.
pub fn generate_endpoint_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_ascii_uppercase()
}

impl LanTransport {
    pub fn new(settings: LanSettings) -> Self {
        Self::with_endpoint_id(generate_endpoint_id(), settings)
    }

    pub fn with_endpoint_id(local_id: String, settings: LanSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                local_id,
                settings,
                peers: Arc::new(PeerTable::default()),
                state: Mutex::new(LanState::default()),
            }),
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.shared.local_id
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if streams between us and `id` should be the ones we dial.
    fn dials_to(&self, id: &EndpointId) -> bool {
        self.local_id.as_str() < id.as_str()
    }

    /// Split `stream` into reader and writer tasks and register it as the link to `id`.
    /// Registered before the reader can observe anything.
    ///
    /// Returns false, dropping `stream`, when the existing link to `id` is connected or is the
    /// preferred stream of a crossed dial. Otherwise any previous link is replaced.
    fn open_link(
        self: &Arc<Self>,
        id: EndpointId,
        stream: TcpStream,
        lifecycle: Arc<dyn LifecycleListener>,
        outbound: bool,
    ) -> bool {
        let mut st = self.lock();
        if let Some(existing) = st.links.get(&id) {
            let crossed = existing.outbound != outbound;
            if existing.connected || (crossed && existing.outbound == self.dials_to(&id)) {
                tracing::debug!(endpoint = %id, outbound, "keeping existing link");
                return false;
            }
        }
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        st.next_generation += 1;
        let generation = st.next_generation;
        st.yielding.remove(&id);
        let payload = st.accepted.get(&id).cloned();
        let local_accepted = payload.is_some();
        if local_accepted {
            // Writer has not started yet, so this is the first frame on the stream.
            let _ = tx.send(Frame::Accept);
        }
        let writer = tokio::spawn(write_loop(write_half, rx));
        let reader = tokio::spawn(read_loop(self.clone(), id.clone(), generation, read_half));
        let link = Link {
            generation,
            outbound,
            tx,
            lifecycle,
            payload,
            local_accepted,
            remote_accepted: false,
            connected: false,
            tasks: [writer, reader],
        };
        if let Some(old) = st.links.insert(id, link) {
            old.abort();
        }
        true
    }

    fn remote_accepted(&self, id: &EndpointId, generation: u64) {
        let settled = {
            let mut st = self.lock();
            match st.links.get_mut(id) {
                Some(link) if link.generation == generation => {
                    link.remote_accepted = true;
                    link.settle()
                }
                _ => None,
            }
        };
        if let Some(lifecycle) = settled {
            tracing::info!(endpoint = %id, "link connected");
            lifecycle.on_connection_result(id.clone(), ConnectionStatus::Ok);
        }
    }

    fn payload(&self, id: &EndpointId, generation: u64, bytes: Vec<u8>) {
        let listener = {
            let st = self.lock();
            match st.links.get(id) {
                Some(link) if link.generation == generation && link.connected => {
                    link.payload.clone()
                }
                _ => None,
            }
        };
        match listener {
            Some(l) => l.on_payload_received(id.clone(), bytes),
            None => tracing::debug!(endpoint = %id, "payload on unconnected link dropped"),
        }
    }

    /// Reader ended. A connected link reports a disconnect, a pending one a failed result.
    ///
    /// A pending outbound link the peer is entitled to drop (it prefers its own dial) waits one
    /// handshake timeout for the peer's stream before failing.
    fn link_closed(self: &Arc<Self>, id: &EndpointId, generation: u64) {
        let (link, yielding) = {
            let mut st = self.lock();
            let link = match st.links.get(id) {
                Some(link) if link.generation == generation => st.links.remove(id),
                _ => None,
            };
            let yielding = matches!(
                &link,
                Some(l) if !l.connected && l.outbound && !self.dials_to(id)
            );
            if yielding {
                st.yielding.insert(id.clone(), generation);
            } else if link.is_some() {
                st.accepted.remove(id);
            }
            (link, yielding)
        };
        let Some(link) = link else {
            return;
        };
        link.tasks[0].abort();
        if link.connected {
            tracing::info!(endpoint = %id, "link closed");
            link.lifecycle.on_disconnected(id.clone());
        } else if yielding {
            tracing::debug!(endpoint = %id, "outbound link dropped by peer; waiting for its stream");
            let shared = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
                let expired = {
                    let mut st = shared.lock();
                    if st.yielding.get(&id) == Some(&generation) {
                        st.yielding.remove(&id);
                        st.accepted.remove(&id);
                        true
                    } else {
                        false
                    }
                };
                if expired {
                    tracing::info!(endpoint = %id, "peer stream never arrived");
                    link.lifecycle
                        .on_connection_result(id, ConnectionStatus::Error(STATUS_ERROR));
                }
            });
        } else {
            tracing::info!(endpoint = %id, "link closed before both sides accepted");
            link.lifecycle
                .on_connection_result(id.clone(), ConnectionStatus::Error(STATUS_ERROR));
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!(error = %e, "link write failed");
            break;
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    id: EndpointId,
    generation: u64,
    mut reader: OwnedReadHalf,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Accept)) => shared.remote_accepted(&id, generation),
            Ok(Some(Frame::Payload(bytes))) => shared.payload(&id, generation, bytes),
            Ok(Some(other)) => {
                tracing::debug!(endpoint = %id, frame = ?other, "unexpected frame on link");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(endpoint = %id, error = %e, "link read failed");
                break;
            }
        }
    }
    shared.link_closed(&id, generation);
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    lifecycle: Arc<dyn LifecycleListener>,
) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let shared = shared.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await;
            let (endpoint_id, name) = match hello {
                Ok(Ok(Some(Frame::ConnectionRequest { endpoint_id, name }))) => {
                    (endpoint_id, name)
                }
                _ => {
                    tracing::debug!(%from, "dropping link without a connection request");
                    return;
                }
            };
            let id = EndpointId::new(endpoint_id);
            tracing::info!(endpoint = %id, %name, %from, "incoming connection");
            if shared.open_link(id.clone(), stream, lifecycle.clone(), false) {
                lifecycle.on_connection_initiated(id, name);
            }
        });
    }
}

async fn dial(
    shared: Arc<Shared>,
    local_name: String,
    id: EndpointId,
    remote_name: String,
    addr: std::net::SocketAddr,
    lifecycle: Arc<dyn LifecycleListener>,
) {
    let connect = async {
        let mut stream =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr)).await??;
        write_frame(
            &mut stream,
            &Frame::ConnectionRequest {
                endpoint_id: shared.local_id.clone(),
                name: local_name,
            },
        )
        .await?;
        Ok::<_, std::io::Error>(stream)
    };
    match connect.await {
        Ok(stream) => {
            if shared.open_link(id.clone(), stream, lifecycle.clone(), true) {
                lifecycle.on_connection_initiated(id, remote_name);
            }
        }
        Err(e) => {
            tracing::warn!(endpoint = %id, %addr, error = %e, "connection request failed");
            lifecycle.on_connection_result(id, ConnectionStatus::Error(STATUS_ERROR));
        }
    }
}

#[async_trait]
impl Transport for LanTransport {
    async fn advertise(
        &self,
        service_id: &str,
        local_name: &str,
        lifecycle: Arc<dyn LifecycleListener>,
    ) -> Result<(), TransportError> {
        if !self.shared.lock().advertising_tasks.is_empty() {
            return Err(TransportError::AlreadyActive("advertising"));
        }
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let listen_port = listener.local_addr()?.port();
        let beacon = Beacon {
            service_id: service_id.to_owned(),
            endpoint_id: self.shared.local_id.clone(),
            name: local_name.to_owned(),
            listen_port,
        };
        let settings = &self.shared.settings;
        let (port, interval) = (settings.discovery_port, settings.beacon_interval);
        let beacon_task = tokio::spawn(async move {
            if let Err(e) = discovery::beacon_loop(beacon, port, interval).await {
                tracing::warn!(error = %e, "beacon loop stopped");
            }
        });
        let accept_task = tokio::spawn(accept_loop(self.shared.clone(), listener, lifecycle));
        tracing::info!(%service_id, %local_name, listen_port, "advertising");
        self.shared.lock().advertising_tasks = vec![beacon_task, accept_task];
        Ok(())
    }

    async fn discover(
        &self,
        service_id: &str,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Result<(), TransportError> {
        if !self.shared.lock().discovery_tasks.is_empty() {
            return Err(TransportError::AlreadyActive("discovering"));
        }
        let socket = discovery::make_multicast_socket(self.shared.settings.discovery_port)?;
        self.shared.peers.clear();
        let scan = tokio::spawn({
            let service_id = service_id.to_owned();
            let own_id = self.shared.local_id.clone();
            let peers = self.shared.peers.clone();
            let listener = listener.clone();
            async move {
                if let Err(e) =
                    discovery::scan_loop(socket, service_id, own_id, peers, listener).await
                {
                    tracing::warn!(error = %e, "scan loop stopped");
                }
            }
        });
        let expiry = tokio::spawn(discovery::expiry_loop(
            self.shared.peers.clone(),
            self.shared.settings.endpoint_timeout,
            listener,
        ));
        tracing::info!(%service_id, "discovering");
        self.shared.lock().discovery_tasks = vec![scan, expiry];
        Ok(())
    }

    async fn request_connection(
        &self,
        local_name: &str,
        endpoint_id: &EndpointId,
        lifecycle: Arc<dyn LifecycleListener>,
    ) -> Result<(), TransportError> {
        let peer = self
            .shared
            .peers
            .get(endpoint_id)
            .ok_or_else(|| TransportError::UnknownEndpoint(endpoint_id.clone()))?;
        tokio::spawn(dial(
            self.shared.clone(),
            local_name.to_owned(),
            endpoint_id.clone(),
            peer.name,
            peer.addr,
            lifecycle,
        ));
        Ok(())
    }

    async fn accept_connection(
        &self,
        endpoint_id: &EndpointId,
        payload: Arc<dyn PayloadListener>,
    ) -> Result<(), TransportError> {
        let settled = {
            let mut guard = self.shared.lock();
            let st = &mut *guard;
            match st.links.get_mut(endpoint_id) {
                Some(link) => {
                    link.payload = Some(payload.clone());
                    link.local_accepted = true;
                    // A closed writer shows up as a reader EOF; nothing to report here.
                    let _ = link.tx.send(Frame::Accept);
                    st.accepted.insert(endpoint_id.clone(), payload);
                    link.settle()
                }
                // Crossed dial: the peer's stream picks up this accept when it arrives.
                None if st.yielding.contains_key(endpoint_id) => {
                    st.accepted.insert(endpoint_id.clone(), payload);
                    None
                }
                None => return Err(TransportError::UnknownEndpoint(endpoint_id.clone())),
            }
        };
        if let Some(lifecycle) = settled {
            tracing::info!(endpoint = %endpoint_id, "link connected");
            lifecycle.on_connection_result(endpoint_id.clone(), ConnectionStatus::Ok);
        }
        Ok(())
    }

    async fn send_bytes(
        &self,
        endpoint_id: &EndpointId,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        let st = self.shared.lock();
        match st.links.get(endpoint_id) {
            Some(link) if link.connected => link
                .tx
                .send(Frame::Payload(bytes))
                .map_err(|_| TransportError::NotConnected(endpoint_id.clone())),
            _ => Err(TransportError::NotConnected(endpoint_id.clone())),
        }
    }

    async fn stop_discovery(&self) {
        for t in self.shared.lock().discovery_tasks.drain(..) {
            t.abort();
        }
        tracing::debug!("discovery stopped");
    }

    async fn stop_advertising(&self) {
        for t in self.shared.lock().advertising_tasks.drain(..) {
            t.abort();
        }
        tracing::debug!("advertising stopped");
    }

    async fn stop_all(&self) {
        let mut guard = self.shared.lock();
        let st = &mut *guard;
        for t in st
            .discovery_tasks
            .drain(..)
            .chain(st.advertising_tasks.drain(..))
        {
            t.abort();
        }
        for (_, link) in st.links.drain() {
            link.abort();
        }
        st.accepted.clear();
        st.yielding.clear();
        drop(guard);
        self.shared.peers.clear();
        tracing::info!("all endpoints stopped");
    }
}
