//! LAN discovery: UDP multicast beacons from advertisers, a scan loop that reports new
//! advertisers of our service, and an expiry loop that reports the ones that went quiet.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use offgrid_core::{DiscoveryListener, EndpointId};
use tokio::net::UdpSocket;

use crate::frame::{decode_frame, encode_frame, Frame, PROTOCOL_VERSION};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub name: String,
    /// TCP address the advertiser accepts links on.
    pub addr: SocketAddr,
    last_seen: Instant,
}

/// Advertisers heard by the scan loop, shared with the transport for dialing.
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<EndpointId, PeerInfo>>,
}

impl PeerTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<EndpointId, PeerInfo>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &EndpointId) -> Option<PeerInfo> {
        self.lock().get(id).cloned()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Record a beacon. Returns true the first time `id` is heard.
    fn heard(&self, id: EndpointId, name: &str, addr: SocketAddr, now: Instant) -> bool {
        let mut peers = self.lock();
        let is_new = !peers.contains_key(&id);
        peers.insert(
            id,
            PeerInfo {
                name: name.to_owned(),
                addr,
                last_seen: now,
            },
        );
        is_new
    }

    /// Remove and return every peer not heard from since `now - timeout`.
    fn expire(&self, now: Instant, timeout: Duration) -> Vec<EndpointId> {
        let mut peers = self.lock();
        let stale: Vec<EndpointId> = peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }
}

/// Bind the discovery port and join the multicast group (TTL 1, link-local only).
pub fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// What an advertiser announces every beacon interval.
#[derive(Debug, Clone)]
pub struct Beacon {
    pub service_id: String,
    pub endpoint_id: String,
    pub name: String,
    pub listen_port: u16,
}

pub async fn beacon_loop(
    beacon: Beacon,
    discovery_port: u16,
    interval: Duration,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_multicast_ttl_v4(1)?;
    let frame = encode_frame(&Frame::Beacon {
        protocol_version: PROTOCOL_VERSION,
        service_id: beacon.service_id,
        endpoint_id: beacon.endpoint_id,
        name: beacon.name,
        listen_port: beacon.listen_port,
    })
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            tracing::debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(interval).await;
    }
}

pub async fn scan_loop(
    socket: UdpSocket,
    service_id: String,
    own_id: String,
    peers: Arc<PeerTable>,
    listener: Arc<dyn DiscoveryListener>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok((frame, _)) = decode_frame(&buf[..n]) else {
            continue;
        };
        let Frame::Beacon {
            protocol_version,
            service_id: beacon_service,
            endpoint_id,
            name,
            listen_port,
        } = frame
        else {
            continue;
        };
        if protocol_version != PROTOCOL_VERSION || beacon_service != service_id {
            continue;
        }
        if endpoint_id == own_id {
            continue;
        }
        let id = EndpointId::new(endpoint_id);
        let addr = SocketAddr::new(from.ip(), listen_port);
        if peers.heard(id.clone(), &name, addr, Instant::now()) {
            tracing::info!(endpoint = %id, %name, %addr, "advertiser found");
            listener.on_endpoint_found(id, name);
        }
    }
}

pub async fn expiry_loop(
    peers: Arc<PeerTable>,
    timeout: Duration,
    listener: Arc<dyn DiscoveryListener>,
) {
    let tick = (timeout / 2).max(Duration::from_millis(100));
    loop {
        tokio::time::sleep(tick).await;
        for id in peers.expire(Instant::now(), timeout) {
            tracing::info!(endpoint = %id, "advertiser lost");
            listener.on_endpoint_lost(id);
        }
    }
}
