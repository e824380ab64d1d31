use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::connect_id::{ConnectId, PointId};
use crate::out_link::{LinkHost, OutLink};
use crate::packet::{TrunkPacket, RECV_BUFFER_SIZE};
use crate::retransmit::{RetransmitCache, RESEND_TICK, RESEND_TIMEOUT};
use crate::trunk_socket::SendSocket;

/// Cumulative traffic counters plus the current number of live virtual
/// connections. Byte counts are measured at the boundary to the outbound
/// TCP links.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrunkStats {
    pub bytes_to_links: u64,
    pub bytes_from_links: u64,
    pub connections: usize,
}

/// Creates the outbound link for a requested point id, or `None` when the
/// point is not configured (the create request is then silently ignored and
/// the requesting side runs into its deadline).
pub type LinkFactory = Box<dyn Fn(PointId) -> Option<Arc<OutLink>> + Send + Sync>;

#[derive(Clone, Copy)]
enum DataDirection {
    Out,
    In,
}

struct ConnectEntry {
    link: Arc<OutLink>,
    point: PointId,
    /// Index for the next outgoing data packet of this connection.
    next_index: u32,
}

/// Role-independent part of a trunk endpoint: the virtual-connection
/// registry, the retransmission cache and the traffic counters.
struct TrunkCore {
    connects: Mutex<FxHashMap<ConnectId, ConnectEntry>>,
    cache: RetransmitCache,
    bytes_to_links: AtomicU64,
    bytes_from_links: AtomicU64,
}

impl TrunkCore {
    fn new() -> TrunkCore {
        TrunkCore {
            connects: Mutex::new(FxHashMap::default()),
            cache: RetransmitCache::default(),
            bytes_to_links: AtomicU64::new(0),
            bytes_from_links: AtomicU64::new(0),
        }
    }

    fn register(&self, id: ConnectId, point: PointId, link: Arc<OutLink>) -> bool {
        let mut connects = self.connects.lock().unwrap();
        if connects.contains_key(&id) {
            return false;
        }
        connects.insert(
            id,
            ConnectEntry {
                link,
                point,
                next_index: 0,
            },
        );
        true
    }

    fn contains(&self, id: ConnectId) -> bool {
        self.connects.lock().unwrap().contains_key(&id)
    }

    fn remove(&self, id: ConnectId) -> Option<ConnectEntry> {
        self.connects.lock().unwrap().remove(&id)
    }

    fn link_of(&self, id: ConnectId) -> Option<Arc<OutLink>> {
        self.connects.lock().unwrap().get(&id).map(|e| e.link.clone())
    }

    /// Hands a received chunk to the connection's link. Unknown connection
    /// ids are dropped without comment, the packet was acked regardless.
    fn deliver_chunk(&self, id: ConnectId, index: u32, payload: &[u8]) {
        match self.link_of(id) {
            Some(link) => {
                self.bytes_to_links
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                link.send_chunk(index, payload);
            }
            None => trace!(?id, "data for unknown connection, dropping"),
        }
    }

    /// Allocates the next packet index, serializes the data packet and
    /// parks it in the retransmission cache. `None` when the connection is
    /// not registered.
    fn build_data_packet(
        &self,
        id: ConnectId,
        data: &[u8],
        direction: DataDirection,
    ) -> Option<Bytes> {
        let index = {
            let mut connects = self.connects.lock().unwrap();
            let entry = connects.get_mut(&id)?;
            let index = entry.next_index;
            entry.next_index += 1;
            index
        };

        let packet = match direction {
            DataDirection::Out => TrunkPacket::DataOut {
                index,
                payload: data.to_vec(),
            },
            DataDirection::In => TrunkPacket::DataIn {
                index,
                payload: data.to_vec(),
            },
        };
        let bytes = packet.to_bytes(id);
        self.cache.insert_data(id, index, bytes.clone(), Instant::now());
        self.bytes_from_links
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Some(bytes)
    }

    /// The peer released the connection: drop local state, deliver what is
    /// already buffered and close the link.
    fn release_from_peer(&self, id: ConnectId) {
        match self.remove(id) {
            Some(entry) => {
                debug!(?id, "peer released the connection");
                self.cache.purge(id);
                entry.link.stop_after_pending();
            }
            None => trace!(?id, "release for unknown connection, dropping"),
        }
    }

    /// Local link teardown. Returns the serialized release notification for
    /// the peer when the connection was still registered; the caller sends
    /// it. The release is cached like a create packet, so it is re-sent
    /// until its deadline quietly expires (there is no ack for it).
    fn finish_connect(&self, id: ConnectId) -> Option<Bytes> {
        let entry = self.remove(id)?;
        debug!(?id, "connection closed locally");
        self.cache.purge(id);

        let release = TrunkPacket::ReleaseConnect {
            point: entry.point,
            timeout_ms: 0,
        }
        .to_bytes(id);
        self.cache.insert_connect(id, release.clone(), Instant::now());
        Some(release)
    }

    /// Deadline teardown: the peer stopped acknowledging, so the connection
    /// is cancelled locally without a release notification.
    fn fail_connect(&self, id: ConnectId) {
        if let Some(entry) = self.remove(id) {
            warn!(?id, "no acknowledgement within the deadline, closing the connection");
            entry.link.cancel_read_write();
        }
        self.cache.purge(id);
    }

    fn stats(&self) -> TrunkStats {
        TrunkStats {
            bytes_to_links: self.bytes_to_links.load(Ordering::Relaxed),
            bytes_from_links: self.bytes_from_links.load(Ordering::Relaxed),
            connections: self.connects.lock().unwrap().len(),
        }
    }
}

/// Ingress side of the trunk. Owns one unbound-port UDP socket; everything
/// it sends goes to the first configured trunk endpoint (the remaining
/// endpoints are configured reserves).
pub struct TrunkClient {
    core: TrunkCore,
    send_socket: Arc<dyn SendSocket>,
    remote: SocketAddr,
}

impl TrunkClient {
    pub async fn new(trunk_points: &[SocketAddr]) -> anyhow::Result<Arc<TrunkClient>> {
        let remote = *trunk_points
            .first()
            .ok_or_else(|| anyhow!("no trunk endpoints configured"))?;

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let client = Arc::new(TrunkClient {
            core: TrunkCore::new(),
            send_socket: Arc::new(socket.clone()),
            remote,
        });

        tokio::spawn(client.clone().recv_loop(socket));
        tokio::spawn(client.clone().resend_loop());
        Ok(client)
    }

    #[cfg(test)]
    fn with_socket(send_socket: Arc<dyn SendSocket>, remote: SocketAddr) -> Arc<TrunkClient> {
        Arc::new(TrunkClient {
            core: TrunkCore::new(),
            send_socket,
            remote,
        })
    }

    /// Registers an accepted TCP socket as a new virtual connection:
    /// generates a fresh id, begins `CreateConnect` retransmission and
    /// starts the link immediately. Returns [`ConnectId::NIL`] in the
    /// astronomically unlikely case of an id collision (the link is dropped).
    pub async fn add_connect(self: &Arc<Self>, point: PointId, link: Arc<OutLink>) -> ConnectId {
        let id = ConnectId::random();
        if !self.core.register(id, point, link.clone()) {
            warn!(?id, "generated connect id already exists, dropping the new link");
            return ConnectId::NIL;
        }
        info!(?id, point, "new virtual connection");

        let create = TrunkPacket::CreateConnect {
            point,
            timeout_ms: RESEND_TIMEOUT.as_millis() as u32,
        }
        .to_bytes(id);
        self.core.cache.insert_connect(id, create.clone(), Instant::now());
        self.send_socket.do_send_packet(self.remote, &create).await;

        let host: Arc<dyn LinkHost> = self.clone();
        link.run(host, id);
        id
    }

    pub fn stats(&self) -> TrunkStats {
        self.core.stats()
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, _from)) => self.handle_packet(&buf[..len]).await,
                Err(e) => error!("error receiving on the trunk socket: {}", e),
            }
        }
    }

    async fn resend_loop(self: Arc<Self>) {
        let mut tick = time::interval(RESEND_TICK);
        loop {
            tick.tick().await;
            let now = Instant::now();
            for id in self.core.cache.take_expired(now) {
                self.core.fail_connect(id);
            }
            for (_, bytes) in self.core.cache.take_due(now) {
                self.send_socket.do_send_packet(self.remote, &bytes).await;
            }
        }
    }

    async fn handle_packet(&self, datagram: &[u8]) {
        let (id, packet) = match TrunkPacket::try_deser(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("dropping malformed trunk packet: {}", e);
                return;
            }
        };

        match packet {
            TrunkPacket::AckCreateConnect => {
                debug!(?id, "connection confirmed by the server");
                self.core.cache.remove_connect(id);
            }
            TrunkPacket::DataIn { index, payload } => {
                // ack first, unconditionally; reliability of the ack rides
                // on the peer's retransmission of the data packet
                let ack = TrunkPacket::AckDataIn { index }.to_bytes(id);
                self.send_socket.do_send_packet(self.remote, &ack).await;
                self.core.deliver_chunk(id, index, &payload);
            }
            TrunkPacket::AckDataOut { index } => self.core.cache.remove_data(id, index),
            TrunkPacket::ReleaseConnect { .. } => self.core.release_from_peer(id),
            other => trace!(
                ?id,
                command = ?other.command(),
                "dropping packet the client role does not accept"
            ),
        }
    }
}

#[async_trait]
impl LinkHost for TrunkClient {
    async fn forward_data(&self, id: ConnectId, data: &[u8]) -> bool {
        let Some(bytes) = self.core.build_data_packet(id, data, DataDirection::Out) else {
            return false;
        };
        self.send_socket.do_send_packet(self.remote, &bytes).await;
        true
    }

    async fn close_connect(&self, id: ConnectId) {
        if let Some(release) = self.core.finish_connect(id) {
            self.send_socket.do_send_packet(self.remote, &release).await;
        }
    }
}

#[derive(Clone, Copy)]
struct ClientRoute {
    socket_index: usize,
    addr: SocketAddr,
}

/// Egress side of the trunk. Binds every configured UDP endpoint and routes
/// each reply through the socket the connection's traffic last arrived on.
pub struct TrunkServer {
    core: TrunkCore,
    send_sockets: Vec<Arc<dyn SendSocket>>,
    local_addrs: Vec<SocketAddr>,
    /// Last observed UDP return endpoint per connection, refreshed on every
    /// inbound packet.
    clients: Mutex<FxHashMap<ConnectId, ClientRoute>>,
    factory: LinkFactory,
}

impl TrunkServer {
    pub async fn new(bind_points: &[SocketAddr], factory: LinkFactory) -> anyhow::Result<Arc<TrunkServer>> {
        if bind_points.is_empty() {
            bail!("no trunk endpoints configured");
        }

        let mut sockets = Vec::new();
        for point in bind_points {
            sockets.push(Arc::new(UdpSocket::bind(point).await?));
        }
        let send_sockets: Vec<Arc<dyn SendSocket>> = sockets
            .iter()
            .map(|s| Arc::new(s.clone()) as Arc<dyn SendSocket>)
            .collect();
        let local_addrs = send_sockets.iter().map(|s| s.local_addr()).collect();

        let server = Arc::new(TrunkServer {
            core: TrunkCore::new(),
            send_sockets,
            local_addrs,
            clients: Mutex::new(FxHashMap::default()),
            factory,
        });

        for (index, socket) in sockets.into_iter().enumerate() {
            tokio::spawn(server.clone().recv_loop(index, socket));
        }
        tokio::spawn(server.clone().resend_loop());
        Ok(server)
    }

    #[cfg(test)]
    fn with_sockets(send_sockets: Vec<Arc<dyn SendSocket>>, factory: LinkFactory) -> Arc<TrunkServer> {
        Arc::new(TrunkServer {
            core: TrunkCore::new(),
            send_sockets,
            local_addrs: Vec::new(),
            clients: Mutex::new(FxHashMap::default()),
            factory,
        })
    }

    /// The UDP endpoints this server actually bound, in configuration order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn stats(&self) -> TrunkStats {
        self.core.stats()
    }

    async fn recv_loop(self: Arc<Self>, socket_index: usize, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    self.handle_packet(socket_index, from, &buf[..len]).await;
                }
                Err(e) => error!("error receiving on trunk socket {}: {}", socket_index, e),
            }
        }
    }

    async fn resend_loop(self: Arc<Self>) {
        let mut tick = time::interval(RESEND_TICK);
        loop {
            tick.tick().await;
            let now = Instant::now();
            for id in self.core.cache.take_expired(now) {
                self.fail_connect(id);
            }
            for (id, bytes) in self.core.cache.take_due(now) {
                self.send_raw(id, &bytes).await;
            }
        }
    }

    fn fail_connect(&self, id: ConnectId) {
        self.core.fail_connect(id);
        self.clients.lock().unwrap().remove(&id);
    }

    async fn send_raw(&self, id: ConnectId, bytes: &[u8]) {
        let route = self.clients.lock().unwrap().get(&id).copied();
        match route {
            Some(route) => {
                self.send_sockets[route.socket_index]
                    .do_send_packet(route.addr, bytes)
                    .await;
            }
            None => trace!(?id, "no return route for connection, dropping packet"),
        }
    }

    async fn send_packet(&self, id: ConnectId, packet: &TrunkPacket) {
        self.send_raw(id, &packet.to_bytes(id)).await;
    }

    async fn handle_packet(self: &Arc<Self>, socket_index: usize, from: SocketAddr, datagram: &[u8]) {
        let (id, packet) = match TrunkPacket::try_deser(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("dropping malformed trunk packet from {:?}: {}", from, e);
                return;
            }
        };

        // remember the return path; every reply and retransmit for this
        // connection goes out on the socket its traffic last arrived on
        self.clients
            .lock()
            .unwrap()
            .insert(id, ClientRoute { socket_index, addr: from });

        match packet {
            TrunkPacket::CreateConnect { point, .. } => self.on_create_connect(id, point).await,
            TrunkPacket::DataOut { index, payload } => {
                let ack = TrunkPacket::AckDataOut { index };
                self.send_packet(id, &ack).await;
                self.core.deliver_chunk(id, index, &payload);
            }
            TrunkPacket::AckDataIn { index } => self.core.cache.remove_data(id, index),
            TrunkPacket::ReleaseConnect { .. } => self.core.release_from_peer(id),
            other => trace!(
                ?id,
                command = ?other.command(),
                "dropping packet the server role does not accept"
            ),
        }
    }

    async fn on_create_connect(self: &Arc<Self>, id: ConnectId, point: PointId) {
        if self.core.contains(id) {
            debug!(?id, "duplicate create request, re-acknowledging");
            self.send_packet(id, &TrunkPacket::AckCreateConnect).await;
            return;
        }

        let Some(link) = (self.factory)(point) else {
            warn!(?id, point, "no outbound link for point, ignoring the create request");
            return;
        };

        info!(?id, point, "new virtual connection");
        self.send_packet(id, &TrunkPacket::AckCreateConnect).await;

        if !self.core.register(id, point, link.clone()) {
            // a concurrent duplicate won the race, keep the registered link
            return;
        }
        let host: Arc<dyn LinkHost> = self.clone();
        link.run(host, id);
    }
}

#[async_trait]
impl LinkHost for TrunkServer {
    async fn forward_data(&self, id: ConnectId, data: &[u8]) -> bool {
        let Some(bytes) = self.core.build_data_packet(id, data, DataDirection::In) else {
            return false;
        };
        self.send_raw(id, &bytes).await;
        true
    }

    async fn close_connect(&self, id: ConnectId) {
        if let Some(release) = self.core.finish_connect(id) {
            self.send_raw(id, &release).await;
        }
    }
}
