//! Full-mesh TCP implementation of [`PeerTransport`].
//!
//! Every node listens on its cluster port and dials each configured seed.
//! Peers learned from PEERS frames are dialed too, so any connected seeding
//! graph ends up fully meshed. Links carry length-prefixed frames:
//! `[u32 BE len][u8 type][u8 flags][u16 LE reserved][u32 LE payload_len][payload]`.
//! A peer counts as joined while at least one link to it is up.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::BrokerError;

use super::error::TransportError;
use super::identity::epoch_ms;
use super::metrics::BrokerMetrics;
use super::reliability::ReconnectPolicy;
use super::transport::{PeerTransport, TransportEvent};
use super::types::PeerId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub(crate) const MAGIC: &[u8; 4] = b"MMQ\x00";
pub(crate) const PROTOCOL_VERSION: u16 = 1;
pub(crate) const PROTOCOL_VERSION_MIN: u16 = 1;
/// Room for a full-size client publish plus routing envelope, and for large
/// directory snapshots.
pub(crate) const MAX_FRAME_SIZE: usize = 16 * 1_048_576;
pub(crate) const HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub(crate) const HEARTBEAT_TIMEOUT_SECS: u64 = 15;
pub(crate) const MAX_BATCH_BYTES: usize = 65_536;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive failed dials before a learned peer is forgotten.
const LEARNED_DIAL_ATTEMPTS: u32 = 5;

pub(crate) const CAP_GOSSIP: u32 = 1 << 0;
pub(crate) const CAP_DIRECT: u32 = 1 << 1;
pub(crate) const CAP_PEERS: u32 = 1 << 2;
pub(crate) const LOCAL_CAPABILITIES: u32 = CAP_GOSSIP | CAP_DIRECT | CAP_PEERS;

const HELLO_LEN: usize = 20;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgType {
    Gossip = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    Hello = 0x04,
    Shutdown = 0x05,
    Direct = 0x06,
    Peers = 0x07,
}

impl MsgType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Gossip),
            0x02 => Some(Self::Ping),
            0x03 => Some(Self::Pong),
            0x04 => Some(Self::Hello),
            0x05 => Some(Self::Shutdown),
            0x06 => Some(Self::Direct),
            0x07 => Some(Self::Peers),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame encoding
// ---------------------------------------------------------------------------

fn put_header(buf: &mut BytesMut, msg_type: MsgType, payload_len: usize) {
    buf.reserve(8 + payload_len);
    buf.put_u8(msg_type as u8);
    buf.put_u8(0); // flags
    buf.put_u16_le(0); // reserved
    buf.put_u32_le(payload_len as u32);
}

pub(crate) fn encode_gossip(buf: &mut BytesMut, payload: &[u8]) {
    put_header(buf, MsgType::Gossip, payload.len());
    buf.put_slice(payload);
}

pub(crate) fn encode_direct(buf: &mut BytesMut, payload: &[u8]) {
    put_header(buf, MsgType::Direct, payload.len());
    buf.put_slice(payload);
}

pub(crate) fn encode_ping(buf: &mut BytesMut) {
    put_header(buf, MsgType::Ping, 0);
}

pub(crate) fn encode_pong(buf: &mut BytesMut) {
    put_header(buf, MsgType::Pong, 0);
}

pub(crate) fn encode_shutdown(buf: &mut BytesMut) {
    put_header(buf, MsgType::Shutdown, 0);
}

/// Payload: magic(4) + version(2) + peer id(8) + capabilities(4) + cluster port(2).
/// Only the port is advertised; the receiver pairs it with the IP it sees.
pub(crate) fn encode_hello(buf: &mut BytesMut, peer: PeerId, capabilities: u32, listen_port: u16) {
    put_header(buf, MsgType::Hello, HELLO_LEN);
    buf.put_slice(MAGIC);
    buf.put_u16_le(PROTOCOL_VERSION);
    buf.put_u64_le(peer.0);
    buf.put_u32_le(capabilities);
    buf.put_u16_le(listen_port);
}

/// Payload: count(2), then per peer: id(8) + family(1, 4 or 6) + ip + port(2).
pub(crate) fn encode_peers(buf: &mut BytesMut, peers: &[(PeerId, SocketAddr)]) {
    let payload_len: usize = 2 + peers
        .iter()
        .map(|(_, addr)| if addr.is_ipv4() { 15 } else { 27 })
        .sum::<usize>();
    put_header(buf, MsgType::Peers, payload_len);
    buf.put_u16_le(peers.len() as u16);
    for (peer, addr) in peers {
        buf.put_u64_le(peer.0);
        match addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u16_le(addr.port());
    }
}

/// Outer 4-byte big-endian length prefix.
fn write_framed(buf: &mut BytesMut, inner: &[u8]) {
    buf.reserve(4 + inner.len());
    buf.put_u32(inner.len() as u32);
    buf.put_slice(inner);
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub(crate) enum MeshFrame {
    Gossip(Bytes),
    Direct(Bytes),
    Ping,
    Pong,
    Hello {
        peer: PeerId,
        protocol_version: u16,
        capabilities: u32,
        listen_port: u16,
    },
    Peers(Vec<(PeerId, SocketAddr)>),
    Shutdown,
    Unknown {
        msg_type: u8,
    },
}

/// Decodes one frame with the outer length prefix already stripped.
/// Unknown types decode to `Unknown` so newer peers can be tolerated.
pub(crate) fn decode_frame(mut data: BytesMut) -> Option<MeshFrame> {
    if data.remaining() < 8 {
        return None;
    }
    let raw_type = data.get_u8();
    let _flags = data.get_u8();
    let _reserved = data.get_u16_le();
    let payload_len = data.get_u32_le() as usize;
    if data.remaining() < payload_len {
        return None;
    }

    match MsgType::from_u8(raw_type) {
        Some(MsgType::Gossip) => Some(MeshFrame::Gossip(data.split_to(payload_len).freeze())),
        Some(MsgType::Direct) => Some(MeshFrame::Direct(data.split_to(payload_len).freeze())),
        Some(MsgType::Ping) => Some(MeshFrame::Ping),
        Some(MsgType::Pong) => Some(MeshFrame::Pong),
        Some(MsgType::Shutdown) => Some(MeshFrame::Shutdown),
        Some(MsgType::Hello) => {
            if payload_len < HELLO_LEN {
                return None;
            }
            let magic = data.split_to(4);
            if magic.as_ref() != MAGIC {
                return None;
            }
            let protocol_version = data.get_u16_le();
            let peer = PeerId(data.get_u64_le());
            let capabilities = data.get_u32_le();
            let listen_port = data.get_u16_le();
            Some(MeshFrame::Hello {
                peer,
                protocol_version,
                capabilities,
                listen_port,
            })
        }
        Some(MsgType::Peers) => decode_peers(data.split_to(payload_len)).map(MeshFrame::Peers),
        None => Some(MeshFrame::Unknown { msg_type: raw_type }),
    }
}

fn decode_peers(mut data: BytesMut) -> Option<Vec<(PeerId, SocketAddr)>> {
    if data.remaining() < 2 {
        return None;
    }
    let count = data.get_u16_le() as usize;
    let mut peers = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if data.remaining() < 9 {
            return None;
        }
        let peer = PeerId(data.get_u64_le());
        let ip = match data.get_u8() {
            4 if data.remaining() >= 6 => {
                let mut octets = [0u8; 4];
                data.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 if data.remaining() >= 18 => {
                let mut octets = [0u8; 16];
                data.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        peers.push((peer, SocketAddr::new(ip, data.get_u16_le())));
    }
    Some(peers)
}

/// Returns min(local, remote) if both sides can speak it.
pub(crate) fn negotiate_version(local: u16, remote: u16) -> Option<u16> {
    let negotiated = local.min(remote);
    (negotiated >= PROTOCOL_VERSION_MIN).then_some(negotiated)
}

pub(crate) fn negotiate_capabilities(local: u32, remote: u32) -> u32 {
    local & remote
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
enum LinkError {
    #[error("timed out")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid HELLO")]
    BadHello,
    #[error("incompatible protocol version {0}")]
    Version(u16),
}

async fn read_frame<R>(reader: &mut R) -> io::Result<Option<MeshFrame>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    if frame_len == 0 || frame_len > MAX_FRAME_SIZE {
        return Ok(None);
    }
    let mut frame_buf = BytesMut::zeroed(frame_len);
    reader.read_exact(&mut frame_buf).await?;
    Ok(decode_frame(frame_buf))
}

async fn send_hello(writer: &mut OwnedWriteHalf, local: PeerId, listen_port: u16) -> io::Result<()> {
    let mut hello = BytesMut::new();
    encode_hello(&mut hello, local, LOCAL_CAPABILITIES, listen_port);
    let mut frame = BytesMut::new();
    write_framed(&mut frame, &hello);
    writer.write_all(&frame).await
}

/// What the remote side said in its HELLO, after negotiation.
struct Greeting {
    peer: PeerId,
    version: u16,
    caps: u32,
    /// Where the remote side accepts mesh links, as seen from here.
    addr: SocketAddr,
}

async fn read_hello(reader: &mut OwnedReadHalf) -> Result<Greeting, LinkError> {
    let remote = reader.peer_addr()?;
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| LinkError::Timeout)??;
    match frame {
        Some(MeshFrame::Hello {
            peer,
            protocol_version,
            capabilities,
            listen_port,
        }) => {
            let version = negotiate_version(PROTOCOL_VERSION, protocol_version)
                .ok_or(LinkError::Version(protocol_version))?;
            Ok(Greeting {
                peer,
                version,
                caps: negotiate_capabilities(LOCAL_CAPABILITIES, capabilities),
                addr: SocketAddr::new(remote.ip(), listen_port),
            })
        }
        _ => Err(LinkError::BadHello),
    }
}

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    let sock_ref = SockRef::from(stream);
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
    let _ = sock_ref.set_recv_buffer_size(262_144);
    let _ = sock_ref.set_send_buffer_size(262_144);
}

// ---------------------------------------------------------------------------
// Per-link tasks
// ---------------------------------------------------------------------------

/// Coalesces queued frames into one write of up to `MAX_BATCH_BYTES`.
/// On cancellation, whatever is already queued (e.g. SHUTDOWN) is flushed
/// once before the socket is dropped.
async fn link_writer(
    mut rx: mpsc::UnboundedReceiver<BytesMut>,
    mut writer: OwnedWriteHalf,
    cancel: CancellationToken,
    metrics: Arc<BrokerMetrics>,
) {
    let mut buf = BytesMut::with_capacity(MAX_BATCH_BYTES);

    loop {
        let first = tokio::select! {
            msg = rx.recv() => msg,
            () = cancel.cancelled() => {
                while let Ok(data) = rx.try_recv() {
                    write_framed(&mut buf, &data);
                }
                if !buf.is_empty() {
                    let _ = tokio::time::timeout(Duration::from_secs(1), writer.write_all(&buf)).await;
                }
                break;
            }
        };
        let Some(first) = first else { break };
        write_framed(&mut buf, &first);

        while buf.len() < MAX_BATCH_BYTES {
            match rx.try_recv() {
                Ok(data) => write_framed(&mut buf, &data),
                Err(_) => break,
            }
        }

        let bytes_count = buf.len() as u64;
        if let Err(e) = writer.write_all(&buf).await {
            debug!("mesh write failed: {e}");
            break;
        }
        metrics
            .mesh_bytes_sent
            .fetch_add(bytes_count, Ordering::Relaxed);
        buf.clear();
    }
}

/// Where link readers hand off what they receive.
#[derive(Clone)]
struct Upstream {
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Peer addresses learned from PEERS frames.
    discovered: mpsc::UnboundedSender<Vec<(PeerId, SocketAddr)>>,
}

/// Reads frames and turns payload frames into transport events.
/// A 64KB `BufReader` keeps small frames from costing a syscall each.
async fn link_reader(
    reader: OwnedReadHalf,
    write_tx: mpsc::UnboundedSender<BytesMut>,
    peer: PeerId,
    upstream: Upstream,
    cancel: CancellationToken,
    metrics: Arc<BrokerMetrics>,
    last_activity: Arc<AtomicU64>,
) {
    let mut reader = BufReader::with_capacity(65_536, reader);
    let mut len_buf = [0u8; 4];

    loop {
        let read_result = tokio::select! {
            r = reader.read_exact(&mut len_buf) => r,
            () = cancel.cancelled() => break,
        };
        if read_result.is_err() {
            break;
        }

        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_FRAME_SIZE {
            warn!(%peer, frame_len, "invalid mesh frame size, dropping link");
            break;
        }

        let mut frame_buf = BytesMut::zeroed(frame_len);
        let read_result = tokio::select! {
            r = reader.read_exact(&mut frame_buf) => r,
            () = cancel.cancelled() => break,
        };
        if read_result.is_err() {
            break;
        }

        metrics
            .mesh_bytes_received
            .fetch_add((4 + frame_len) as u64, Ordering::Relaxed);
        last_activity.store(epoch_ms(), Ordering::Relaxed);

        match decode_frame(frame_buf) {
            Some(MeshFrame::Gossip(payload)) => {
                let _ = upstream.events.send(TransportEvent::Broadcast {
                    from: peer,
                    payload,
                });
            }
            Some(MeshFrame::Direct(payload)) => {
                let _ = upstream.events.send(TransportEvent::Unicast {
                    from: peer,
                    payload,
                });
            }
            Some(MeshFrame::Ping) => {
                let mut pong = BytesMut::new();
                encode_pong(&mut pong);
                let _ = write_tx.send(pong);
            }
            Some(MeshFrame::Pong) => {}
            Some(MeshFrame::Peers(peers)) => {
                debug!(%peer, count = peers.len(), "peer list received");
                let _ = upstream.discovered.send(peers);
            }
            Some(MeshFrame::Shutdown) => {
                info!(%peer, "peer is shutting down");
                break;
            }
            Some(MeshFrame::Hello { .. }) => {
                // Only valid during the handshake.
            }
            Some(MeshFrame::Unknown { msg_type }) => {
                metrics.mesh_unknown_frames.fetch_add(1, Ordering::Relaxed);
                debug!(%peer, "unknown mesh frame type 0x{msg_type:02x}, skipping");
            }
            None => {
                warn!(%peer, "undecodable mesh frame, dropping link");
                break;
            }
        }
    }
}

async fn heartbeat_task(
    write_tx: mpsc::UnboundedSender<BytesMut>,
    peer: PeerId,
    cancel: CancellationToken,
    last_activity: Arc<AtomicU64>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    let timeout_ms = HEARTBEAT_TIMEOUT_SECS * 1000;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let last = last_activity.load(Ordering::Relaxed);
                if epoch_ms().saturating_sub(last) > timeout_ms {
                    warn!(%peer, "no traffic for {HEARTBEAT_TIMEOUT_SECS}s, dropping link");
                    break;
                }
                let mut ping = BytesMut::new();
                encode_ping(&mut ping);
                if write_tx.send(ping).is_err() {
                    break;
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

/// Spawns a link task that cancels `cancel` when it returns.
fn spawn_link_task<F>(cancel: &CancellationToken, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let guard = cancel.clone().drop_guard();
    tokio::spawn(async move {
        task.await;
        drop(guard);
    })
}

// ---------------------------------------------------------------------------
// Mesh transport
// ---------------------------------------------------------------------------

struct Link {
    id: u64,
    /// The peer's mesh listener, for introducing it to others.
    addr: SocketAddr,
    caps: u32,
    tx: mpsc::UnboundedSender<BytesMut>,
}

enum Dialed {
    Connected {
        greeting: Greeting,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    },
    /// The address reaches this very node.
    SelfLink,
}

pub struct MeshTransport {
    local: PeerId,
    local_addr: SocketAddr,
    /// Live links per peer. Sends use the oldest one.
    links: RwLock<AHashMap<PeerId, Vec<Link>>>,
    /// Learned peers with a dial task running.
    dialing: Mutex<AHashSet<PeerId>>,
    next_link: AtomicU64,
    upstream: Upstream,
    joined: watch::Sender<usize>,
    metrics: Arc<BrokerMetrics>,
    /// Fires on broker shutdown; triggers the SHUTDOWN broadcast.
    stop: CancellationToken,
    /// Stops every mesh task. Only cancelled after peers were told.
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl MeshTransport {
    /// Binds the cluster listener and starts dialing `seeds`. A bind failure
    /// is fatal; unreachable seeds are retried forever.
    pub async fn start(
        local: PeerId,
        bind: SocketAddr,
        seeds: Vec<String>,
        metrics: Arc<BrokerMetrics>,
        shutdown: &CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), BrokerError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| BrokerError::Bind { addr: bind, source })?;
        let local_addr = listener.local_addr()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (discovered, discovered_rx) = mpsc::unbounded_channel();
        let (joined, _) = watch::channel(0usize);

        let mesh = Arc::new(Self {
            local,
            local_addr,
            links: RwLock::new(AHashMap::new()),
            dialing: Mutex::new(AHashSet::new()),
            next_link: AtomicU64::new(1),
            upstream: Upstream { events, discovered },
            joined,
            metrics,
            stop: shutdown.child_token(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        let leaving = mesh.clone();
        mesh.tasks.spawn(async move {
            leaving.stop.cancelled().await;
            leaving.leave();
        });
        mesh.tasks.spawn(mesh.clone().accept_loop(listener));
        mesh.tasks.spawn(mesh.clone().discovery_loop(discovered_rx));
        for seed in seeds {
            mesh.tasks.spawn(mesh.clone().dial_loop(seed));
        }
        info!(peer = %local, %local_addr, "mesh listening");
        Ok((mesh, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.links.read().keys().copied().collect()
    }

    /// Resolves once at least one peer is connected. No timeout.
    pub async fn wait_joined(&self) {
        let mut rx = self.joined.subscribe();
        let _ = rx.wait_for(|n| *n > 0).await;
    }

    /// Stops the mesh and waits for every link to close. Also happens on
    /// its own when the broker shutdown token fires; this only waits.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("mesh stopped");
    }

    /// Queues SHUTDOWN on every link, then cancels them. Writers flush what
    /// is queued before closing.
    fn leave(&self) {
        let mut frame = BytesMut::new();
        encode_shutdown(&mut frame);
        for links in self.links.read().values() {
            for link in links {
                let _ = link.tx.send(frame.clone());
            }
        }
        self.cancel.cancel();
    }

    fn is_linked(&self, peer: PeerId) -> bool {
        self.links.read().contains_key(&peer)
    }

    fn attach(&self, greeting: &Greeting, tx: mpsc::UnboundedSender<BytesMut>) -> u64 {
        let peer = greeting.peer;
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let mut links = self.links.write();
        if !links.contains_key(&peer) {
            introduce(&links, greeting, &tx);
        }
        let entry = links.entry(peer).or_default();
        entry.push(Link {
            id,
            addr: greeting.addr,
            caps: greeting.caps,
            tx,
        });
        if entry.len() == 1 {
            // Emitted under the lock so joins and departures stay ordered.
            self.metrics.connected_peers.fetch_add(1, Ordering::Relaxed);
            self.joined.send_modify(|n| *n += 1);
            let _ = self.upstream.events.send(TransportEvent::PeerJoined(peer));
            info!(%peer, addr = %greeting.addr, "peer connected");
        } else {
            debug!(%peer, links = entry.len(), "additional link to peer");
        }
        id
    }

    fn detach(&self, peer: PeerId, id: u64) {
        let mut links = self.links.write();
        let Some(entry) = links.get_mut(&peer) else {
            return;
        };
        entry.retain(|link| link.id != id);
        if entry.is_empty() {
            links.remove(&peer);
            self.metrics.connected_peers.fetch_sub(1, Ordering::Relaxed);
            self.joined.send_modify(|n| *n = n.saturating_sub(1));
            let _ = self.upstream.events.send(TransportEvent::PeerDeparted(peer));
            info!(%peer, "peer disconnected");
        }
    }

    fn send_to(&self, peer: PeerId, frame: BytesMut) -> Result<(), TransportError> {
        let links = self.links.read();
        let link = links
            .get(&peer)
            .and_then(|l| l.first())
            .ok_or(TransportError::UnknownPeer(peer))?;
        link.tx
            .send(frame)
            .map_err(|_| TransportError::LinkClosed(peer))
    }

    /// Runs an established link until any of its tasks ends.
    async fn run_link(&self, greeting: Greeting, reader: OwnedReadHalf, writer: OwnedWriteHalf) {
        let peer = greeting.peer;
        let link_cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel::<BytesMut>();
        let last_activity = Arc::new(AtomicU64::new(epoch_ms()));
        let link_id = self.attach(&greeting, tx.clone());

        let writer_handle = spawn_link_task(
            &link_cancel,
            link_writer(rx, writer, link_cancel.clone(), self.metrics.clone()),
        );
        let reader_handle = spawn_link_task(
            &link_cancel,
            link_reader(
                reader,
                tx.clone(),
                peer,
                self.upstream.clone(),
                link_cancel.clone(),
                self.metrics.clone(),
                last_activity.clone(),
            ),
        );
        let heartbeat_handle = spawn_link_task(
            &link_cancel,
            heartbeat_task(tx, peer, link_cancel.clone(), last_activity),
        );

        // Whichever task ends first takes the whole link down.
        link_cancel.cancelled().await;
        self.detach(peer, link_id);
        let _ = writer_handle.await;
        let _ = reader_handle.await;
        let _ = heartbeat_handle.await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                () = self.cancel.cancelled() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let mesh = self.clone();
                    self.tasks
                        .spawn(async move { mesh.handle_inbound(stream, addr).await });
                }
                Err(e) => {
                    warn!("mesh accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_inbound(&self, stream: TcpStream, addr: SocketAddr) {
        tune_socket(&stream);
        let (mut reader, mut writer) = stream.into_split();

        let greeting = match read_hello(&mut reader).await {
            Ok(greeting) => greeting,
            Err(e) => {
                warn!(%addr, "rejected inbound mesh link: {e}");
                return;
            }
        };
        let peer = greeting.peer;
        // Answer even ourselves, so a dialer reaching its own port can tell.
        if let Err(e) = send_hello(&mut writer, self.local, self.local_addr.port()).await {
            warn!(%addr, %peer, "cannot answer HELLO: {e}");
            return;
        }
        if peer == self.local {
            debug!(%addr, "ignoring inbound link from ourselves");
            return;
        }

        info!(%addr, %peer, version = greeting.version, caps = greeting.caps, "accepted mesh link");
        self.run_link(greeting, reader, writer).await;
    }

    async fn dial(&self, addr: &str) -> Result<Dialed, LinkError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| LinkError::Timeout)??;
        tune_socket(&stream);
        let (mut reader, mut writer) = stream.into_split();

        send_hello(&mut writer, self.local, self.local_addr.port()).await?;
        let greeting = read_hello(&mut reader).await?;
        if greeting.peer == self.local {
            return Ok(Dialed::SelfLink);
        }
        info!(
            addr,
            peer = %greeting.peer,
            version = greeting.version,
            caps = greeting.caps,
            "dialed mesh peer"
        );
        Ok(Dialed::Connected {
            greeting,
            reader,
            writer,
        })
    }

    async fn dial_loop(self: Arc<Self>, seed: String) {
        let mut policy = ReconnectPolicy::new();

        loop {
            if let Some(wait) = policy.gate() {
                info!(seed, "circuit open, next attempt in {:.0}s", wait.as_secs_f64());
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = self.cancel.cancelled() => break,
                }
            }

            let outcome = tokio::select! {
                r = self.dial(&seed) => r,
                () = self.cancel.cancelled() => break,
            };

            let delay = match outcome {
                Ok(Dialed::Connected {
                    greeting,
                    reader,
                    writer,
                }) => {
                    policy.on_success();
                    self.run_link(greeting, reader, writer).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    policy.retry_delay()
                }
                Ok(Dialed::SelfLink) => {
                    info!(seed, "seed address is this node, not dialing it");
                    break;
                }
                Err(e) => {
                    let delay = policy.on_failure();
                    debug!(seed, "dial failed: {e}, retry in {:.1}s", delay.as_secs_f64());
                    delay
                }
            };

            self.metrics.mesh_reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => break,
            }
        }
    }

    /// Starts one dial task per newly learned peer.
    async fn discovery_loop(
        self: Arc<Self>,
        mut discovered: mpsc::UnboundedReceiver<Vec<(PeerId, SocketAddr)>>,
    ) {
        loop {
            let batch = tokio::select! {
                b = discovered.recv() => b,
                () = self.cancel.cancelled() => break,
            };
            let Some(batch) = batch else { break };
            for (peer, addr) in batch {
                if peer == self.local || self.is_linked(peer) {
                    continue;
                }
                if !self.dialing.lock().insert(peer) {
                    continue;
                }
                debug!(%peer, %addr, "learned mesh peer, dialing");
                self.tasks.spawn(self.clone().dial_learned(peer, addr));
            }
        }
    }

    /// Dials a learned peer until some link to it exists. Unlike seeds, a
    /// learned peer is given up after `LEARNED_DIAL_ATTEMPTS` failures in a row.
    async fn dial_learned(self: Arc<Self>, peer: PeerId, addr: SocketAddr) {
        let target = addr.to_string();
        let mut policy = ReconnectPolicy::new();
        let mut failures = 0;

        while failures < LEARNED_DIAL_ATTEMPTS && !self.is_linked(peer) {
            let outcome = tokio::select! {
                r = self.dial(&target) => r,
                () = self.cancel.cancelled() => break,
            };

            let delay = match outcome {
                Ok(Dialed::Connected {
                    greeting,
                    reader,
                    writer,
                }) => {
                    failures = 0;
                    policy.on_success();
                    let remote = greeting.peer;
                    self.run_link(greeting, reader, writer).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    if remote != peer {
                        debug!(%peer, %remote, %addr, "learned address belongs to another peer");
                        break;
                    }
                    policy.retry_delay()
                }
                Ok(Dialed::SelfLink) => break,
                Err(e) => {
                    failures += 1;
                    let delay = policy.on_failure();
                    debug!(%peer, %addr, failures, "dial failed: {e}");
                    delay
                }
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => break,
            }
        }

        if failures >= LEARNED_DIAL_ATTEMPTS {
            info!(%peer, %addr, "giving up on learned peer");
        }
        self.dialing.lock().remove(&peer);
    }
}

/// Tells a peer joining over its first link about every other linked peer,
/// and every other peer about it.
fn introduce(
    links: &AHashMap<PeerId, Vec<Link>>,
    greeting: &Greeting,
    tx: &mpsc::UnboundedSender<BytesMut>,
) {
    let mut announce = BytesMut::new();
    encode_peers(&mut announce, &[(greeting.peer, greeting.addr)]);

    let mut known = Vec::with_capacity(links.len());
    for (other, other_links) in links {
        let Some(link) = other_links.first() else {
            continue;
        };
        known.push((*other, link.addr));
        if link.caps & CAP_PEERS != 0 {
            let _ = link.tx.send(announce.clone());
        }
    }

    if !known.is_empty() && greeting.caps & CAP_PEERS != 0 {
        let mut frame = BytesMut::new();
        encode_peers(&mut frame, &known);
        let _ = tx.send(frame);
    }
}

impl PeerTransport for MeshTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn broadcast(&self, payload: Bytes) {
        let mut frame = BytesMut::new();
        encode_gossip(&mut frame, &payload);
        for (peer, links) in self.links.read().iter() {
            if let Some(link) = links.first()
                && link.tx.send(frame.clone()).is_err()
            {
                debug!(%peer, "broadcast to closing link dropped");
            }
        }
    }

    fn unicast(&self, peer: PeerId, payload: Bytes) -> Result<(), TransportError> {
        let mut frame = BytesMut::new();
        encode_direct(&mut frame, &payload);
        self.send_to(peer, frame)
    }
}
