//! One client connection: handshake, read loop, delivery loop, teardown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{CONNACK_ACCEPTED, MqttCodec, Packet, Publish, SUBACK_FAILURE};
use super::error::ConnectionError;
use super::server::BrokerContext;
use super::topic::{TopicKey, validate_topic};
use super::types::{ConnectionHandle, PublishMessage};

type Reader = FramedRead<OwnedReadHalf, MqttCodec>;
type Writer = FramedWrite<OwnedWriteHalf, MqttCodec>;

/// Packets written per flush before the delivery loop yields to the socket.
const MAX_BATCH: usize = 64;

const GRANTED_QOS0: u8 = 0x00;

pub(crate) async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: Arc<BrokerContext>) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, MqttCodec::new(ctx.settings.max_packet_size));
    let mut writer = FramedWrite::new(write_half, MqttCodec::new(ctx.settings.max_packet_size));

    let (username, client_id) = match handshake(&mut reader, &ctx).await {
        Ok(accepted) => accepted,
        Err(ConnectionError::Cancelled) => {
            debug!(%addr, "shutdown before CONNECT");
            return;
        }
        Err(e) => {
            ctx.metrics
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            info!(%addr, "handshake rejected: {e}");
            return;
        }
    };

    let ack = Packet::ConnAck {
        session_present: false,
        code: CONNACK_ACCEPTED,
    };
    if let Err(e) = writer.send(ack).await {
        debug!(%addr, "CONNACK write failed: {e}");
        return;
    }

    let session = Session::open(ctx, username, writer);
    info!(conn_id = %session.handle.id, %addr, client_id = %client_id, "client connected");
    let result = session.read_loop(&mut reader).await;
    session.close(result).await;
}

/// Waits for CONNECT. Returns the username and client id.
async fn handshake(reader: &mut Reader, ctx: &BrokerContext) -> Result<(Bytes, String), ConnectionError> {
    let idle = ctx.settings.idle_timeout;
    let first = tokio::select! {
        r = tokio::time::timeout(idle, reader.next()) => r.map_err(|_| ConnectionError::IdleTimeout(idle))?,
        () = ctx.shutdown.cancelled() => return Err(ConnectionError::Cancelled),
    };
    match first {
        Some(Ok(Packet::Connect(connect))) => match connect.username {
            Some(username) if !username.is_empty() => Ok((username, connect.client_id)),
            _ => Err(ConnectionError::Handshake("username required")),
        },
        Some(Ok(_)) => Err(ConnectionError::Handshake("first packet was not CONNECT")),
        Some(Err(e)) => Err(e.into()),
        None => Err(ConnectionError::Handshake("closed before CONNECT")),
    }
}

struct Session {
    ctx: Arc<BrokerContext>,
    handle: ConnectionHandle,
    /// Protocol replies. Unbounded so acks are never dropped.
    control: mpsc::UnboundedSender<Packet>,
    cancel: CancellationToken,
    delivery: JoinHandle<Result<(), ConnectionError>>,
}

impl Session {
    fn open(ctx: Arc<BrokerContext>, username: Bytes, writer: Writer) -> Self {
        let id = ctx.registry.next_id();
        let handle = ConnectionHandle::new(id, ctx.identity.peer, username);
        let (queue_tx, queue_rx) = mpsc::channel(ctx.settings.queue_capacity);
        let (control, control_rx) = mpsc::unbounded_channel();
        let cancel = ctx.shutdown.child_token();

        ctx.registry.register(id, queue_tx);
        ctx.metrics
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        ctx.metrics.connections_active.fetch_add(1, Ordering::Relaxed);

        let delivery = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let result = delivery_loop(writer, queue_rx, control_rx, cancel.clone()).await;
                if result.is_err() {
                    // Wake the read loop so teardown runs.
                    cancel.cancel();
                }
                result
            }
        });

        Self {
            ctx,
            handle,
            control,
            cancel,
            delivery,
        }
    }

    fn reply(&self, packet: Packet) {
        // A closed channel means the writer already failed and teardown is on its way.
        let _ = self.control.send(packet);
    }

    async fn read_loop(&self, reader: &mut Reader) -> Result<(), ConnectionError> {
        let idle = self.ctx.settings.idle_timeout;
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return Err(ConnectionError::Cancelled),
                r = tokio::time::timeout(idle, reader.next()) => r,
            };
            let packet = match next {
                Err(_) => return Err(ConnectionError::IdleTimeout(idle)),
                Ok(None) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(packet))) => packet,
            };

            match packet {
                Packet::Subscribe { packet_id, filters } => {
                    let codes = filters
                        .iter()
                        .map(|(topic, _qos)| self.subscribe(topic))
                        .collect();
                    self.reply(Packet::SubAck { packet_id, codes });
                }
                Packet::Unsubscribe { packet_id, topics } => {
                    for topic in &topics {
                        self.unsubscribe(topic);
                    }
                    self.reply(Packet::UnsubAck { packet_id });
                }
                Packet::Publish(publish) => self.publish(publish)?,
                Packet::PingReq => self.reply(Packet::PingResp),
                Packet::Disconnect => return Ok(()),
                Packet::Connect(_) => return Err(ConnectionError::Protocol("duplicate CONNECT")),
                _ => return Err(ConnectionError::Protocol("unexpected packet from client")),
            }
        }
    }

    /// Returns the SUBACK code for `topic`.
    fn subscribe(&self, topic: &str) -> u8 {
        if let Err(e) = validate_topic(topic.as_bytes()) {
            debug!(conn_id = %self.handle.id, topic, "subscription refused: {e}");
            return SUBACK_FAILURE;
        }
        let key = TopicKey::of(topic.as_bytes());
        if self.ctx.local.subscribe(key, &self.handle) {
            self.ctx.cluster.subscribe(key, &self.handle);
            debug!(conn_id = %self.handle.id, topic_key = %key, topic, "subscribed");
        }
        GRANTED_QOS0
    }

    fn unsubscribe(&self, topic: &str) {
        let key = TopicKey::of(topic.as_bytes());
        if self.ctx.local.unsubscribe(key, &self.handle) {
            self.ctx.cluster.unsubscribe(key, &self.handle);
            debug!(conn_id = %self.handle.id, topic_key = %key, topic, "unsubscribed");
        }
    }

    fn publish(&self, publish: Publish) -> Result<(), ConnectionError> {
        if publish.qos > 1 {
            return Err(ConnectionError::Protocol("QoS 2 is not supported"));
        }
        if validate_topic(&publish.topic).is_err() {
            return Err(ConnectionError::Protocol("invalid publish topic"));
        }
        let msg = PublishMessage::new(publish.topic, publish.payload, self.ctx.identity.peer);
        let report = self.ctx.router.route(&msg);
        debug!(
            conn_id = %self.handle.id,
            topic_key = %msg.key,
            delivered = report.delivered,
            forwarded = report.forwarded,
            "publish routed"
        );
        // Acked after routing: delivery stays best-effort, the ack only stops retransmits.
        if publish.qos == 1
            && let Some(packet_id) = publish.packet_id
        {
            self.reply(Packet::PubAck { packet_id });
        }
        Ok(())
    }

    /// Unsubscribe everywhere, then release the id, then wait for the writer.
    async fn close(self, read_result: Result<(), ConnectionError>) {
        let id = self.handle.id;
        self.cancel.cancel();

        let keys = self.ctx.local.remove_connection(&self.handle);
        self.ctx.cluster.remove_connection(&self.handle, &keys);
        self.ctx.registry.release(id);

        let write_result = match self.delivery.await {
            Ok(result) => result,
            Err(e) => {
                warn!(conn_id = %id, "delivery task panicked: {e}");
                Ok(())
            }
        };
        self.ctx
            .metrics
            .connections_active
            .fetch_sub(1, Ordering::Relaxed);

        // A write failure cancels the reader, so it is the real cause.
        let outcome = match (read_result, write_result) {
            (Err(ConnectionError::Cancelled), Err(e)) => Err(e),
            (read, _) => read,
        };
        match outcome {
            Ok(()) => info!(conn_id = %id, topics = keys.len(), "client disconnected"),
            Err(ConnectionError::Cancelled) => debug!(conn_id = %id, "connection closed by broker"),
            Err(ConnectionError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!(conn_id = %id, topics = keys.len(), "client went away")
            }
            Err(e) => info!(conn_id = %id, topics = keys.len(), "connection closed: {e}"),
        }
    }
}

fn outbound(msg: PublishMessage) -> Packet {
    Packet::Publish(Publish::qos0(msg.topic, msg.payload))
}

/// Drains the control channel and the delivery queue into the socket.
/// Control packets go first; pending packets are coalesced into one flush.
async fn delivery_loop(
    mut writer: Writer,
    mut queue: mpsc::Receiver<PublishMessage>,
    mut control: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    loop {
        let first = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            Some(packet) = control.recv() => packet,
            Some(msg) = queue.recv() => outbound(msg),
            else => return Ok(()),
        };
        writer.feed(first).await?;

        let mut batched = 1;
        while batched < MAX_BATCH {
            let next = match control.try_recv() {
                Ok(packet) => packet,
                Err(_) => match queue.try_recv() {
                    Ok(msg) => outbound(msg),
                    Err(_) => break,
                },
            };
            writer.feed(next).await?;
            batched += 1;
        }
        writer.flush().await?;
    }
}
