//! Upstream transport: the RakNet server the game clients connect to.
//!
//! A tokio task owns the UDP socket and every client's reliable link.
//! It talks to the tick loop only through channels: [`TransportEvent`]s
//! flow out, [`TransportCommand`]s flow in. The tick loop drains events
//! without blocking.

use crate::{
    config::NetworkConfig,
    protocol::GAME_PACKET_ID,
    raknet::{
        self, id,
        message::{self, OpenConnectionReply1, OpenConnectionReply2, OpenConnectionRequest1,
            OpenConnectionRequest2, UnconnectedPing, UnconnectedPong},
        DatagramFlags, ReliableLink, SESSION_TIMEOUT,
    },
};
use ahash::AHashMap;
use anyhow::Context;
use bytes::Bytes;
use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{net::UdpSocket, time};

pub type SessionId = u64;

/// Capacity of the worker -> tick loop queue.
const EVENT_QUEUE: usize = 4096;
const PING_INTERVAL: Duration = Duration::from_secs(5);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected {
        session_id: SessionId,
        address: SocketAddr,
        client_guid: u64,
    },
    /// A game payload, without the `0xFE` prefix.
    Packet { session_id: SessionId, payload: Bytes },
    Disconnected { session_id: SessionId, reason: String },
    Ping { session_id: SessionId, latency_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Sends a game payload; the `0xFE` prefix is added by the transport.
    Send { session_id: SessionId, payload: Vec<u8> },
    Close { session_id: SessionId },
    /// Replaces the advertised MOTD string.
    SetName(String),
    Shutdown,
}

/// Tick-loop side of the transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    events: flume::Receiver<TransportEvent>,
    commands: flume::Sender<TransportCommand>,
}

/// Worker side of the transport channels.
#[derive(Debug, Clone)]
pub struct TransportEndpoint {
    pub events: flume::Sender<TransportEvent>,
    pub commands: flume::Receiver<TransportCommand>,
}

/// Creates a connected handle/endpoint pair.
pub fn channel() -> (TransportHandle, TransportEndpoint) {
    let (events_tx, events_rx) = flume::bounded(EVENT_QUEUE);
    let (commands_tx, commands_rx) = flume::unbounded();
    (
        TransportHandle {
            events: events_rx,
            commands: commands_tx,
        },
        TransportEndpoint {
            events: events_tx,
            commands: commands_rx,
        },
    )
}

impl TransportHandle {
    /// Drains every queued event without blocking.
    pub fn poll(&self) -> Vec<TransportEvent> {
        self.events.try_iter().collect()
    }

    pub fn send(&self, session_id: SessionId, payload: Vec<u8>) {
        self.command(TransportCommand::Send { session_id, payload });
    }

    pub fn close(&self, session_id: SessionId) {
        self.command(TransportCommand::Close { session_id });
    }

    pub fn set_name(&self, name: String) {
        self.command(TransportCommand::SetName(name));
    }

    pub fn shutdown(&self) {
        self.command(TransportCommand::Shutdown);
    }

    fn command(&self, command: TransportCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Transport worker is gone, dropping command");
        }
    }
}

/// Binds the upstream socket and spawns the worker on the current runtime.
pub async fn bind(config: &NetworkConfig, server_guid: u64) -> anyhow::Result<(TransportHandle, SocketAddr)> {
    let address = format!("{}:{}", config.bind_address, config.bind_port);
    let socket = UdpSocket::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    let local_addr = socket.local_addr()?;
    let (handle, endpoint) = channel();
    let worker = Worker::new(socket, server_guid, config.max_mtu, endpoint);
    tokio::spawn(worker.run());
    tracing::info!("Listening on {local_addr}");
    Ok((handle, local_addr))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ClientState {
    /// Open connection handshake done, waiting for the connection request.
    Handshaking,
    Connected,
}

struct Client {
    session_id: SessionId,
    guid: u64,
    state: ClientState,
    link: ReliableLink,
    last_activity: Instant,
    last_ping: Instant,
}

struct Worker {
    socket: UdpSocket,
    server_guid: u64,
    max_mtu: u16,
    motd: String,
    endpoint: TransportEndpoint,
    clients: AHashMap<SocketAddr, Client>,
    sessions: AHashMap<SessionId, SocketAddr>,
    next_session_id: SessionId,
    started: Instant,
}

impl Worker {
    fn new(socket: UdpSocket, server_guid: u64, max_mtu: u16, endpoint: TransportEndpoint) -> Self {
        Self {
            socket,
            server_guid,
            max_mtu,
            motd: String::new(),
            endpoint,
            clients: AHashMap::new(),
            sessions: AHashMap::new(),
            next_session_id: 0,
            started: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }

    async fn run(mut self) {
        let mut buf = vec![0u8; usize::from(self.max_mtu) + 64];
        let mut housekeeping = time::interval(HOUSEKEEPING_INTERVAL);
        let commands = self.endpoint.commands.clone();

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if let Err(e) = self.handle_datagram(&buf[..len], peer).await {
                            tracing::debug!("Bad datagram from {peer}: {e}");
                        }
                    }
                    // ICMP port unreachable on some platforms.
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                    Err(e) => tracing::error!("Upstream socket error: {e}"),
                },
                command = commands.recv_async() => match command {
                    Ok(TransportCommand::Shutdown) | Err(_) => break,
                    Ok(command) => self.handle_command(command).await,
                },
                _ = housekeeping.tick() => self.housekeeping().await,
            }
        }

        let peers: Vec<SocketAddr> = self.clients.keys().copied().collect();
        for peer in peers {
            self.send_reliable(peer, &message::disconnection_notification()).await;
        }
        tracing::info!("Upstream transport stopped");
    }

    async fn send_raw(&self, peer: SocketAddr, datagram: &[u8]) {
        if let Err(e) = self.socket.send_to(datagram, peer).await {
            tracing::debug!("Failed to send to {peer}: {e}");
        }
    }

    async fn send_reliable(&mut self, peer: SocketAddr, payload: &[u8]) {
        let Some(client) = self.clients.get_mut(&peer) else {
            return;
        };
        for datagram in client.link.wrap(payload) {
            if let Err(e) = self.socket.send_to(&datagram, peer).await {
                tracing::debug!("Failed to send to {peer}: {e}");
            }
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.endpoint.events.send_async(event).await.is_err() {
            tracing::debug!("Tick loop is gone, dropping transport event");
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) -> Result<(), raknet::RakNetError> {
        let Some(&first) = datagram.first() else {
            return Ok(());
        };
        if self.clients.contains_key(&peer) && DatagramFlags::from_bits_truncate(first).contains(DatagramFlags::VALID) {
            return self.handle_online(datagram, peer).await;
        }

        match first {
            id::UNCONNECTED_PING | id::UNCONNECTED_PING_OPEN_CONNECTIONS => {
                let ping = UnconnectedPing::decode(datagram)?;
                let pong = UnconnectedPong {
                    time: ping.time,
                    server_guid: self.server_guid,
                    motd: self.motd.clone(),
                };
                self.send_raw(peer, &pong.encode()).await;
            }
            id::OPEN_CONNECTION_REQUEST_1 => {
                let request = OpenConnectionRequest1::decode(datagram)?;
                if request.protocol != raknet::PROTOCOL_VERSION {
                    tracing::debug!("{peer} uses RakNet protocol {}", request.protocol);
                    self.send_raw(peer, &message::incompatible_protocol(self.server_guid)).await;
                    return Ok(());
                }
                let reply = OpenConnectionReply1 {
                    server_guid: self.server_guid,
                    cookie: None,
                    mtu: request.mtu.min(self.max_mtu),
                };
                self.send_raw(peer, &reply.encode()).await;
            }
            id::OPEN_CONNECTION_REQUEST_2 => {
                let request = OpenConnectionRequest2::decode(datagram)?;
                let mtu = request.mtu.clamp(raknet::MIN_MTU, self.max_mtu);
                if let Some(old) = self.clients.remove(&peer) {
                    self.drop_session(old.session_id, "reconnected").await;
                }
                let session_id = self.next_session_id;
                self.next_session_id += 1;
                let now = Instant::now();
                self.clients.insert(
                    peer,
                    Client {
                        session_id,
                        guid: request.client_guid,
                        state: ClientState::Handshaking,
                        link: ReliableLink::new(mtu),
                        last_activity: now,
                        last_ping: now,
                    },
                );
                self.sessions.insert(session_id, peer);
                let reply = OpenConnectionReply2 {
                    server_guid: self.server_guid,
                    client_address: peer,
                    mtu,
                };
                self.send_raw(peer, &reply.encode()).await;
            }
            other => tracing::trace!("Ignoring offline message {other:#04x} from {peer}"),
        }
        Ok(())
    }

    async fn handle_online(&mut self, datagram: &[u8], peer: SocketAddr) -> Result<(), raknet::RakNetError> {
        let Some(client) = self.clients.get_mut(&peer) else {
            return Ok(());
        };
        client.last_activity = Instant::now();
        let received = client.link.receive(datagram)?;
        for reply in &received.replies {
            self.send_raw(peer, reply).await;
        }
        for payload in received.payloads {
            self.handle_message(&payload, peer).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, payload: &Bytes, peer: SocketAddr) -> Result<(), raknet::RakNetError> {
        let Some(&message_id) = payload.first() else {
            return Ok(());
        };
        let Some(client) = self.clients.get_mut(&peer) else {
            return Ok(());
        };
        let session_id = client.session_id;

        match message_id {
            id::CONNECTION_REQUEST => {
                let request = message::ConnectionRequest::decode(payload)?;
                let accepted = message::connection_request_accepted(peer, request.time, self.now());
                self.send_reliable(peer, &accepted).await;
            }
            id::NEW_INCOMING_CONNECTION => {
                if client.state == ClientState::Handshaking {
                    client.state = ClientState::Connected;
                    let client_guid = client.guid;
                    self.emit(TransportEvent::Connected {
                        session_id,
                        address: peer,
                        client_guid,
                    })
                    .await;
                }
            }
            id::CONNECTED_PING => {
                let ping_time = message::read_ping_time(payload)?;
                let pong = message::connected_pong(ping_time, self.now());
                self.send_reliable(peer, &pong).await;
            }
            id::CONNECTED_PONG => {
                let ping_time = message::read_ping_time(payload)?;
                let latency_ms = self.now().saturating_sub(ping_time);
                self.emit(TransportEvent::Ping { session_id, latency_ms }).await;
            }
            id::DISCONNECTION_NOTIFICATION => {
                self.clients.remove(&peer);
                self.drop_session(session_id, "client disconnect").await;
            }
            GAME_PACKET_ID if client.state == ClientState::Connected => {
                self.emit(TransportEvent::Packet {
                    session_id,
                    payload: payload.slice(1..),
                })
                .await;
            }
            other => tracing::trace!("Ignoring message {other:#04x} from {peer}"),
        }
        Ok(())
    }

    async fn drop_session(&mut self, session_id: SessionId, reason: &str) {
        self.sessions.remove(&session_id);
        self.emit(TransportEvent::Disconnected {
            session_id,
            reason: reason.to_owned(),
        })
        .await;
    }

    async fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Send { session_id, payload } => {
                let Some(&peer) = self.sessions.get(&session_id) else {
                    return;
                };
                let mut message = Vec::with_capacity(payload.len() + 1);
                message.push(GAME_PACKET_ID);
                message.extend_from_slice(&payload);
                self.send_reliable(peer, &message).await;
            }
            TransportCommand::Close { session_id } => {
                let Some(peer) = self.sessions.remove(&session_id) else {
                    return;
                };
                self.send_reliable(peer, &message::disconnection_notification()).await;
                self.clients.remove(&peer);
            }
            TransportCommand::SetName(name) => self.motd = name,
            TransportCommand::Shutdown => {}
        }
    }

    async fn housekeeping(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<SocketAddr> = self
            .clients
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_activity) > SESSION_TIMEOUT)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in timed_out {
            if let Some(client) = self.clients.remove(&peer) {
                tracing::debug!("Session {} timed out", client.session_id);
                self.drop_session(client.session_id, "timeout").await;
            }
        }

        let ping = message::connected_ping(self.now());
        let due: Vec<SocketAddr> = self
            .clients
            .iter_mut()
            .filter(|(_, c)| c.state == ClientState::Connected && now.duration_since(c.last_ping) >= PING_INTERVAL)
            .map(|(peer, c)| {
                c.last_ping = now;
                *peer
            })
            .collect();
        for peer in due {
            self.send_reliable(peer, &ping).await;
        }
    }
}

/// MOTD advertised in unconnected pongs.
pub fn motd_string(
    motd: &str,
    sub_motd: &str,
    protocol: i32,
    version: &str,
    online: usize,
    max: u32,
    server_guid: u64,
) -> String {
    let escape = |s: &str| s.replace(';', "\\;");
    format!(
        "MCPE;{};{protocol};{version};{online};{max};{server_guid};{};Survival;",
        escape(motd),
        escape(sub_motd)
    )
}
