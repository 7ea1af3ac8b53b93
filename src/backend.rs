//! Client side of RakNet, one per player, for the link to a backend
//! server.
//!
//! The socket is non-blocking and driven by [`BackendRakClient::tick`]
//! from the tick loop; no thread or task is spawned per connection.

use crate::{
    protocol::{
        batch::encode_batch,
        compression::{CompressionState, ZlibCompressor},
        packet::{GamePacket, RequestNetworkSettings},
        GAME_PACKET_ID,
    },
    raknet::{
        self, id,
        message::{self, ConnectionRequest, OpenConnectionReply1, OpenConnectionReply2,
            OpenConnectionRequest1, OpenConnectionRequest2, UnconnectedPing},
        DatagramFlags, RakNetError, ReliableLink,
    },
    server::BackendServer,
};
use bytes::Bytes;
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

/// Interval between open connection request 1 retries.
pub const OCR1_RETRY_INTERVAL: Duration = Duration::from_millis(500);
/// Request 1 attempts per MTU candidate before trying the next size.
pub const OCR1_ATTEMPTS_PER_MTU: u32 = 4;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Connection progress. Only ever advances, except back to
/// `Unconnected` on close.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum::AsRefStr)]
pub enum BackendState {
    Unconnected,
    Connecting1,
    Connecting2,
    Connecting3,
    Connected,
    GameHandshake,
    LoggedIn,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    RakNet(#[from] RakNetError),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("backend uses an incompatible RakNet protocol")]
    IncompatibleProtocol,
    #[error("backend closed the connection")]
    Closed,
    #[error("address of backend {0} is not resolved")]
    Unresolved(String),
}

/// A game payload received from the backend, without the `0xFE` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPayload {
    /// How the payload is framed: `Pending` for the network settings reply,
    /// which carries no compression indicator.
    pub compression: CompressionState,
    pub data: Bytes,
}

pub struct BackendRakClient {
    server_name: String,
    address: SocketAddr,
    socket: UdpSocket,
    state: BackendState,
    guid: u64,
    protocol: i32,
    compressor: ZlibCompressor,
    link: ReliableLink,
    mtu_candidates: [u16; 3],
    mtu_index: usize,
    attempts: u32,
    last_attempt: Instant,
    started: Instant,
    last_activity: Instant,
    last_ping: Instant,
    cookie: Option<u32>,
    /// Serialized game packets held until `LoggedIn`.
    queue: Vec<Vec<u8>>,
    pending_error: Option<BackendError>,
    latency_ms: Option<u64>,
}

impl BackendRakClient {
    /// Opens a socket towards `server` and starts the handshake.
    ///
    /// Only the server's cached address is used; no DNS lookup happens
    /// here.
    pub fn connect(
        server: &BackendServer,
        protocol: i32,
        compressor: ZlibCompressor,
        max_mtu: u16,
    ) -> Result<Self, BackendError> {
        let address = server
            .resolved_addr()
            .ok_or_else(|| BackendError::Unresolved(server.name().to_owned()))?;
        let bind: SocketAddr = if address.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(address)?;
        socket.set_nonblocking(true)?;

        let now = Instant::now();
        let mtu_candidates = raknet::mtu_candidates(max_mtu);
        let mut client = Self {
            server_name: server.name().to_owned(),
            address,
            socket,
            state: BackendState::Unconnected,
            guid: rand::random(),
            protocol,
            compressor,
            link: ReliableLink::new(mtu_candidates[0]),
            mtu_candidates,
            mtu_index: 0,
            attempts: 0,
            last_attempt: now,
            started: now,
            last_activity: now,
            last_ping: now,
            cookie: None,
            queue: Vec::new(),
            pending_error: None,
            latency_ms: None,
        };

        let ping = UnconnectedPing {
            time: client.now(),
            client_guid: client.guid,
        };
        client.send_raw(&ping.encode())?;
        client.send_request1()?;
        tracing::debug!(server = %client.server_name, "Connecting to backend {address}");
        Ok(client)
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn mtu(&self) -> u16 {
        self.link.mtu()
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }

    /// Sends a game packet, or queues it until the backend login completes.
    pub fn send_packet(&mut self, packet: &GamePacket) {
        self.send_serialized(packet.to_bytes());
    }

    pub fn send_serialized(&mut self, packet: Vec<u8>) {
        if self.state < BackendState::LoggedIn {
            self.queue.push(packet);
            return;
        }
        if let Err(e) = self.send_batch(&[packet]) {
            self.pending_error.get_or_insert(e);
        }
    }

    fn send_batch(&mut self, packets: &[Vec<u8>]) -> Result<(), BackendError> {
        let batch = encode_batch(packets.iter().map(Vec::as_slice));
        let payload = self.compressor.encode_payload(CompressionState::Enabled, batch)?;
        self.send_game_payload(&payload)
    }

    fn send_game_payload(&mut self, payload: &[u8]) -> Result<(), BackendError> {
        let mut message = Vec::with_capacity(payload.len() + 1);
        message.push(GAME_PACKET_ID);
        message.extend_from_slice(payload);
        self.send_reliable(&message)
    }

    fn send_reliable(&mut self, message: &[u8]) -> Result<(), BackendError> {
        for datagram in self.link.wrap(message) {
            self.send_raw(&datagram)?;
        }
        Ok(())
    }

    fn send_raw(&self, datagram: &[u8]) -> Result<(), BackendError> {
        match self.socket.send(datagram) {
            Ok(_) => Ok(()),
            // Dropped like any other lost datagram.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn send_request1(&mut self) -> Result<(), BackendError> {
        let request = OpenConnectionRequest1 {
            protocol: raknet::PROTOCOL_VERSION,
            mtu: self.mtu_candidates[self.mtu_index],
        };
        self.send_raw(&request.encode())?;
        self.last_attempt = Instant::now();
        self.state = BackendState::Connecting1;
        Ok(())
    }

    /// Reads every pending datagram and advances timers. Returns the game
    /// payloads received this tick.
    pub fn tick(&mut self) -> Result<Vec<BackendPayload>, BackendError> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        if self.state == BackendState::Unconnected {
            return Err(BackendError::Closed);
        }

        let mut payloads = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(len) => {
                    self.last_activity = Instant::now();
                    self.handle_datagram(&buf[..len], &mut payloads)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        self.check_timers()?;
        Ok(payloads)
    }

    fn check_timers(&mut self) -> Result<(), BackendError> {
        let now = Instant::now();
        if self.state < BackendState::Connected {
            if now.duration_since(self.started) > CONNECT_TIMEOUT {
                return Err(BackendError::Timeout("handshake"));
            }
            if self.state == BackendState::Connecting1
                && now.duration_since(self.last_attempt) >= OCR1_RETRY_INTERVAL
            {
                self.attempts += 1;
                if self.attempts >= OCR1_ATTEMPTS_PER_MTU {
                    self.attempts = 0;
                    self.mtu_index += 1;
                    if self.mtu_index >= self.mtu_candidates.len() {
                        return Err(BackendError::Timeout("open connection request"));
                    }
                    tracing::debug!(
                        server = %self.server_name,
                        "Retrying with MTU {}",
                        self.mtu_candidates[self.mtu_index]
                    );
                }
                self.send_request1()?;
            }
            return Ok(());
        }

        if now.duration_since(self.last_activity) > IDLE_TIMEOUT {
            return Err(BackendError::Timeout("no traffic from backend"));
        }
        if now.duration_since(self.last_ping) >= KEEPALIVE_INTERVAL {
            self.last_ping = now;
            let ping = message::connected_ping(self.now());
            self.send_reliable(&ping)?;
        }
        Ok(())
    }

    fn handle_datagram(&mut self, datagram: &[u8], payloads: &mut Vec<BackendPayload>) -> Result<(), BackendError> {
        let Some(&first) = datagram.first() else {
            return Ok(());
        };

        if DatagramFlags::from_bits_truncate(first).contains(DatagramFlags::VALID) {
            if self.state < BackendState::Connecting3 {
                return Ok(());
            }
            let received = self.link.receive(datagram)?;
            for reply in &received.replies {
                self.send_raw(reply)?;
            }
            for message in received.payloads {
                self.handle_message(message, payloads)?;
            }
            return Ok(());
        }

        match first {
            id::OPEN_CONNECTION_REPLY_1 if self.state == BackendState::Connecting1 => {
                let reply = OpenConnectionReply1::decode(datagram)?;
                let mtu = self.mtu_candidates[self.mtu_index].min(reply.mtu);
                self.link.set_mtu(mtu);
                self.cookie = reply.cookie;
                let request = OpenConnectionRequest2 {
                    cookie: self.cookie,
                    server_address: self.address,
                    mtu,
                    client_guid: self.guid,
                };
                self.send_raw(&request.encode())?;
                self.state = BackendState::Connecting2;
            }
            id::OPEN_CONNECTION_REPLY_2 if self.state == BackendState::Connecting2 => {
                let reply = OpenConnectionReply2::decode(datagram)?;
                self.link.set_mtu(reply.mtu.min(self.link.mtu()));
                let request = ConnectionRequest {
                    client_guid: self.guid,
                    time: self.now(),
                };
                self.send_reliable(&request.encode())?;
                self.state = BackendState::Connecting3;
            }
            id::INCOMPATIBLE_PROTOCOL_VERSION => return Err(BackendError::IncompatibleProtocol),
            _ => {}
        }
        Ok(())
    }

    fn handle_message(&mut self, message: Bytes, payloads: &mut Vec<BackendPayload>) -> Result<(), BackendError> {
        let Some(&message_id) = message.first() else {
            return Ok(());
        };
        match message_id {
            id::CONNECTION_REQUEST_ACCEPTED if self.state == BackendState::Connecting3 => {
                self.state = BackendState::Connected;
                let time = self.now();
                self.send_reliable(&message::new_incoming_connection(self.address, time, time))?;

                let request = GamePacket::from(RequestNetworkSettings {
                    protocol: self.protocol,
                })
                .to_bytes();
                let batch = encode_batch([request.as_slice()]);
                let payload = self.compressor.encode_payload(CompressionState::Pending, batch)?;
                self.send_game_payload(&payload)?;
                self.state = BackendState::GameHandshake;
                tracing::debug!(server = %self.server_name, "Backend connection accepted");
            }
            id::CONNECTED_PING => {
                let ping_time = message::read_ping_time(&message)?;
                self.send_reliable(&message::connected_pong(ping_time, self.now()))?;
            }
            id::CONNECTED_PONG => {
                let ping_time = message::read_ping_time(&message)?;
                self.latency_ms = Some(self.now().saturating_sub(ping_time));
            }
            id::DISCONNECTION_NOTIFICATION => {
                self.state = BackendState::Unconnected;
                return Err(BackendError::Closed);
            }
            GAME_PACKET_ID if self.state >= BackendState::GameHandshake => {
                let compression = if self.state == BackendState::GameHandshake {
                    self.state = BackendState::LoggedIn;
                    CompressionState::Pending
                } else {
                    CompressionState::Enabled
                };
                payloads.push(BackendPayload {
                    compression,
                    data: message.slice(1..),
                });
                if compression == CompressionState::Pending && !self.queue.is_empty() {
                    let queued = std::mem::take(&mut self.queue);
                    self.send_batch(&queued)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Closes the connection, notifying the backend if the handshake got
    /// far enough for it to know about us.
    pub fn disconnect(&mut self) {
        if self.state >= BackendState::Connected {
            if let Err(e) = self.send_reliable(&message::disconnection_notification()) {
                tracing::debug!(server = %self.server_name, "Failed to send disconnect: {e}");
            }
        }
        self.state = BackendState::Unconnected;
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{
            batch::Payload,
            compression::CompressionThreshold,
            packet::{NetworkSettings, PlayStatus},
        },
        transport::{self, TransportEvent},
    };
    use std::collections::VecDeque;
    use tokio::time;

    fn compressor() -> ZlibCompressor {
        ZlibCompressor::new(7, CompressionThreshold::new(0), 1 << 20)
    }

    struct FakeBackend {
        handle: transport::TransportHandle,
        events: VecDeque<TransportEvent>,
    }

    impl FakeBackend {
        /// Ticks `client` until the backend sees an event.
        async fn next_event(&mut self, client: &mut BackendRakClient, out: &mut Vec<BackendPayload>) -> TransportEvent {
            for _ in 0..400 {
                if let Some(event) = self.events.pop_front() {
                    return event;
                }
                if client.state() != BackendState::Unconnected {
                    out.extend(client.tick().unwrap());
                }
                self.events.extend(self.handle.poll());
                time::sleep(Duration::from_millis(5)).await;
            }
            panic!("no transport event");
        }
    }

    fn decode_single(compressor: &ZlibCompressor, state: CompressionState, payload: &[u8]) -> GamePacket {
        let batch = compressor.decode_payload(state, payload).unwrap();
        let packets: Vec<_> = Payload::parse(&batch).packets().collect::<Result<_, _>>().unwrap();
        assert_eq!(packets.len(), 1);
        GamePacket::decode(packets[0]).unwrap()
    }

    /// Uses the upstream transport as a stand-in backend server.
    #[tokio::test]
    async fn handshake_login_and_queue_drain() {
        let network = crate::config::NetworkConfig {
            bind_address: "127.0.0.1".to_owned(),
            bind_port: 0,
            ..Default::default()
        };
        let (handle, addr) = transport::bind(&network, 77).await.unwrap();
        let mut backend = FakeBackend {
            handle,
            events: VecDeque::new(),
        };
        let server = BackendServer::new("lobby", "127.0.0.1", addr.port(), 0);
        let compressor = compressor();

        let mut client = BackendRakClient::connect(&server, 860, compressor.clone(), 1400).unwrap();
        client.send_packet(&PlayStatus::new(PlayStatus::LOGIN_SUCCESS).into());
        assert_eq!(client.queued(), 1);

        let mut received = Vec::new();
        let session_id = match backend.next_event(&mut client, &mut received).await {
            TransportEvent::Connected { session_id, .. } => session_id,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(client.state(), BackendState::GameHandshake);

        match backend.next_event(&mut client, &mut received).await {
            TransportEvent::Packet { payload, .. } => {
                match decode_single(&compressor, CompressionState::Pending, &payload) {
                    GamePacket::RequestNetworkSettings(request) => assert_eq!(request.protocol, 860),
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }

        let settings = GamePacket::from(NetworkSettings {
            compression_threshold: NetworkSettings::COMPRESS_EVERYTHING,
            compression_algorithm: 0,
            enable_client_throttling: false,
            client_throttle_threshold: 0,
            client_throttle_scalar: 0.0,
        })
        .to_bytes();
        backend.handle.send(session_id, encode_batch([settings.as_slice()]));

        match backend.next_event(&mut client, &mut received).await {
            TransportEvent::Packet { payload, .. } => {
                assert_eq!(payload[0], 0x00);
                match decode_single(&compressor, CompressionState::Enabled, &payload) {
                    GamePacket::PlayStatus(status) => assert_eq!(status.status, PlayStatus::LOGIN_SUCCESS),
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.state(), BackendState::LoggedIn);
        assert_eq!(client.queued(), 0);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].compression, CompressionState::Pending);

        client.disconnect();
        assert!(matches!(
            backend.next_event(&mut client, &mut received).await,
            TransportEvent::Disconnected { .. }
        ));
        backend.handle.shutdown();
    }

    #[test]
    fn unreachable_backend_times_out() {
        // Bound but never answering.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        let server = BackendServer::new("dead", "127.0.0.1", port, 0);
        let mut client = BackendRakClient::connect(&server, 860, compressor(), 1400).unwrap();
        client.started -= CONNECT_TIMEOUT + Duration::from_secs(1);
        assert!(matches!(client.tick(), Err(BackendError::Timeout(_))));
    }

    #[test]
    fn unresolved_host_name_is_not_looked_up_on_connect() {
        let server = BackendServer::new("hub", "backend.invalid", 19132, 0);
        assert!(matches!(
            BackendRakClient::connect(&server, 860, compressor(), 1400),
            Err(BackendError::Unresolved(name)) if name == "hub"
        ));
    }

    #[test]
    fn request1_walks_mtu_candidates() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        let server = BackendServer::new("quiet", "127.0.0.1", port, 0);
        let mut client = BackendRakClient::connect(&server, 860, compressor(), 1400).unwrap();

        for _ in 0..OCR1_ATTEMPTS_PER_MTU {
            client.last_attempt -= OCR1_RETRY_INTERVAL;
            client.tick().unwrap();
        }
        assert_eq!(client.mtu_index, 1);

        let mut buf = [0u8; 2048];
        silent.set_nonblocking(true).unwrap();
        let mut sizes = Vec::new();
        while let Ok((len, _)) = silent.recv_from(&mut buf) {
            if buf[0] == id::OPEN_CONNECTION_REQUEST_1 {
                sizes.push(len + raknet::UDP_OVERHEAD);
            }
        }
        assert_eq!(sizes.first(), Some(&1400));
        assert_eq!(sizes.last(), Some(&1200));
    }
}
