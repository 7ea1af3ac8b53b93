//! The tick loop and the state it shares with the packet handlers.
//!
//! Everything protocol-related runs on one thread: the loop polls the
//! upstream transport, drives every backend link, runs scheduled work and
//! flushes outbound queues, then sleeps until the next tick boundary.

use crate::{
    backend::BackendPayload,
    command::{CommandContext, CommandMap, CommandSender, PlayerEntry},
    config::ProxyConfig,
    event::{EventBus, PlayerQuitEvent, QueryRegenerateEvent, ServerStartEvent, ServerStopEvent},
    handler::{handle_backend_packet, handle_client_packet},
    lang::Translator,
    permission::PermissionManager,
    player::Player,
    protocol::{
        batch::Payload,
        compression::{CompressionThreshold, ZlibCompressor},
        packet::GamePacket,
        protocol_version_name, CURRENT_PROTOCOL,
    },
    resource_pack::ResourcePackManager,
    scheduler::{AsyncPool, TaskScheduler},
    server::{BackendServer, ServerManager},
    session::NetworkSession,
    transport::{motd_string, SessionId, TransportEvent, TransportHandle},
};
use ahash::AHashMap;
use anyhow::Context;
use std::{sync::Arc, time::Duration};
use tokio::time::{self, Instant};

pub const TICK_PERIOD: Duration = Duration::from_millis(50);
const MOTD_REFRESH_TICKS: u64 = 20;
const POOL_WORKERS: usize = 2;

/// Outcome of a fallback liveness probe, produced on a pool worker.
#[derive(Debug)]
struct ProbeResult {
    session_id: SessionId,
    server: Arc<BackendServer>,
    online: bool,
    reason: String,
}

/// Proxy-wide services handed to the handlers.
pub struct ProxyContext {
    pub config: ProxyConfig,
    pub compressor: ZlibCompressor,
    pub servers: ServerManager,
    pub packs: ResourcePackManager,
    pub translator: Box<dyn Translator>,
    pub permissions: PermissionManager,
    pub commands: CommandMap,
    pub events: EventBus,
    pub scheduler: TaskScheduler,
    pub pool: AsyncPool,
    /// Lowercase player name -> session.
    pub player_names: AHashMap<String, SessionId>,
    pub shutdown_requested: bool,
    probe_tx: flume::Sender<ProbeResult>,
    probe_rx: flume::Receiver<ProbeResult>,
}

impl ProxyContext {
    pub fn new(config: ProxyConfig, translator: Box<dyn Translator>, packs: ResourcePackManager) -> Self {
        let network = &config.network;
        let compressor = ZlibCompressor::new(
            network.compression_level,
            CompressionThreshold::new(network.compression_threshold),
            network.batch_limit,
        );
        let servers = ServerManager::from_config(config.game.selection_strategy, &config.game.backends);
        let permissions = PermissionManager::from_config(&config.permissions);
        let (probe_tx, probe_rx) = flume::unbounded();
        Self {
            config,
            compressor,
            servers,
            packs,
            translator,
            permissions,
            commands: CommandMap::with_defaults(),
            events: EventBus::new(),
            scheduler: TaskScheduler::new(),
            pool: AsyncPool::new(POOL_WORKERS),
            player_names: AHashMap::new(),
            shutdown_requested: false,
            probe_tx,
            probe_rx,
        }
    }

    pub fn translate(&self, key: &str, args: &[&str]) -> String {
        self.translator.translate(key, args)
    }

    /// Probes `server` off the tick thread; the result is applied to the
    /// player by the loop once it arrives.
    pub fn probe_fallback(&mut self, session_id: SessionId, server: Arc<BackendServer>, reason: String) {
        let timeout = self.servers.probe_timeout();
        let probed = Arc::clone(&server);
        let results = self.probe_tx.clone();
        self.pool.submit(
            move || probed.is_online(timeout),
            move |online| {
                let _ = results.send(ProbeResult {
                    session_id,
                    server,
                    online,
                    reason,
                });
            },
        );
    }

    fn take_probe_results(&self) -> Vec<ProbeResult> {
        self.probe_rx.try_iter().collect()
    }

    /// Runs a proxy command line. Returns whether a command was executed.
    pub fn dispatch_command(&mut self, sender: &mut CommandSender, line: &str, players: &[PlayerEntry]) -> bool {
        let mut context = CommandContext {
            translator: self.translator.as_ref(),
            permissions: &self.permissions,
            players,
            shutdown_requested: false,
        };
        let executed = self.commands.dispatch(sender, line, &mut context);
        if context.shutdown_requested {
            self.shutdown_requested = true;
        }
        executed
    }
}

/// Online players as listed by commands, sorted by name.
pub fn player_entries(players: &AHashMap<SessionId, Player>) -> Vec<PlayerEntry> {
    let mut entries: Vec<PlayerEntry> = players
        .values()
        .map(|player| PlayerEntry {
            name: player.name().to_owned(),
            server: player.backend_server().map(|server| server.name().to_owned()),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

pub struct ProxyLoop {
    ctx: ProxyContext,
    transport: TransportHandle,
    server_guid: u64,
    sessions: AHashMap<SessionId, NetworkSession>,
    players: AHashMap<SessionId, Player>,
    console: Option<flume::Receiver<String>>,
    ticks: u64,
}

impl ProxyLoop {
    pub fn new(ctx: ProxyContext, transport: TransportHandle, server_guid: u64) -> Self {
        Self {
            ctx,
            transport,
            server_guid,
            sessions: AHashMap::new(),
            players: AHashMap::new(),
            console: None,
            ticks: 0,
        }
    }

    /// Reads administrative command lines from `console`.
    pub fn with_console(mut self, console: flume::Receiver<String>) -> Self {
        self.console = Some(console);
        self
    }

    pub fn context(&self) -> &ProxyContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ProxyContext {
        &mut self.ctx
    }

    pub fn session(&self, session_id: SessionId) -> Option<&NetworkSession> {
        self.sessions.get(&session_id)
    }

    pub fn player(&self, session_id: SessionId) -> Option<&Player> {
        self.players.get(&session_id)
    }

    pub fn online_players(&self) -> usize {
        self.players.len()
    }

    /// Ticks at a fixed rate until a shutdown is requested or the process
    /// is interrupted.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.ctx.events.fire(&mut ServerStartEvent);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut next_tick = Instant::now();
        loop {
            self.tick();
            if self.ctx.shutdown_requested {
                break;
            }
            // Deadlines advance by whole periods so slow ticks do not drift.
            next_tick += TICK_PERIOD;
            tokio::select! {
                _ = time::sleep_until(next_tick) => {}
                result = &mut ctrl_c => {
                    result.context("failed to listen for ctrl-c")?;
                    tracing::info!("Interrupted");
                    break;
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Runs one tick.
    pub fn tick(&mut self) {
        for event in self.transport.poll() {
            self.handle_transport_event(event);
        }
        self.tick_backends();
        self.ctx.scheduler.tick();
        self.ctx.pool.drain_completions();
        self.apply_probe_results();
        self.read_console();
        self.flush_sessions();

        if self.ticks % MOTD_REFRESH_TICKS == 0 {
            self.refresh_motd();
        }
        self.ticks += 1;
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                session_id,
                address,
                client_guid,
            } => {
                tracing::debug!(session = session_id, "New connection from {address} (guid {client_guid})");
                let session = NetworkSession::new(
                    session_id,
                    address,
                    self.transport.clone(),
                    self.ctx.compressor.clone(),
                );
                self.sessions.insert(session_id, session);
            }
            TransportEvent::Packet { session_id, payload } => {
                let Some(session) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                for packet in session.handle_encoded_packet(&payload, self.ctx.translator.as_ref()) {
                    if !session.is_connected() {
                        break;
                    }
                    handle_client_packet(&mut self.ctx, session, &mut self.players, packet);
                }
            }
            TransportEvent::Disconnected { session_id, reason } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.on_disconnect(&reason);
                }
                self.close_session(session_id);
            }
            TransportEvent::Ping { session_id, latency_ms } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.set_ping(latency_ms);
                }
            }
        }
    }

    fn tick_backends(&mut self) {
        let ids: Vec<SessionId> = self.players.keys().copied().collect();
        for session_id in ids {
            let Some(player) = self.players.get_mut(&session_id) else {
                continue;
            };
            match player.tick_backend() {
                Ok(payloads) => {
                    for payload in payloads {
                        self.handle_backend_payload(session_id, payload);
                    }
                }
                Err(e) => {
                    tracing::warn!(player = %player.name(), "Backend connection failed: {e}");
                    if let Some(session) = self.sessions.get_mut(&session_id) {
                        player.try_fallback_or_disconnect(&mut self.ctx, session);
                    }
                }
            }
        }
    }

    /// Decodes a payload from a player's backend and relays what the
    /// downstream handler lets through.
    pub fn handle_backend_payload(&mut self, session_id: SessionId, payload: BackendPayload) {
        let (Some(session), Some(player)) = (self.sessions.get_mut(&session_id), self.players.get_mut(&session_id))
        else {
            return;
        };
        let batch = match self.ctx.compressor.decode_payload(payload.compression, &payload.data) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(player = %player.name(), "Dropping undecodable backend payload: {e}");
                return;
            }
        };

        for buffer in Payload::parse(&batch).packets() {
            let buffer = match buffer {
                Ok(buffer) => buffer,
                Err(e) => {
                    tracing::warn!(player = %player.name(), "Corrupt batch from backend: {e}");
                    break;
                }
            };
            let mut packet = match GamePacket::decode(buffer) {
                Ok(packet) => packet,
                Err(e) => {
                    let id = GamePacket::peek_id(buffer).unwrap_or_default();
                    tracing::debug!(player = %player.name(), "Failed to decode backend packet {id:#x}: {e}");
                    continue;
                }
            };
            if handle_backend_packet(&mut self.ctx, session, player, &mut packet) {
                session.send_data_packet(&packet, false);
            }
            if !session.is_connected() {
                break;
            }
        }
    }

    fn apply_probe_results(&mut self) {
        for result in self.ctx.take_probe_results() {
            let (Some(session), Some(player)) = (
                self.sessions.get_mut(&result.session_id),
                self.players.get_mut(&result.session_id),
            ) else {
                continue;
            };
            player.finish_fallback(session, &result.server, result.online, &result.reason);
        }
    }

    fn read_console(&mut self) {
        let Some(console) = &self.console else {
            return;
        };
        let lines: Vec<String> = console.try_iter().collect();
        if lines.is_empty() {
            return;
        }
        let entries = player_entries(&self.players);
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut sender = CommandSender::console();
            self.ctx.dispatch_command(&mut sender, line, &entries);
            for reply in sender.take_replies() {
                tracing::info!("{reply}");
            }
        }
    }

    fn flush_sessions(&mut self) {
        let mut closed = Vec::new();
        for (session_id, session) in &mut self.sessions {
            session.flush_game_packet_queue();
            if !session.is_connected() {
                closed.push(*session_id);
            }
        }
        for session_id in closed {
            self.close_session(session_id);
        }
    }

    /// Forgets a session and its player, closing the backend link.
    fn close_session(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        let Some(mut player) = self.players.remove(&session_id) else {
            return;
        };
        player.close_backend();
        let key = player.name().to_lowercase();
        if self.ctx.player_names.get(&key) == Some(&session_id) {
            self.ctx.player_names.remove(&key);
        }
        let mut event = PlayerQuitEvent {
            username: player.name().to_owned(),
            reason: session.disconnect_reason().unwrap_or_default().to_owned(),
        };
        self.ctx.events.fire(&mut event);
    }

    fn refresh_motd(&mut self) {
        let network = &self.ctx.config.network;
        let mut query = QueryRegenerateEvent {
            motd: network.motd.clone(),
            sub_motd: network.sub_motd.clone(),
            online_players: self.players.len(),
            max_players: network.max_players,
        };
        self.ctx.events.fire(&mut query);
        let motd = motd_string(
            &query.motd,
            &query.sub_motd,
            CURRENT_PROTOCOL,
            protocol_version_name(CURRENT_PROTOCOL).unwrap_or_default(),
            query.online_players,
            query.max_players,
            self.server_guid,
        );
        self.transport.set_name(motd);
    }

    /// Kicks every client and stops the workers.
    fn shutdown(&mut self) {
        self.ctx.events.fire(&mut ServerStopEvent);
        let reason = self.ctx.translate("proxy.shutdown", &[]);
        tracing::info!("{reason}");
        for session in self.sessions.values_mut() {
            session.disconnect(&reason);
        }
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session_id in ids {
            self.close_session(session_id);
        }
        self.transport.shutdown();
        self.ctx.pool.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::BackendConfig,
        handler::UpstreamHandler,
        lang::Language,
        login::tests::login_packet,
        player::tests::test_player,
        protocol::{
            batch::encode_batch,
            compression::CompressionState,
            packet::{
                id, Disconnect, PlayStatus, RequestNetworkSettings, ResourcePackClientResponse,
                ResponseStatus,
            },
        },
        session::tests::{sent_packets, test_session},
        transport::{self, TransportCommand, TransportEndpoint},
    };
    use bytes::Bytes;
    use std::{cell::RefCell, net::TcpListener, net::UdpSocket, rc::Rc, thread};

    pub(crate) fn test_context(backends: &[(&str, u16, i32)]) -> ProxyContext {
        let mut config = ProxyConfig::default();
        config.game.backends = backends
            .iter()
            .map(|&(name, port, priority)| BackendConfig {
                name: name.to_owned(),
                address: "127.0.0.1".to_owned(),
                port,
                priority,
            })
            .collect();
        let mut ctx = ProxyContext::new(config, Box::new(Language::english()), ResourcePackManager::disabled());
        ctx.servers.set_probe_timeout(Duration::from_millis(500));
        ctx
    }

    fn client_payload(packets: &[GamePacket]) -> Bytes {
        let buffers: Vec<Vec<u8>> = packets.iter().map(GamePacket::to_bytes).collect();
        let batch = encode_batch(buffers.iter().map(Vec::as_slice));
        let payload = crate::session::tests::compressor()
            .encode_payload(CompressionState::Enabled, batch)
            .unwrap();
        Bytes::from(payload)
    }

    /// Sends one client payload and returns the proxy's replies after a tick.
    fn round_trip(proxy: &mut ProxyLoop, endpoint: &TransportEndpoint, payload: Bytes, state: CompressionState) -> Vec<GamePacket> {
        endpoint
            .events
            .send(TransportEvent::Packet { session_id: 1, payload })
            .unwrap();
        proxy.tick();
        sent_packets(endpoint, state)
    }

    #[tokio::test]
    async fn login_completes_in_four_round_trips() {
        let network = crate::config::NetworkConfig {
            bind_address: "127.0.0.1".to_owned(),
            bind_port: 0,
            ..Default::default()
        };
        let (backend, backend_addr) = transport::bind(&network, 99).await.unwrap();
        let ctx = test_context(&[("survival", 1, 5), ("lobby", backend_addr.port(), 0)]);
        let (handle, endpoint) = transport::channel();
        let mut proxy = ProxyLoop::new(ctx, handle, 42);

        endpoint
            .events
            .send(TransportEvent::Connected {
                session_id: 1,
                address: ([127, 0, 0, 1], 50000).into(),
                client_guid: 7,
            })
            .unwrap();

        // 1: network settings, sent unbatched and uncompressed.
        let request = GamePacket::from(RequestNetworkSettings {
            protocol: CURRENT_PROTOCOL,
        });
        let replies = round_trip(&mut proxy, &endpoint, Bytes::from(request.to_bytes()), CompressionState::Pending);
        assert!(matches!(replies[..], [GamePacket::NetworkSettings(_)]));
        assert_eq!(proxy.session(1).unwrap().compression(), CompressionState::Enabled);

        // 2: login.
        let login = client_payload(&[login_packet("Steve").into()]);
        let replies = round_trip(&mut proxy, &endpoint, login, CompressionState::Enabled);
        let ids: Vec<u32> = replies.iter().map(GamePacket::id).collect();
        assert_eq!(ids, [id::PLAY_STATUS, id::RESOURCE_PACKS_INFO]);
        match &replies[0] {
            GamePacket::PlayStatus(status) => assert_eq!(status.status, PlayStatus::LOGIN_SUCCESS),
            other => panic!("unexpected {other:?}"),
        }

        // 3: pack negotiation.
        let have_all = client_payload(&[ResourcePackClientResponse {
            status: ResponseStatus::HaveAllPacks,
            pack_ids: Vec::new(),
        }
        .into()]);
        let replies = round_trip(&mut proxy, &endpoint, have_all, CompressionState::Enabled);
        let ids: Vec<u32> = replies.iter().map(GamePacket::id).collect();
        assert_eq!(ids, [id::RESOURCE_PACK_STACK]);

        // 4: completion hands the player to the preferred backend.
        let completed = client_payload(&[ResourcePackClientResponse {
            status: ResponseStatus::Completed,
            pack_ids: Vec::new(),
        }
        .into()]);
        let replies = round_trip(&mut proxy, &endpoint, completed, CompressionState::Enabled);
        let ids: Vec<u32> = replies.iter().map(GamePacket::id).collect();
        assert_eq!(ids, [id::NETWORK_CHUNK_PUBLISHER_UPDATE, id::LEVEL_CHUNK]);
        assert!(matches!(proxy.session(1).unwrap().handler(), UpstreamHandler::InGame));
        let player = proxy.player(1).unwrap();
        assert_eq!(player.backend_server().unwrap().name(), "lobby");
        assert_eq!(proxy.context().player_names.get("steve"), Some(&1));

        // The backend link comes up on the following ticks.
        let mut connected = false;
        for _ in 0..200 {
            proxy.tick();
            if backend
                .poll()
                .iter()
                .any(|event| matches!(event, TransportEvent::Connected { .. }))
            {
                connected = true;
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert!(connected);
        backend.shutdown();
    }

    #[test]
    fn backend_kick_falls_back_to_live_server_once() {
        let lobby = TcpListener::bind("127.0.0.1:0").unwrap();
        let lobby_port = lobby.local_addr().unwrap().port();
        let survival = UdpSocket::bind("127.0.0.1:0").unwrap();
        let survival_port = survival.local_addr().unwrap().port();
        let ctx = test_context(&[("survival", survival_port, 5), ("lobby", lobby_port, 0)]);
        let (handle, _transport) = transport::channel();
        let mut proxy = ProxyLoop::new(ctx, handle, 42);

        let (mut session, endpoint) = test_session();
        session.enable_compression();
        session.set_handler(UpstreamHandler::InGame);
        let mut player = test_player("Steve");
        let server = proxy.ctx.servers.get("survival").unwrap();
        player.transfer_to_backend(&mut proxy.ctx, server).unwrap();
        proxy.sessions.insert(3, session);
        proxy.players.insert(3, player);

        let kick = GamePacket::from(Disconnect::with_message("Server restarting")).to_bytes();
        let payload = crate::session::tests::compressor()
            .encode_payload(CompressionState::Enabled, encode_batch([kick.as_slice()]))
            .unwrap();
        for _ in 0..2 {
            proxy.handle_backend_payload(
                3,
                BackendPayload {
                    compression: CompressionState::Enabled,
                    data: Bytes::from(payload.clone()),
                },
            );
        }

        let mut packets = Vec::new();
        for _ in 0..200 {
            proxy.tick();
            packets.extend(sent_packets(&endpoint, CompressionState::Enabled));
            if !packets.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        // Give a stray second transfer the chance to show up.
        for _ in 0..5 {
            proxy.tick();
            packets.extend(sent_packets(&endpoint, CompressionState::Enabled));
        }

        assert_eq!(packets.len(), 1);
        match &packets[0] {
            GamePacket::Transfer(transfer) => {
                assert_eq!(transfer.address, "127.0.0.1");
                assert_eq!(transfer.port, lobby_port);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(proxy.session(3).is_some_and(NetworkSession::is_connected));
    }

    #[test]
    fn closing_a_session_forgets_the_player() {
        let ctx = test_context(&[]);
        let (handle, endpoint) = transport::channel();
        let mut proxy = ProxyLoop::new(ctx, handle, 42);
        let quits = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen = quits.clone();
        proxy
            .ctx
            .events
            .subscribe(move |event: &mut PlayerQuitEvent| seen.borrow_mut().push(event.reason.clone()));

        let (session, _session_endpoint) = test_session();
        proxy.sessions.insert(3, session);
        proxy.players.insert(3, test_player("Steve"));
        proxy.ctx.player_names.insert("steve".to_owned(), 3);

        endpoint
            .events
            .send(TransportEvent::Disconnected {
                session_id: 3,
                reason: "timeout".to_owned(),
            })
            .unwrap();
        proxy.tick();

        assert!(proxy.session(3).is_none());
        assert_eq!(proxy.online_players(), 0);
        assert!(proxy.ctx.player_names.is_empty());
        assert_eq!(*quits.borrow(), ["timeout"]);
    }

    #[test]
    fn console_stop_command_requests_shutdown() {
        let ctx = test_context(&[]);
        let (handle, endpoint) = transport::channel();
        let (console_tx, console_rx) = flume::unbounded();
        let mut proxy = ProxyLoop::new(ctx, handle, 42).with_console(console_rx);

        console_tx.send("proxylist".to_owned()).unwrap();
        proxy.tick();
        assert!(!proxy.context().shutdown_requested);

        console_tx.send("/ps".to_owned()).unwrap();
        proxy.tick();
        assert!(proxy.context().shutdown_requested);

        let motd = endpoint.commands.try_iter().find_map(|command| match command {
            TransportCommand::SetName(name) => Some(name),
            _ => None,
        });
        assert!(motd.is_some_and(|name| name.starts_with("MCPE;AquaRelay Proxy;860;")));
    }

    #[test]
    fn query_listener_rewrites_the_advertised_status() {
        let mut ctx = test_context(&[]);
        ctx.events.subscribe(|query: &mut QueryRegenerateEvent| {
            query.motd = "Event Night".to_owned();
            query.online_players = 250;
            query.max_players = 500;
        });
        let (handle, endpoint) = transport::channel();
        let mut proxy = ProxyLoop::new(ctx, handle, 42);
        proxy.tick();

        let motd = endpoint.commands.try_iter().find_map(|command| match command {
            TransportCommand::SetName(name) => Some(name),
            _ => None,
        });
        let motd = motd.unwrap();
        assert!(motd.starts_with("MCPE;Event Night;860;"), "{motd}");
        assert!(motd.contains(";250;500;42;"), "{motd}");
    }

    #[test]
    fn shutdown_fires_stop_event() {
        let mut ctx = test_context(&[]);
        let stops = Rc::new(RefCell::new(0));
        let counter = stops.clone();
        ctx.events.subscribe(move |_: &mut ServerStopEvent| *counter.borrow_mut() += 1);
        let (handle, _endpoint) = transport::channel();
        let mut proxy = ProxyLoop::new(ctx, handle, 42);
        proxy.shutdown();
        assert_eq!(*stops.borrow(), 1);
    }
}
