//! Packets from the game client.

use super::{PackTransfer, UpstreamHandler};
use crate::{
    command::{CommandMap, CommandSender},
    event::PlayerLoginEvent,
    login::parse_login,
    player::Player,
    protocol::{
        compression::CompressionAlgorithm,
        is_accepted_protocol,
        packet::{
            id, world::BlockPosition, world::ChunkPosition, CommandRequest, GamePacket, LevelChunk,
            Login, NetworkChunkPublisherUpdate, NetworkSettings, PlayStatus,
            ResourcePackChunkRequest, ResourcePackClientResponse, ResponseStatus,
        },
        protocol_version_name, CURRENT_PROTOCOL,
    },
    proxy::{player_entries, ProxyContext},
    session::NetworkSession,
    transport::SessionId,
};
use ahash::AHashMap;
use bytes::Bytes;
use uuid::Uuid;

/// Client packets relayed to the backend once in game.
const FORWARDED: &[u32] = &[
    id::TEXT,
    id::MOVE_PLAYER,
    id::INVENTORY_TRANSACTION,
    id::INTERACT,
    id::BLOCK_PICK_REQUEST,
    id::PLAYER_ACTION,
    id::ANIMATE,
    id::CONTAINER_CLOSE,
    id::PLAYER_HOTBAR,
    id::CRAFTING_EVENT,
    id::BLOCK_ACTOR_DATA,
    id::REQUEST_CHUNK_RADIUS,
    id::COMMAND_REQUEST,
    id::MODAL_FORM_RESPONSE,
    id::SET_LOCAL_PLAYER_AS_INITIALIZED,
    id::NETWORK_STACK_LATENCY,
    id::LEVEL_SOUND_EVENT,
    id::CLIENT_CACHE_STATUS,
    id::EMOTE,
    id::SETTINGS_COMMAND,
    id::PLAYER_AUTH_INPUT,
    id::ITEM_STACK_REQUEST,
];

/// Radius of the placeholder chunk area sent before the backend takes over.
const BOOTSTRAP_RADIUS: u32 = 8 * 16;

/// Dispatches a client packet to the session's current handler.
pub fn handle_client_packet(
    ctx: &mut ProxyContext,
    session: &mut NetworkSession,
    players: &mut AHashMap<SessionId, Player>,
    packet: GamePacket,
) {
    match session.handler() {
        UpstreamHandler::PreLogin => pre_login(session, packet),
        UpstreamHandler::Login => login(ctx, session, players, packet),
        UpstreamHandler::ResourcePack(_) => resource_pack(ctx, session, players, packet),
        UpstreamHandler::InGame => in_game(ctx, session, players, packet),
    }
}

fn pre_login(session: &mut NetworkSession, packet: GamePacket) {
    let GamePacket::RequestNetworkSettings(request) = packet else {
        tracing::debug!(session = session.id(), "Unexpected {} before network settings", packet.as_ref());
        return;
    };

    let protocol = request.protocol;
    if !is_accepted_protocol(protocol) {
        tracing::info!(
            session = session.id(),
            "{} tried to join with unsupported protocol {protocol}",
            session.log_name()
        );
        let status = if protocol > CURRENT_PROTOCOL {
            PlayStatus::LOGIN_FAILED_SERVER
        } else {
            PlayStatus::LOGIN_FAILED_CLIENT
        };
        session.send_data_packet(&PlayStatus::new(status).into(), true);
        return;
    }

    session.set_protocol(protocol);
    let settings = NetworkSettings {
        compression_threshold: NetworkSettings::COMPRESS_EVERYTHING,
        compression_algorithm: CompressionAlgorithm::Zlib.network_id(),
        enable_client_throttling: false,
        client_throttle_threshold: 0,
        client_throttle_scalar: 0.0,
    };
    session.send_data_packet(&settings.into(), true);
    session.enable_compression();
    session.set_handler(UpstreamHandler::Login);
}

fn login(
    ctx: &mut ProxyContext,
    session: &mut NetworkSession,
    players: &mut AHashMap<SessionId, Player>,
    packet: GamePacket,
) {
    let GamePacket::Login(packet) = packet else {
        tracing::debug!(session = session.id(), "Unexpected {} before login", packet.as_ref());
        return;
    };
    if let Some(err) = check_login_protocol(ctx, session, &packet) {
        session.disconnect(&err);
        return;
    }

    let data = match parse_login(&packet, ctx.config.misc.online_mode) {
        Ok(data) => data,
        Err(e) => {
            tracing::info!(session = session.id(), "Rejected login from {}: {e}", session.log_name());
            session.disconnect(&ctx.translate("login.decode_error", &[&e.to_string()]));
            return;
        }
    };

    let mut event = PlayerLoginEvent::new(&data.username, data.uuid);
    ctx.events.fire(&mut event);
    if event.is_cancelled() {
        let reason = match event.kick_reason() {
            "" => ctx.translate("login.cancelled", &[]),
            reason => reason.to_owned(),
        };
        session.disconnect(&reason);
        return;
    }

    tracing::debug!(session = session.id(), player = %data.username, "Login accepted ({})", data.uuid);
    session.set_display_name(&data.username);
    ctx.player_names.insert(data.username.to_lowercase(), session.id());
    players.insert(session.id(), Player::new(session.id(), data));
    on_client_login_success(ctx, session);
}

/// The login must use the protocol the network settings were negotiated
/// with.
fn check_login_protocol(ctx: &ProxyContext, session: &NetworkSession, login: &Login) -> Option<String> {
    match session.protocol() {
        Some(protocol) if protocol == login.protocol => None,
        _ => Some(ctx.translate("login.unsupported_protocol", &[&login.protocol.to_string()])),
    }
}

fn on_client_login_success(ctx: &ProxyContext, session: &mut NetworkSession) {
    session.set_logged_in();
    session.send_data_packet(&PlayStatus::new(PlayStatus::LOGIN_SUCCESS).into(), false);
    session.send_data_packet(&ctx.packs.info_packet().into(), false);
    session.set_handler(UpstreamHandler::ResourcePack(PackTransfer::default()));
}

fn resource_pack(
    ctx: &mut ProxyContext,
    session: &mut NetworkSession,
    players: &mut AHashMap<SessionId, Player>,
    packet: GamePacket,
) {
    let Some(player) = players.get_mut(&session.id()) else {
        return;
    };
    match packet {
        GamePacket::ClientCacheStatus(status) => {
            tracing::debug!(session = session.id(), "Client blob cache enabled: {}", status.enabled);
        }
        GamePacket::RequestChunkRadius(request) => player.send_to_backend(&request.into()),
        GamePacket::ResourcePackClientResponse(response) => {
            pack_response(ctx, session, player, response);
        }
        GamePacket::ResourcePackChunkRequest(request) => chunk_request(ctx, session, request),
        other => {
            tracing::debug!(session = session.id(), "Ignoring {} during resource pack exchange", other.as_ref());
        }
    }
}

fn pack_response(
    ctx: &mut ProxyContext,
    session: &mut NetworkSession,
    player: &mut Player,
    response: ResourcePackClientResponse,
) {
    tracing::debug!(session = session.id(), "Resource pack response: {}", response.status.as_ref());
    match response.status {
        ResponseStatus::HaveAllPacks => {
            session.send_data_packet(&ctx.packs.stack_packet().into(), false);
        }
        ResponseStatus::SendPacks => {
            if !ctx.packs.is_enabled() {
                return;
            }
            if let UpstreamHandler::ResourcePack(transfer) = session.handler_mut() {
                transfer.pending.extend(response.pack_ids);
            }
            send_next_pack_info(ctx, session);
        }
        ResponseStatus::Completed => complete_login(ctx, session, player),
        ResponseStatus::Refused => {
            if ctx.packs.is_enabled() && ctx.packs.is_force_accept() {
                session.disconnect(&ctx.translate("resource_pack.required", &[]));
            } else {
                complete_login(ctx, session, player);
            }
        }
    }
}

/// Announces the next requested pack, if any.
fn send_next_pack_info(ctx: &ProxyContext, session: &mut NetworkSession) {
    let UpstreamHandler::ResourcePack(transfer) = session.handler_mut() else {
        return;
    };
    let Some(pack_id) = transfer.pending.pop_front() else {
        transfer.sending = None;
        return;
    };
    let Some(info) = ctx.packs.data_info(&pack_id) else {
        session.disconnect(&ctx.translate("resource_pack.unknown", &[&pack_id]));
        return;
    };
    transfer.sending = Some((info.pack_id.clone(), info.chunk_count));
    session.send_data_packet(&info.into(), false);
}

fn chunk_request(ctx: &ProxyContext, session: &mut NetworkSession, request: ResourcePackChunkRequest) {
    let Some(chunk) = ctx.packs.chunk_data(&request.pack_id, request.chunk_index) else {
        session.disconnect(&ctx.translate("resource_pack.unknown", &[&request.pack_id]));
        return;
    };
    let finished = match session.handler() {
        UpstreamHandler::ResourcePack(transfer) => transfer
            .sending
            .as_ref()
            .is_some_and(|(id, count)| *id == chunk.pack_id && request.chunk_index + 1 >= *count),
        _ => false,
    };
    session.send_data_packet(&chunk.into(), false);
    if finished {
        send_next_pack_info(ctx, session);
    }
}

/// Sends the world bootstrap, then hands the player to a backend.
fn complete_login(ctx: &mut ProxyContext, session: &mut NetworkSession, player: &mut Player) {
    let publisher = NetworkChunkPublisherUpdate {
        position: BlockPosition { x: 0, y: 0, z: 0 },
        radius: BOOTSTRAP_RADIUS,
        saved_chunks: Vec::new(),
    };
    session.send_data_packet(&publisher.into(), false);
    let chunk = LevelChunk {
        position: ChunkPosition { x: 0, z: 0 },
        dimension_id: 0,
        sub_chunk_count: 1,
        cache_enabled: false,
        payload: Bytes::from_static(&[1, 0, 0]),
    };
    session.send_data_packet(&chunk.into(), false);

    let protocol = player.protocol();
    tracing::info!(
        session = session.id(),
        player = %player.name(),
        "{} logged in with v{} ({protocol})",
        session.log_name(),
        protocol_version_name(protocol).unwrap_or("?"),
    );

    let server = match ctx.servers.select() {
        Ok(server) => server,
        Err(e) => {
            tracing::warn!(player = %player.name(), "Cannot place player: {e}");
            session.disconnect(&ctx.translate("proxy.backend.read_error", &[&Uuid::new_v4().to_string()]));
            return;
        }
    };
    session.flush_game_packet_queue();
    session.set_handler(UpstreamHandler::InGame);
    if let Err(e) = player.transfer_to_backend(ctx, server) {
        tracing::warn!(player = %player.name(), "Failed to connect to backend: {e}");
        player.try_fallback_or_disconnect(ctx, session);
    }
}

fn in_game(
    ctx: &mut ProxyContext,
    session: &mut NetworkSession,
    players: &mut AHashMap<SessionId, Player>,
    packet: GamePacket,
) {
    if let GamePacket::CommandRequest(request) = &packet {
        let local = CommandMap::label(&request.command).is_some_and(|label| ctx.commands.get(&label).is_some());
        if local {
            run_command(ctx, session, players, request);
            return;
        }
    }

    let Some(player) = players.get_mut(&session.id()) else {
        return;
    };
    match packet {
        GamePacket::ModalFormResponse(response) if player.has_pending_form(response.form_id) => {
            player.handle_form_response(&response);
        }
        packet if FORWARDED.contains(&packet.id()) => player.send_to_backend(&packet),
        other => {
            tracing::trace!(session = session.id(), "Dropping client packet {}", other.as_ref());
        }
    }
}

/// Runs a proxy command typed by a player and shows the replies.
fn run_command(
    ctx: &mut ProxyContext,
    session: &mut NetworkSession,
    players: &AHashMap<SessionId, Player>,
    request: &CommandRequest,
) {
    let Some(player) = players.get(&session.id()) else {
        return;
    };
    let mut sender = CommandSender::player(player.name());
    let entries = player_entries(players);
    ctx.dispatch_command(&mut sender, &request.command, &entries);
    for reply in sender.take_replies() {
        session.send_message(reply);
    }
}
