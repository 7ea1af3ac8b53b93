//! Packets from the backend server.

use super::DownstreamHandler;
use crate::{
    command::CommandSender,
    event::PlayerJoinEvent,
    player::Player,
    protocol::{
        packet::{
            id, AvailableCommands, GamePacket, PlayStatus, RequestChunkRadius,
            ResourcePackClientResponse, ResponseStatus,
        },
        Decode, Decoder,
    },
    proxy::ProxyContext,
    session::NetworkSession,
};

/// Chunk radius requested from the backend on behalf of the client.
const CHUNK_RADIUS: i32 = 8;

/// Handles a backend packet. Returns whether it should be relayed to the
/// client; `packet` may have been rewritten.
pub fn handle_backend_packet(
    ctx: &mut ProxyContext,
    session: &mut NetworkSession,
    player: &mut Player,
    packet: &mut GamePacket,
) -> bool {
    match packet {
        // The client negotiated its own settings with the proxy.
        GamePacket::NetworkSettings(_) => return false,
        GamePacket::Disconnect(disconnect) => {
            tracing::info!(
                player = %player.name(),
                "Kicked by backend: {}",
                disconnect.message.as_deref().unwrap_or_default()
            );
            player.try_fallback_or_disconnect(ctx, session);
            return false;
        }
        GamePacket::Unknown(unknown) if unknown.id == id::RESOURCE_PACKS_INFO => {
            // Packs are served by the proxy, the backend's are skipped.
            let response = ResourcePackClientResponse {
                status: ResponseStatus::Completed,
                pack_ids: Vec::new(),
            };
            player.send_to_backend(&response.into());
            player.set_downstream(DownstreamHandler::InGame);
            return false;
        }
        GamePacket::Unknown(unknown) if unknown.id == id::RESOURCE_PACK_STACK => return false,
        _ => {}
    }

    if player.downstream() != DownstreamHandler::InGame {
        return true;
    }
    match packet {
        GamePacket::StartGame(start) => {
            player.set_backend_runtime_id(start.actor_runtime_id);
            let request = RequestChunkRadius {
                radius: CHUNK_RADIUS,
                max_radius: CHUNK_RADIUS as u8,
            };
            player.send_to_backend(&request.into());
            true
        }
        GamePacket::PlayStatus(status) if status.status == PlayStatus::PLAYER_SPAWN => {
            if player.backend_runtime_id().is_some() {
                let mut event = PlayerJoinEvent {
                    username: player.name().to_owned(),
                    server: player
                        .backend_server()
                        .map(|server| server.name().to_owned())
                        .unwrap_or_default(),
                };
                ctx.events.fire(&mut event);
            }
            true
        }
        GamePacket::Transfer(transfer) => {
            let target = ctx
                .servers
                .get(&transfer.address)
                .or_else(|| ctx.servers.by_address(&transfer.address, transfer.port));
            let Some(server) = target else {
                return true;
            };
            if let Err(e) = player.transfer_to_backend(ctx, server) {
                tracing::warn!(player = %player.name(), "Transfer failed: {e}");
                player.try_fallback_or_disconnect(ctx, session);
            }
            false
        }
        GamePacket::Unknown(unknown)
            if unknown.id == id::AVAILABLE_COMMANDS && ctx.config.misc.command_injection =>
        {
            match AvailableCommands::decode(&mut Decoder::new(&unknown.body)) {
                Ok(mut commands) => {
                    inject_commands(ctx, player, &mut commands);
                    *packet = GamePacket::AvailableCommands(commands);
                }
                Err(e) => tracing::debug!(player = %player.name(), "Undecodable command list: {e}"),
            }
            true
        }
        _ => true,
    }
}

/// Adds the proxy commands the player may use to a backend command list.
fn inject_commands(ctx: &ProxyContext, player: &Player, commands: &mut AvailableCommands) {
    let sender = CommandSender::player(player.name());
    for command in ctx.commands.commands() {
        let info = command.info();
        if info.name == "help" || !sender.has_permission(&ctx.permissions, &info.permission) {
            continue;
        }
        commands.inject(&info.name, &info.description, &info.aliases);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::PlayerTransferEvent,
        player::{tests::test_player, FallbackState},
        protocol::packet::{Disconnect, StartGame, Transfer, UnknownPacket},
        protocol::{Encode, Encoder},
        proxy::tests::test_context,
        session::tests::{sent_packets, test_session},
    };
    use bytes::Bytes;
    use std::{cell::Cell, net::UdpSocket, rc::Rc};

    fn unknown(id: u32) -> GamePacket {
        UnknownPacket {
            id,
            body: Bytes::new(),
        }
        .into()
    }

    #[test]
    fn backend_resource_packs_are_skipped() {
        let mut ctx = test_context(&[]);
        let (mut session, endpoint) = test_session();
        let mut player = test_player("Steve");

        assert!(!handle_backend_packet(&mut ctx, &mut session, &mut player, &mut unknown(id::RESOURCE_PACKS_INFO)));
        assert_eq!(player.downstream(), DownstreamHandler::InGame);
        assert!(!handle_backend_packet(&mut ctx, &mut session, &mut player, &mut unknown(id::RESOURCE_PACK_STACK)));
        session.flush_game_packet_queue();
        assert!(sent_packets(&endpoint, session.compression()).is_empty());
    }

    #[test]
    fn start_game_records_runtime_id() {
        let mut ctx = test_context(&[]);
        let (mut session, _endpoint) = test_session();
        let mut player = test_player("Steve");
        player.set_downstream(DownstreamHandler::InGame);

        let mut packet: GamePacket = StartGame {
            actor_unique_id: -7,
            actor_runtime_id: 7,
            ignored_data: Vec::new(),
        }
        .into();
        assert!(handle_backend_packet(&mut ctx, &mut session, &mut player, &mut packet));
        assert_eq!(player.backend_runtime_id(), Some(7));
    }

    #[test]
    fn spawn_fires_join_once_runtime_id_is_known() {
        let mut ctx = test_context(&[]);
        let joins = Rc::new(Cell::new(0));
        let counter = joins.clone();
        ctx.events.subscribe(move |_: &mut PlayerJoinEvent| counter.set(counter.get() + 1));
        let (mut session, _endpoint) = test_session();
        let mut player = test_player("Steve");
        player.set_downstream(DownstreamHandler::InGame);

        let spawn = || GamePacket::from(PlayStatus::new(PlayStatus::PLAYER_SPAWN));
        assert!(handle_backend_packet(&mut ctx, &mut session, &mut player, &mut spawn()));
        assert_eq!(joins.get(), 0);
        player.set_backend_runtime_id(1);
        assert!(handle_backend_packet(&mut ctx, &mut session, &mut player, &mut spawn()));
        assert_eq!(joins.get(), 1);
    }

    #[test]
    fn transfer_to_known_backend_is_intercepted() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        let mut ctx = test_context(&[("lobby", port, 0)]);
        let transfers = Rc::new(Cell::new(0));
        let counter = transfers.clone();
        ctx.events.subscribe(move |_: &mut PlayerTransferEvent| counter.set(counter.get() + 1));
        let (mut session, _endpoint) = test_session();
        let mut player = test_player("Steve");
        player.set_downstream(DownstreamHandler::InGame);

        let mut by_name: GamePacket = Transfer {
            address: "lobby".to_owned(),
            port: 0,
            reload_world: false,
        }
        .into();
        assert!(!handle_backend_packet(&mut ctx, &mut session, &mut player, &mut by_name));
        assert_eq!(transfers.get(), 1);
        assert_eq!(player.backend_server().map(|s| s.name()), Some("lobby"));

        let mut elsewhere: GamePacket = Transfer {
            address: "play.example.net".to_owned(),
            port: 19132,
            reload_world: false,
        }
        .into();
        assert!(handle_backend_packet(&mut ctx, &mut session, &mut player, &mut elsewhere));
    }

    #[test]
    fn backend_kick_starts_fallback_probe() {
        let mut ctx = test_context(&[("lobby", 1, 0)]);
        let (mut session, _endpoint) = test_session();
        let mut player = test_player("Steve");

        // The player never reached a backend, so "lobby" is a valid fallback.
        let mut kick: GamePacket = Disconnect::with_message("Server closed").into();
        assert!(!handle_backend_packet(&mut ctx, &mut session, &mut player, &mut kick));
        assert_eq!(player.fallback_state(), FallbackState::Probing);
        assert!(session.is_connected());
    }

    #[test]
    fn command_list_gets_permitted_proxy_commands() {
        let mut ctx = test_context(&[]);
        ctx.permissions.grant("Steve", "aquarelay.command.proxylist");
        let (mut session, _endpoint) = test_session();
        let mut player = test_player("Steve");
        player.set_downstream(DownstreamHandler::InGame);

        let empty = AvailableCommands {
            enum_values: Vec::new(),
            chained_subcommand_values: Vec::new(),
            postfixes: Vec::new(),
            enums: Vec::new(),
            chained_subcommands: Vec::new(),
            commands: Vec::new(),
            trailing_data: vec![0, 0],
        };
        let mut body = Vec::new();
        empty.encode(&mut Encoder::new(&mut body));
        let mut packet: GamePacket = UnknownPacket {
            id: id::AVAILABLE_COMMANDS,
            body: Bytes::from(body),
        }
        .into();
        assert!(handle_backend_packet(&mut ctx, &mut session, &mut player, &mut packet));
        let GamePacket::AvailableCommands(commands) = packet else {
            panic!("command list was not rewritten");
        };
        let names: Vec<&str> = commands.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["proxylist"]);
    }
}
