//! AquaRelay: a reverse proxy for Bedrock Edition servers.
//!
//! Game clients connect to the proxy over RakNet. The proxy performs the
//! login handshake itself (network settings, login, resource packs), then
//! opens its own RakNet connection to a backend server, replays the
//! player's login there and relays game packets in both directions.
//!
//! # Threads
//! All session, player and protocol state lives on the tick loop
//! ([`proxy::ProxyLoop`]), which runs at 20 Hz. The upstream socket is
//! owned by a tokio task ([`transport`]) that exchanges events and commands
//! with the loop over channels. Backend sockets are non-blocking and polled
//! by the loop itself. Long-running work goes to [`scheduler::AsyncPool`],
//! whose results are applied back on the loop.
//!
//! # Handlers
//! A client session moves through `PreLogin -> Login -> ResourcePack ->
//! InGame` ([`handler::UpstreamHandler`]). Each backend link has its own
//! smaller state machine ([`handler::DownstreamHandler`]) that skips the
//! backend's resource packs and intercepts the few packets the proxy acts
//! on: start game, spawn, transfer, disconnect and the command list.

pub mod backend;
pub mod command;
pub mod config;
pub mod console;
pub mod event;
pub mod form;
pub mod handler;
pub mod lang;
pub mod login;
pub mod permission;
pub mod player;
pub mod protocol;
pub mod proxy;
pub mod raknet;
pub mod resource_pack;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;
