//! Packet handler state machines.
//!
//! Each client session has exactly one [`UpstreamHandler`], each player
//! exactly one [`DownstreamHandler`] for its backend link. Handlers are
//! plain state tags; the transition functions live in the submodules.

use std::collections::VecDeque;

mod downstream;
mod upstream;

pub use downstream::handle_backend_packet;
pub use upstream::handle_client_packet;

#[derive(Debug, strum::AsRefStr)]
pub enum UpstreamHandler {
    /// Waiting for the client's network settings request.
    PreLogin,
    Login,
    ResourcePack(PackTransfer),
    InGame,
}

/// Resource packs being streamed to a client.
#[derive(Debug, Default)]
pub struct PackTransfer {
    /// Pack ids requested by the client and not yet announced.
    pending: VecDeque<String>,
    /// Pack currently being downloaded, with its chunk count.
    sending: Option<(String, u32)>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::AsRefStr)]
pub enum DownstreamHandler {
    ResourcePack,
    InGame,
}
