//! A logged-in player: identity, backend link and per-player state.

use crate::{
    backend::{BackendError, BackendPayload, BackendRakClient},
    event::PlayerTransferEvent,
    form::{self, Form},
    handler::DownstreamHandler,
    login::LoginData,
    protocol::packet::{GamePacket, ModalFormResponse, Transfer},
    proxy::ProxyContext,
    server::BackendServer,
    session::NetworkSession,
    transport::SessionId,
};
use ahash::AHashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Progress of the fallback after the backend link was lost.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FallbackState {
    Idle,
    /// Waiting for the liveness probe of the fallback server.
    Probing,
    /// The client was transferred away or disconnected.
    Done,
}

pub struct Player {
    session_id: SessionId,
    login: LoginData,
    backend: Option<BackendRakClient>,
    backend_server: Option<Arc<BackendServer>>,
    downstream: DownstreamHandler,
    /// Entity id the current backend assigned in StartGame.
    backend_runtime_id: Option<u64>,
    forms: AHashMap<u32, Box<dyn Form>>,
    next_form_id: u32,
    fallback: FallbackState,
}

impl Player {
    pub fn new(session_id: SessionId, login: LoginData) -> Self {
        Self {
            session_id,
            login,
            backend: None,
            backend_server: None,
            downstream: DownstreamHandler::ResourcePack,
            backend_runtime_id: None,
            forms: AHashMap::new(),
            next_form_id: 0,
            fallback: FallbackState::Idle,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn name(&self) -> &str {
        &self.login.username
    }

    pub fn uuid(&self) -> Uuid {
        self.login.uuid
    }

    pub fn xuid(&self) -> &str {
        &self.login.xuid
    }

    pub fn protocol(&self) -> i32 {
        self.login.protocol
    }

    pub fn login_data(&self) -> &LoginData {
        &self.login
    }

    /// The backend the player is on, or was on before its link failed.
    pub fn backend_server(&self) -> Option<&Arc<BackendServer>> {
        self.backend_server.as_ref()
    }

    pub fn backend(&self) -> Option<&BackendRakClient> {
        self.backend.as_ref()
    }

    pub fn downstream(&self) -> DownstreamHandler {
        self.downstream
    }

    pub fn set_downstream(&mut self, handler: DownstreamHandler) {
        tracing::debug!(player = %self.login.username, "Backend link in {} state", handler.as_ref());
        self.downstream = handler;
    }

    pub fn backend_runtime_id(&self) -> Option<u64> {
        self.backend_runtime_id
    }

    pub fn set_backend_runtime_id(&mut self, runtime_id: u64) {
        self.backend_runtime_id = Some(runtime_id);
    }

    pub fn fallback_state(&self) -> FallbackState {
        self.fallback
    }

    /// Sends a packet to the backend; queued there until its login completes.
    pub fn send_to_backend(&mut self, packet: &GamePacket) {
        match &mut self.backend {
            Some(backend) => backend.send_packet(packet),
            None => tracing::trace!(player = %self.login.username, "No backend, dropping {}", packet.as_ref()),
        }
    }

    pub fn tick_backend(&mut self) -> Result<Vec<BackendPayload>, BackendError> {
        match &mut self.backend {
            Some(backend) => backend.tick(),
            None => Ok(Vec::new()),
        }
    }

    pub fn close_backend(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.disconnect();
        }
    }

    /// Moves the player to `server`: opens a new backend link, replays the
    /// login on it and drops the old link. Staying on the same server is a
    /// no-op.
    pub fn transfer_to_backend(
        &mut self,
        ctx: &mut ProxyContext,
        server: Arc<BackendServer>,
    ) -> Result<(), BackendError> {
        if self.backend.is_some() && self.backend_server.as_ref().is_some_and(|s| s.name() == server.name()) {
            tracing::debug!(player = %self.login.username, "Already on {}", server.name());
            return Ok(());
        }

        let mut backend = BackendRakClient::connect(
            &server,
            self.login.protocol,
            ctx.compressor.clone(),
            ctx.config.network.max_mtu,
        )?;
        backend.send_packet(&self.login.to_packet().into());
        if let Some(mut old) = self.backend.replace(backend) {
            old.disconnect();
        }

        let from = self
            .backend_server
            .replace(Arc::clone(&server))
            .map(|previous| previous.name().to_owned());
        self.downstream = DownstreamHandler::ResourcePack;
        self.backend_runtime_id = None;
        self.fallback = FallbackState::Idle;
        tracing::info!(player = %self.login.username, "Transferring to {}", server.name());

        let mut event = PlayerTransferEvent {
            username: self.login.username.clone(),
            from,
            to: server.name().to_owned(),
        };
        ctx.events.fire(&mut event);
        Ok(())
    }

    /// Reacts to a lost backend: picks another backend and, once it is
    /// known to be up, transfers the client there. Disconnects when no
    /// other backend is available.
    ///
    /// Only the first call after a link failure has an effect.
    pub fn try_fallback_or_disconnect(&mut self, ctx: &mut ProxyContext, session: &mut NetworkSession) {
        if self.fallback != FallbackState::Idle {
            return;
        }
        self.close_backend();
        let reason = ctx.translate("proxy.backend.read_error", &[&Uuid::new_v4().to_string()]);

        let server = match ctx.servers.select() {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!(player = %self.login.username, "No fallback server: {e}");
                self.fallback = FallbackState::Done;
                session.disconnect(&reason);
                return;
            }
        };
        if self.backend_server.as_ref().is_some_and(|current| current.name() == server.name()) {
            tracing::info!(player = %self.login.username, "No fallback server other than {}", server.name());
            self.fallback = FallbackState::Done;
            session.disconnect(&reason);
            return;
        }

        self.fallback = FallbackState::Probing;
        ctx.probe_fallback(self.session_id, server, reason);
    }

    /// Completes a fallback once the probe of `server` finished.
    pub fn finish_fallback(
        &mut self,
        session: &mut NetworkSession,
        server: &BackendServer,
        online: bool,
        reason: &str,
    ) {
        if self.fallback != FallbackState::Probing {
            return;
        }
        self.fallback = FallbackState::Done;
        if !online {
            tracing::info!(player = %self.login.username, "Fallback server {} is offline", server.name());
            session.disconnect(reason);
            return;
        }

        tracing::info!(player = %self.login.username, "Falling back to {}", server.name());
        let transfer = Transfer {
            address: server.address().to_owned(),
            port: server.port(),
            reload_world: false,
        };
        session.send_data_packet(&transfer.into(), true);
    }

    /// Shows a form, returning its id.
    pub fn send_form(&mut self, session: &mut NetworkSession, form: Box<dyn Form>) -> u32 {
        let form_id = self.next_form_id;
        self.next_form_id = self.next_form_id.wrapping_add(1);
        session.send_form(form_id, form.to_json().to_string());
        self.forms.insert(form_id, form);
        form_id
    }

    pub fn has_pending_form(&self, form_id: u32) -> bool {
        self.forms.contains_key(&form_id)
    }

    /// Passes a response to the form that was shown with its id. Returns
    /// `false` for ids the proxy never issued.
    pub fn handle_form_response(&mut self, response: &ModalFormResponse) -> bool {
        let Some(mut form) = self.forms.remove(&response.form_id) else {
            return false;
        };
        let result = form::parse_response(response.form_data.as_deref())
            .and_then(|data| form.handle_response(&self.login.username, data));
        if let Err(e) = result {
            tracing::debug!(player = %self.login.username, "Bad response to form {}: {e}", response.form_id);
        }
        true
    }
}
