//! Upstream side of one connection: framing, compression and the
//! outbound queue towards a game client.

use crate::{
    handler::UpstreamHandler,
    lang::Translator,
    protocol::{
        batch::{encode_batch, Payload},
        compression::{CompressionState, ZlibCompressor},
        packet::{
            ClientboundCloseForm, Disconnect, GamePacket, ModalFormRequest, SetTitle, Text,
            ToastRequest,
        },
    },
    transport::{SessionId, TransportHandle},
};
use std::net::SocketAddr;

pub struct NetworkSession {
    id: SessionId,
    address: SocketAddr,
    transport: TransportHandle,
    compressor: ZlibCompressor,
    compression: CompressionState,
    handler: UpstreamHandler,
    protocol: Option<i32>,
    display_name: Option<String>,
    /// Serialized packets waiting for the next flush.
    outbound: Vec<Vec<u8>>,
    connected: bool,
    disconnect_reason: Option<String>,
    logged_in: bool,
    ping_ms: Option<u64>,
}

impl NetworkSession {
    pub fn new(
        id: SessionId,
        address: SocketAddr,
        transport: TransportHandle,
        compressor: ZlibCompressor,
    ) -> Self {
        Self {
            id,
            address,
            transport,
            compressor,
            compression: CompressionState::Pending,
            handler: UpstreamHandler::PreLogin,
            protocol: None,
            display_name: None,
            outbound: Vec::new(),
            connected: true,
            disconnect_reason: None,
            logged_in: false,
            ping_ms: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn set_logged_in(&mut self) {
        self.logged_in = true;
    }

    pub fn protocol(&self) -> Option<i32> {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: i32) {
        self.protocol = Some(protocol);
    }

    pub fn compression(&self) -> CompressionState {
        self.compression
    }

    /// Every payload after the network settings reply is compressed.
    pub fn enable_compression(&mut self) {
        self.compression = CompressionState::Enabled;
    }

    pub fn ping_ms(&self) -> Option<u64> {
        self.ping_ms
    }

    pub fn set_ping(&mut self, ping_ms: u64) {
        self.ping_ms = Some(ping_ms);
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = Some(name.into());
    }

    /// Name used in log lines: the player name once known, else the
    /// address.
    pub fn log_name(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{name}[{}]", self.address),
            None => self.address.to_string(),
        }
    }

    pub fn handler(&self) -> &UpstreamHandler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut UpstreamHandler {
        &mut self.handler
    }

    /// Replaces the packet handler. Ignored once disconnected.
    pub fn set_handler(&mut self, handler: UpstreamHandler) {
        if !self.connected {
            return;
        }
        tracing::debug!(session = self.id, "Transition to {} state", handler.as_ref());
        self.handler = handler;
    }

    /// Decompresses a payload and decodes every packet in it.
    ///
    /// Packets that fail to decode are logged and skipped; a corrupt
    /// batch ends decoding at that point. A payload that cannot be
    /// decompressed before login ends the session.
    pub fn handle_encoded_packet(&mut self, payload: &[u8], translator: &dyn Translator) -> Vec<GamePacket> {
        if !self.connected {
            return Vec::new();
        }
        let batch = match self.compressor.decode_payload(self.compression, payload) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(session = self.id, "Failed to decompress packet from {}: {e}", self.log_name());
                if !self.logged_in {
                    self.disconnect(&translator.translate("session.login.corrupt_packet", &[]));
                }
                return Vec::new();
            }
        };

        let mut packets = Vec::new();
        for buffer in Payload::parse(&batch).packets() {
            let buffer = match buffer {
                Ok(buffer) => buffer,
                Err(e) => {
                    tracing::warn!(session = self.id, "Corrupt batch from {}: {e}", self.log_name());
                    break;
                }
            };
            match GamePacket::decode(buffer) {
                Ok(packet) => packets.push(packet),
                Err(e) => {
                    let id = GamePacket::peek_id(buffer).unwrap_or_default();
                    tracing::debug!(session = self.id, "Failed to decode packet {id:#x}: {e}");
                }
            }
        }
        packets
    }

    /// Queues a packet, or sends it right away when `immediate` is set.
    pub fn send_data_packet(&mut self, packet: &GamePacket, immediate: bool) {
        self.send_serialized(packet.to_bytes(), immediate);
    }

    pub fn send_serialized(&mut self, packet: Vec<u8>, immediate: bool) {
        if !self.connected {
            return;
        }
        if immediate {
            self.send_batch(encode_batch([packet.as_slice()]));
        } else {
            self.outbound.push(packet);
        }
    }

    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Sends every queued packet as one batch.
    pub fn flush_game_packet_queue(&mut self) {
        if self.outbound.is_empty() {
            return;
        }
        let batch = encode_batch(self.outbound.iter().map(Vec::as_slice));
        self.outbound.clear();
        self.send_batch(batch);
    }

    fn send_batch(&mut self, batch: Vec<u8>) {
        match self.compressor.encode_payload(self.compression, batch) {
            Ok(payload) => self.transport.send(self.id, payload),
            Err(e) => tracing::warn!(session = self.id, "Failed to compress batch: {e}"),
        }
    }

    /// Kicks the client with a message and closes the connection.
    pub fn disconnect(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.flush_game_packet_queue();
        self.send_data_packet(&Disconnect::with_message(reason).into(), true);
        self.transport.close(self.id);
        self.on_disconnect(reason);
    }

    /// Marks the session closed. Further sends are dropped.
    pub fn on_disconnect(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.disconnect_reason = Some(reason.to_owned());
        self.outbound.clear();
        tracing::info!(session = self.id, "{} disconnected: {reason}", self.log_name());
    }

    pub fn send_message(&mut self, message: impl Into<String>) {
        self.send_data_packet(&Text::raw(message).into(), false);
    }

    pub fn send_popup(&mut self, message: impl Into<String>) {
        self.send_data_packet(&Text::new(Text::POPUP, message).into(), false);
    }

    pub fn send_jukebox_popup(&mut self, message: impl Into<String>) {
        self.send_data_packet(&Text::new(Text::JUKEBOX_POPUP, message).into(), false);
    }

    pub fn send_tip(&mut self, message: impl Into<String>) {
        self.send_data_packet(&Text::new(Text::TIP, message).into(), false);
    }

    pub fn send_action_bar(&mut self, message: impl Into<String>) {
        self.send_data_packet(&SetTitle::new(SetTitle::ACTIONBAR, message).into(), false);
    }

    /// Shows a title, with an optional subtitle and timings in ticks.
    pub fn send_title(
        &mut self,
        title: impl Into<String>,
        subtitle: Option<String>,
        times: Option<(i32, i32, i32)>,
    ) {
        if let Some((fade_in, stay, fade_out)) = times {
            self.send_data_packet(&SetTitle::times(fade_in, stay, fade_out).into(), false);
        }
        if let Some(subtitle) = subtitle {
            self.send_data_packet(&SetTitle::new(SetTitle::SUBTITLE, subtitle).into(), false);
        }
        self.send_data_packet(&SetTitle::new(SetTitle::TITLE, title).into(), false);
    }

    pub fn send_toast(&mut self, title: impl Into<String>, body: impl Into<String>) {
        let toast = ToastRequest {
            title: title.into(),
            body: body.into(),
        };
        self.send_data_packet(&toast.into(), false);
    }

    pub fn send_form(&mut self, form_id: u32, form_data: String) {
        let request = ModalFormRequest { form_id, form_data };
        self.send_data_packet(&request.into(), false);
    }

    pub fn close_all_forms(&mut self) {
        self.send_data_packet(&ClientboundCloseForm.into(), false);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        lang::Language,
        protocol::{
            compression::CompressionThreshold,
            packet::{PlayStatus, RequestChunkRadius},
        },
        transport::{self, TransportCommand, TransportEndpoint},
    };

    pub fn compressor() -> ZlibCompressor {
        ZlibCompressor::new(7, CompressionThreshold::new(0), 1 << 20)
    }

    pub fn test_session() -> (NetworkSession, TransportEndpoint) {
        let (handle, endpoint) = transport::channel();
        let session = NetworkSession::new(3, ([127, 0, 0, 1], 50000).into(), handle, compressor());
        (session, endpoint)
    }

    /// Decodes every packet the session sent through the transport.
    pub fn sent_packets(endpoint: &TransportEndpoint, compression: CompressionState) -> Vec<GamePacket> {
        let compressor = compressor();
        let mut packets = Vec::new();
        for command in endpoint.commands.try_iter() {
            if let TransportCommand::Send { payload, .. } = command {
                let batch = compressor.decode_payload(compression, &payload).unwrap();
                for buffer in Payload::parse(&batch).packets() {
                    packets.push(GamePacket::decode(buffer.unwrap()).unwrap());
                }
            }
        }
        packets
    }

    fn encoded(packets: &[GamePacket], compression: CompressionState) -> Vec<u8> {
        let buffers: Vec<Vec<u8>> = packets.iter().map(GamePacket::to_bytes).collect();
        let batch = encode_batch(buffers.iter().map(Vec::as_slice));
        compressor().encode_payload(compression, batch).unwrap()
    }

    #[test]
    fn queued_packets_flush_as_one_batch() {
        let (mut session, endpoint) = test_session();
        session.enable_compression();
        session.send_data_packet(&PlayStatus::new(PlayStatus::LOGIN_SUCCESS).into(), false);
        session.send_message("hi");
        assert_eq!(session.queued(), 2);
        assert!(endpoint.commands.is_empty());

        session.flush_game_packet_queue();
        assert_eq!(session.queued(), 0);
        assert_eq!(endpoint.commands.len(), 1);
        let packets = sent_packets(&endpoint, CompressionState::Enabled);
        assert!(matches!(packets[0], GamePacket::PlayStatus(_)));
        assert_eq!(packets[1].id(), crate::protocol::packet::id::TEXT);

        session.flush_game_packet_queue();
        assert!(endpoint.commands.is_empty());
    }

    #[test]
    fn decodes_batches_and_skips_bad_packets() {
        let (mut session, _endpoint) = test_session();
        session.enable_compression();
        let radius = GamePacket::from(RequestChunkRadius {
            radius: 8,
            max_radius: 8,
        });
        let mut buffers = vec![radius.to_bytes()];
        // Truncated login.
        buffers.push(vec![0x01, 0x00]);
        buffers.push(radius.to_bytes());
        let batch = encode_batch(buffers.iter().map(Vec::as_slice));
        let payload = compressor().encode_payload(CompressionState::Enabled, batch).unwrap();

        let packets = session.handle_encoded_packet(&payload, &Language::english());
        assert_eq!(packets.len(), 2);
        assert!(session.is_connected());

        let payload = encoded(&[radius], CompressionState::Pending);
        assert!(session.handle_encoded_packet(&payload, &Language::english()).is_empty());
        assert!(!session.is_connected());
    }

    #[test]
    fn disconnect_sends_reason_and_closes_once() {
        let (mut session, endpoint) = test_session();
        session.enable_compression();
        session.send_message("queued");
        session.disconnect("bye");
        session.disconnect("again");
        assert!(!session.is_connected());

        let commands: Vec<_> = endpoint.commands.try_iter().collect();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[2], TransportCommand::Close { session_id: 3 });

        let compressor = compressor();
        let TransportCommand::Send { payload, .. } = &commands[1] else {
            panic!("expected a send");
        };
        let batch = compressor.decode_payload(CompressionState::Enabled, payload).unwrap();
        let buffer = Payload::parse(&batch).packets().next().unwrap().unwrap();
        match GamePacket::decode(buffer).unwrap() {
            GamePacket::Disconnect(packet) => assert_eq!(packet.message.as_deref(), Some("bye")),
            other => panic!("unexpected {other:?}"),
        }

        session.send_message("dropped");
        assert_eq!(session.queued(), 0);
    }

    #[test]
    fn title_sends_times_then_subtitle_then_title() {
        let (mut session, endpoint) = test_session();
        session.send_title("Top", Some("Bottom".to_owned()), Some((10, 40, 10)));
        session.flush_game_packet_queue();
        let kinds: Vec<i32> = sent_packets(&endpoint, CompressionState::Pending)
            .into_iter()
            .map(|packet| match packet {
                GamePacket::Unknown(packet) => {
                    assert_eq!(packet.id, crate::protocol::packet::id::SET_TITLE);
                    crate::protocol::Decoder::new(&packet.body).read_var_int().unwrap()
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(kinds, [SetTitle::TIMES, SetTitle::SUBTITLE, SetTitle::TITLE]);
    }
}
