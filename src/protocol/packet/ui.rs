//! Chat, titles, toasts and forms.

use crate::protocol::{decoder, Decode, Decoder, Encode, Encoder};
use aquarelay_macros::{Decode, Encode};

/// Chat-style message shown to the player.
///
/// The body layout depends on `kind`: chat-like kinds carry a source name,
/// translated kinds carry parameters, everything else carries only the
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub kind: u8,
    pub needs_translation: bool,
    pub source_name: String,
    pub message: String,
    pub parameters: Vec<String>,
    pub xuid: String,
    pub platform_chat_id: String,
    pub filtered_message: String,
}

impl Text {
    pub const RAW: u8 = 0;
    pub const CHAT: u8 = 1;
    pub const TRANSLATION: u8 = 2;
    pub const POPUP: u8 = 3;
    pub const JUKEBOX_POPUP: u8 = 4;
    pub const TIP: u8 = 5;
    pub const SYSTEM: u8 = 6;
    pub const WHISPER: u8 = 7;
    pub const ANNOUNCEMENT: u8 = 8;

    pub fn new(kind: u8, message: impl Into<String>) -> Self {
        Self {
            kind,
            needs_translation: false,
            source_name: String::new(),
            message: message.into(),
            parameters: Vec::new(),
            xuid: String::new(),
            platform_chat_id: String::new(),
            filtered_message: String::new(),
        }
    }

    pub fn raw(message: impl Into<String>) -> Self {
        Self::new(Self::RAW, message)
    }

    fn has_source(&self) -> bool {
        matches!(self.kind, Self::CHAT | Self::WHISPER | Self::ANNOUNCEMENT)
    }

    fn has_parameters(&self) -> bool {
        matches!(
            self.kind,
            Self::TRANSLATION | Self::POPUP | Self::JUKEBOX_POPUP
        )
    }
}

impl Encode for Text {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.kind);
        encoder.write_bool(self.needs_translation);
        if self.has_source() {
            encoder.write_string(&self.source_name);
        }
        encoder.write_string(&self.message);
        if self.has_parameters() {
            encoder.write_var_uint(self.parameters.len().try_into().unwrap_or(u32::MAX));
            for parameter in &self.parameters {
                encoder.write_string(parameter);
            }
        }
        encoder.write_string(&self.xuid);
        encoder.write_string(&self.platform_chat_id);
        encoder.write_string(&self.filtered_message);
    }
}

impl Decode for Text {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let mut text = Text::new(decoder.read_u8()?, String::new());
        text.needs_translation = decoder.read_bool()?;
        if text.has_source() {
            text.source_name = decoder.read_string()?.to_owned();
        }
        text.message = decoder.read_string()?.to_owned();
        if text.has_parameters() {
            let count = decoder.read_var_uint()? as usize;
            for _ in 0..count {
                text.parameters.push(decoder.read_string()?.to_owned());
            }
        }
        text.xuid = decoder.read_string()?.to_owned();
        text.platform_chat_id = decoder.read_string()?.to_owned();
        text.filtered_message = decoder.read_string()?.to_owned();
        Ok(text)
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct SetTitle {
    #[encoding(varint)]
    pub kind: i32,
    pub text: String,
    #[encoding(varint)]
    pub fade_in_ticks: i32,
    #[encoding(varint)]
    pub stay_ticks: i32,
    #[encoding(varint)]
    pub fade_out_ticks: i32,
    pub xuid: String,
    pub platform_online_id: String,
    pub filtered_title_text: String,
}

impl SetTitle {
    pub const CLEAR: i32 = 0;
    pub const RESET: i32 = 1;
    pub const TITLE: i32 = 2;
    pub const SUBTITLE: i32 = 3;
    pub const ACTIONBAR: i32 = 4;
    pub const TIMES: i32 = 5;

    pub fn new(kind: i32, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            fade_in_ticks: -1,
            stay_ticks: -1,
            fade_out_ticks: -1,
            xuid: String::new(),
            platform_online_id: String::new(),
            filtered_title_text: String::new(),
        }
    }

    pub fn times(fade_in_ticks: i32, stay_ticks: i32, fade_out_ticks: i32) -> Self {
        Self {
            fade_in_ticks,
            stay_ticks,
            fade_out_ticks,
            ..Self::new(Self::TIMES, "")
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ToastRequest {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ModalFormRequest {
    #[encoding(varuint)]
    pub form_id: u32,
    pub form_data: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ModalFormResponse {
    #[encoding(varuint)]
    pub form_id: u32,
    /// JSON-encoded response; absent when the form was closed.
    #[encoding(bool_prefixed)]
    pub form_data: Option<String>,
    #[encoding(bool_prefixed)]
    pub cancel_reason: Option<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ClientboundCloseForm;
