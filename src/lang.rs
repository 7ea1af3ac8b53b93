//! Message translation.

use ahash::AHashMap;

/// Looks up a message by key, substituting `{%0}`, `{%1}`, ... with the
/// arguments. Unknown keys translate to themselves.
pub trait Translator: Send + Sync {
    fn translate(&self, key: &str, args: &[&str]) -> String;
}

pub const DEFAULT_LANGUAGE: &str = "eng";

const ENGLISH: &[(&str, &str)] = &[
    ("name", "English"),
    ("language.selected", "Selected {%0} ({%1}) as the base language"),
    ("proxy.backend.read_error", "Couldn't connect to the backend server ({%0})"),
    ("proxy.shutdown", "Proxy is shutting down"),
    ("proxy.stopping", "Stopping the proxy..."),
    ("session.login.corrupt_packet", "Received a corrupt packet during login"),
    ("login.unsupported_protocol", "Unsupported protocol version {%0}"),
    ("login.decode_error", "Login decode error: {%0}"),
    ("login.cancelled", "Login cancelled"),
    ("resource_pack.required", "You must accept the resource packs to join this server"),
    ("resource_pack.unknown", "Requested an unknown resource pack {%0}"),
    ("resource_pack.sequence_completed", "Resource pack sequence completed"),
    ("resource_pack.loaded", "Loaded {%0} resource packs"),
    ("command.unknown", "§cUnknown command: {%0}. Use /help for a list of available commands."),
    ("command.no_permission", "§cYou don't have permission to use this command."),
    ("command.proxylist.server", "§7(§b{%0}§7): §f{%1}"),
    ("command.proxylist.total", "§3Online players: §f{%0}"),
];

#[derive(Debug, Clone)]
pub struct Language {
    code: String,
    translations: AHashMap<String, String>,
}

impl Language {
    /// The built-in English table.
    pub fn english() -> Self {
        Self {
            code: DEFAULT_LANGUAGE.to_owned(),
            translations: ENGLISH
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    /// A language whose entries fall back to English.
    pub fn with_overrides(
        code: impl Into<String>,
        overrides: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut language = Self::english();
        language.code = code.into();
        language.translations.extend(overrides);
        language
    }

    /// Parses `key=value` lines. Blank lines and `#` comments are skipped.
    pub fn parse_ini(contents: &str) -> Vec<(String, String)> {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
            .collect()
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn full_name(&self) -> String {
        self.translate("name", &[])
    }
}

impl Default for Language {
    fn default() -> Self {
        Self::english()
    }
}

impl Translator for Language {
    fn translate(&self, key: &str, args: &[&str]) -> String {
        let mut text = self
            .translations
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_owned());
        for (i, arg) in args.iter().enumerate() {
            text = text.replace(&format!("{{%{i}}}"), arg);
        }
        text
    }
}
