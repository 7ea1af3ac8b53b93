//! Proxy configuration, persisted as JSON with kebab-case keys.
//!
//! Every section has defaults, so a partial file is valid. Fields the
//! relay does not know are reported and otherwise ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write config: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("compression level {0} is outside 1..=9")]
    CompressionLevel(u32),
    #[error("bind port must not be 0")]
    Port,
    #[error("backend server names must not be empty")]
    EmptyBackendName,
    #[error("backend server '{0}' is defined more than once")]
    DuplicateBackend(String),
}

/// Unknown keys of a section.
type Extra = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxyConfig {
    pub network: NetworkConfig,
    pub game: GameConfig,
    pub resource_packs: ResourcePackConfig,
    pub misc: MiscConfig,
    /// Player name -> granted permissions.
    pub permissions: BTreeMap<String, Vec<String>>,
    #[serde(flatten, skip_serializing)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub max_mtu: u16,
    /// zlib level, 1 to 9.
    pub compression_level: u32,
    /// Batches smaller than this are stored uncompressed.
    #[serde(rename = "batch-threshold")]
    pub compression_threshold: usize,
    /// Largest accepted decompressed batch.
    pub batch_limit: usize,
    pub motd: String,
    pub sub_motd: String,
    pub max_players: u32,
    #[serde(flatten, skip_serializing)]
    pub extra: Extra,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_owned(),
            bind_port: 19132,
            max_mtu: crate::raknet::MAX_MTU,
            compression_level: 7,
            compression_threshold: 256,
            batch_limit: crate::protocol::compression::DEFAULT_MAX_DECOMPRESSED,
            motd: "AquaRelay Proxy".to_owned(),
            sub_motd: "AquaRelay".to_owned(),
            max_players: 100,
            extra: Extra::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BackendConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    Priority,
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GameConfig {
    pub backends: Vec<BackendConfig>,
    pub selection_strategy: SelectionStrategy,
    #[serde(flatten, skip_serializing)]
    pub extra: Extra,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendConfig {
                name: "lobby".to_owned(),
                address: "127.0.0.1".to_owned(),
                port: 19133,
                priority: 0,
            }],
            selection_strategy: SelectionStrategy::Priority,
            extra: Extra::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ResourcePackConfig {
    pub enabled: bool,
    pub force_accept: bool,
    pub overwrite_client_packs: bool,
    pub packs_path: String,
    #[serde(flatten, skip_serializing)]
    pub extra: Extra,
}

impl Default for ResourcePackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            force_accept: false,
            overwrite_client_packs: false,
            packs_path: "resource_packs".to_owned(),
            extra: Extra::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MiscConfig {
    pub command_injection: bool,
    /// Accept fully authenticated logins.
    #[serde(rename = "xbox-auth")]
    pub online_mode: bool,
    /// Default `tracing` filter directive.
    pub log_level: String,
    pub language: String,
    #[serde(flatten, skip_serializing)]
    pub extra: Extra,
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            command_injection: true,
            online_mode: false,
            log_level: "info".to_owned(),
            language: "eng".to_owned(),
            extra: Extra::new(),
        }
    }
}

impl ProxyConfig {
    /// Loads the config at `path`, writing the default config there first
    /// if the file does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let contents = fs_err::read_to_string(path).map_err(ConfigError::Read)?;
            let config = Self::parse(&contents)?;
            tracing::info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            tracing::info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents).map_err(ConfigError::Parse)?;
        for key in config.unknown_fields() {
            tracing::warn!("Unexpected config property: {key}");
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs_err::create_dir_all(parent).map_err(ConfigError::Write)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(ConfigError::Parse)?;
        fs_err::write(path, json).map_err(ConfigError::Write)
    }

    /// Dotted paths of every unknown property.
    pub fn unknown_fields(&self) -> Vec<String> {
        let sections = [
            ("", &self.extra),
            ("network.", &self.network.extra),
            ("game.", &self.game.extra),
            ("resource-packs.", &self.resource_packs.extra),
            ("misc.", &self.misc.extra),
        ];
        sections
            .into_iter()
            .flat_map(|(prefix, extra)| extra.keys().map(move |key| format!("{prefix}{key}")))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.network.compression_level;
        if !(1..=9).contains(&level) {
            return Err(ConfigError::CompressionLevel(level));
        }
        if self.network.bind_port == 0 {
            return Err(ConfigError::Port);
        }
        let mut names = Vec::new();
        for backend in &self.game.backends {
            if backend.name.is_empty() {
                return Err(ConfigError::EmptyBackendName);
            }
            if names.contains(&&backend.name) {
                return Err(ConfigError::DuplicateBackend(backend.name.clone()));
            }
            names.push(&backend.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_uses_defaults() {
        let config = ProxyConfig::parse(r#"{ "network": { "bind-port": 19200 } }"#).unwrap();
        assert_eq!(config.network.bind_port, 19200);
        assert_eq!(config.network.compression_level, 7);
        assert_eq!(config.game.backends.len(), 1);
        assert!(config.unknown_fields().is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_collected() {
        let config = ProxyConfig::parse(
            r#"{ "colour": 1, "misc": { "debug-mode": true, "xbox-auth": true } }"#,
        )
        .unwrap();
        assert!(config.misc.online_mode);
        assert_eq!(config.unknown_fields(), ["colour", "misc.debug-mode"]);
    }

    #[test]
    fn strategy_names() {
        let config =
            ProxyConfig::parse(r#"{ "game": { "selection-strategy": "round-robin" } }"#).unwrap();
        assert_eq!(config.game.selection_strategy, SelectionStrategy::RoundRobin);
        assert!(ProxyConfig::parse(r#"{ "game": { "selection-strategy": "fastest" } }"#).is_err());
    }

    #[test]
    fn keys_are_kebab_case() {
        let config = ProxyConfig::parse(
            r#"{
                "network": { "bind-address": "127.0.0.1", "max-mtu": 1200, "batch-threshold": 512, "sub-motd": "Hub" },
                "resource-packs": { "force-accept": true, "packs-path": "packs" },
                "misc": { "command-injection": false, "log-level": "debug" },
                "game": { "backends": [{ "name": "hub", "address": "10.0.0.2", "port": 19133 }] }
            }"#,
        )
        .unwrap();
        assert!(config.unknown_fields().is_empty());
        assert_eq!(config.network.bind_address, "127.0.0.1");
        assert_eq!(config.network.max_mtu, 1200);
        assert_eq!(config.network.compression_threshold, 512);
        assert_eq!(config.network.sub_motd, "Hub");
        assert!(config.resource_packs.force_accept);
        assert_eq!(config.resource_packs.packs_path, "packs");
        assert!(!config.misc.command_injection);
        assert_eq!(config.misc.log_level, "debug");
        assert_eq!(config.game.backends[0].priority, 0);

        let written = serde_json::to_value(&config).unwrap();
        assert_eq!(written["network"]["batch-threshold"], 512);
        assert_eq!(written["misc"]["xbox-auth"], false);
        assert!(written["network"].get("bind_address").is_none());

        let old = ProxyConfig::parse(r#"{ "network": { "bind_port": 19200 } }"#).unwrap();
        assert_eq!(old.network.bind_port, 19132);
        assert_eq!(old.unknown_fields(), ["network.bind_port"]);
    }

    #[test]
    fn validation() {
        let mut config = ProxyConfig::default();
        config.network.compression_level = 0;
        assert!(matches!(config.validate(), Err(ConfigError::CompressionLevel(0))));
        config.network.compression_level = 10;
        assert!(config.validate().is_err());
        config.network.compression_level = 9;
        config.validate().unwrap();

        config.game.backends.push(config.game.backends[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateBackend(_))));
        config.game.backends[1].name.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyBackendName)));
    }

    #[test]
    fn default_config_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let created = ProxyConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = ProxyConfig::load_or_create(&path).unwrap();
        assert_eq!(loaded.network.bind_port, created.network.bind_port);
        assert_eq!(loaded.game.backends, created.game.backends);
        assert!(loaded.unknown_fields().is_empty());
    }
}
