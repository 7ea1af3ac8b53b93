use anyhow::Context;
use aquarelay::{
    config::ProxyConfig,
    console,
    lang::{Language, Translator, DEFAULT_LANGUAGE},
    proxy::{ProxyContext, ProxyLoop},
    resource_pack::{MemoryPackStore, ResourcePackManager},
    transport,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Reverse proxy for Bedrock Edition servers")]
struct Args {
    /// Config file; a default one is written if it does not exist.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// `tracing` filter directive, overriding the config.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Config diagnostics are printed before the configured filter is known.
    let bootstrap = tracing_subscriber::fmt().with_env_filter(EnvFilter::new("info")).finish();
    let config = tracing::subscriber::with_default(bootstrap, || ProxyConfig::load_or_create(&args.config))?;

    let directive = args.log_level.as_deref().unwrap_or(&config.misc.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    config.validate().context("invalid config")?;

    let language = load_language(&config.misc.language);
    tracing::info!(
        "{}",
        language.translate("language.selected", &[&language.full_name(), language.code()])
    );

    let packs = if config.resource_packs.enabled {
        let store = MemoryPackStore::load_dir(Path::new(&config.resource_packs.packs_path))
            .with_context(|| format!("failed to load resource packs from {}", config.resource_packs.packs_path))?;
        ResourcePackManager::new(Box::new(store), config.resource_packs.clone())
    } else {
        ResourcePackManager::disabled()
    };

    let server_guid: u64 = rand::random();
    let (transport, address) = transport::bind(&config.network, server_guid).await?;
    let ctx = ProxyContext::new(config, Box::new(language), packs);
    tracing::info!(
        "AquaRelay started on {address} with {} backend server(s)",
        ctx.servers.all().len()
    );

    let mut proxy = ProxyLoop::new(ctx, transport, server_guid);
    match console::spawn() {
        Ok(lines) => proxy = proxy.with_console(lines),
        Err(e) => tracing::warn!("Console input unavailable: {e}"),
    }
    proxy.run().await
}

/// The configured language, read from `lang/<code>.ini` on top of English.
fn load_language(code: &str) -> Language {
    if code == DEFAULT_LANGUAGE {
        return Language::english();
    }
    let path = Path::new("lang").join(format!("{code}.ini"));
    match fs_err::read_to_string(&path) {
        Ok(contents) => Language::with_overrides(code, Language::parse_ini(&contents)),
        Err(e) => {
            tracing::warn!("Falling back to English: {e}");
            Language::english()
        }
    }
}
