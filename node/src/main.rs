use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use config::{Config, File as ConfigFile};
use ipkey_registry::{
    AdminSecret, CredentialStore, FileCredentialStore, KeyRegistry, MemoryCredentialStore,
    StoreKind,
};
use ipkey_rpc::{start_server, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod version;

use version::{git_commit_hash, IPKEY_VERSION};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 80;
const DEFAULT_DATA_FILE: &str = "data.json";

/// Application configuration
#[derive(Debug, Clone)]
struct AppConfig {
    config_path: Option<PathBuf>,

    // Security
    admin_secret: AdminSecret,

    // Network
    host: String,
    port: u16,

    // Storage
    storage: StoreKind,
    data_file: PathBuf,

    // Logging
    log_level: String,
    log_format: String,
}

impl AppConfig {
    fn load(config_path: Option<&str>) -> Result<Self> {
        let resolved_path = match config_path {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => None,
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("IPKEY"));
        let config = builder.build()?;

        // The unprefixed variable is what earlier deployments exported
        let legacy_admin_key = std::env::var("ADMIN_KEY").ok();

        let mut app_config = Self::from_config(&config, legacy_admin_key)?;
        app_config.config_path = resolved_path;
        Ok(app_config)
    }

    fn from_config(config: &Config, legacy_admin_key: Option<String>) -> Result<Self> {
        let admin_key = get_string_value(config, &["ADMIN_KEY", "admin_key", "security.admin_key"])
            .or_else(|| legacy_admin_key.filter(|value| !value.trim().is_empty()))
            .context("admin secret is not configured; set IPKEY_ADMIN_KEY")?;
        let admin_secret =
            AdminSecret::new(admin_key).context("admin secret must not be empty")?;

        let port = match get_string_value(config, &["PORT", "port", "server.port"]) {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid port '{raw}'"))?,
            None => DEFAULT_PORT,
        };

        let storage = get_string_value(config, &["STORAGE", "storage", "storage.backend"])
            .map(|raw| raw.parse::<StoreKind>())
            .transpose()?
            .unwrap_or(StoreKind::File);

        Ok(Self {
            config_path: None,
            admin_secret,
            host: get_string_value(config, &["HOST", "host", "server.host"])
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            storage,
            data_file: get_string_value(config, &["DATA_FILE", "data_file", "storage.data_file"])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_FILE)),
            log_level: get_string_value(config, &["LOG_LEVEL", "log_level", "logging.level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(config, &["LOG_FORMAT", "log_format", "logging.format"])
                .unwrap_or_else(|| "pretty".to_string()),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("HOST must not be empty");
        }
        if self.port == 0 {
            anyhow::bail!("PORT must be greater than zero");
        }
        if self.storage == StoreKind::File && self.data_file.as_os_str().is_empty() {
            anyhow::bail!("DATA_FILE must not be empty when using file storage");
        }
        Ok(())
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) -> Result<()> {
    if let Some(host) = matches.get_one::<String>("host") {
        config.host = host.clone();
    }

    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }

    if let Some(storage) = matches.get_one::<String>("storage") {
        config.storage = storage.parse()?;
    }

    if let Some(data_file) = matches.get_one::<String>("data-file") {
        config.data_file = PathBuf::from(data_file);
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    Ok(())
}

fn build_store(config: &AppConfig) -> Result<Arc<dyn CredentialStore>> {
    match config.storage {
        StoreKind::Memory => {
            warn!("Using volatile storage; keys will be lost on restart");
            Ok(Arc::new(MemoryCredentialStore::new()))
        }
        StoreKind::File => {
            let store = FileCredentialStore::open(&config.data_file).with_context(|| {
                format!(
                    "failed to open credential file {}",
                    config.data_file.display()
                )
            })?;
            Ok(Arc::new(store))
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn build_cli() -> Command {
    Command::new("ipkey-node")
        .version(IPKEY_VERSION)
        .about("Access key registry with per-key IP binding")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Bind address (IPKEY_HOST)"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Bind port (IPKEY_PORT)"),
        )
        .arg(
            Arg::new("storage")
                .long("storage")
                .value_name("BACKEND")
                .value_parser(["memory", "file"])
                .help("Storage back end (IPKEY_STORAGE)"),
        )
        .arg(
            Arg::new("data-file")
                .short('d')
                .long("data-file")
                .value_name("FILE")
                .help("JSON file holding the key set (IPKEY_DATA_FILE)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Log output format"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate configuration and storage, then exit"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;

    info!(
        "Starting ipkey-node {} (commit {})",
        IPKEY_VERSION,
        git_commit_hash()
    );
    if let Some(path) = &config.config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let store = build_store(&config)?;
    info!("Storage back end: {}", store.kind());
    let registry = Arc::new(KeyRegistry::open(store, config.admin_secret.clone()));

    if matches.get_flag("check") {
        info!(
            "Configuration OK: {} credential(s), listening address {}",
            registry.len(),
            config.bind_addr()
        );
        return Ok(());
    }

    let state = AppState::new(registry);
    start_server(state, &config.bind_addr(), shutdown_signal()).await?;

    info!("ipkey-node shutdown complete");
    Ok(())
}
