use clap::{Parser, ValueEnum};
use lib_fanout::core::DEFAULT_OUTBOX_CAPACITY;
use lib_fanout::upstream::RedisStreamsConfig;
use lib_fanout::LifecyclePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "server_fanout.conf";

/// How connections pick their rooms.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BrokerMode {
    /// Clients send `subscribe` frames; price, trade and status channels.
    ClientDeclared,
    /// Rooms come from the caller's accounts; account channel only.
    IdentityRouted,
}

#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderKind {
    Local,
    Introspect,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Demand-driven WebSocket fan-out server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FANOUT_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "FANOUT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FANOUT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FANOUT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FANOUT_MODE", value_enum, help = "Room selection mode.")]
    pub mode: Option<BrokerMode>,

    #[clap(long, env = "FANOUT_REDIS_URL", help = "Redis connection string for the upstream streams.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "FANOUT_TOPIC_PREFIX", help = "Prefix of the upstream stream keys.")]
    pub topic_prefix: Option<String>,

    #[clap(long, env = "FANOUT_SUBSCRIPTION_PREFIX", help = "Prefix of the consumer groups this server creates.")]
    pub subscription_prefix: Option<String>,

    #[clap(long, env = "FANOUT_CONSUMER_NAME", help = "Consumer name inside each group.")]
    pub consumer_name: Option<String>,

    #[clap(long, env = "FANOUT_RETENTION_SECONDS", help = "Seconds an idle upstream subscription is kept.")]
    pub retention_seconds: Option<u64>,

    #[clap(long, env = "FANOUT_RETRY_BACKOFF_MS", help = "Delay in milliseconds before retrying a failed create/delete.")]
    pub retry_backoff_ms: Option<u64>,

    #[clap(long, env = "FANOUT_STALE_AFTER_MS", help = "Messages older than this many milliseconds are dropped.")]
    pub stale_after_ms: Option<u64>,

    #[clap(long, env = "FANOUT_READ_BLOCK_MS", help = "Blocking time in milliseconds of one upstream read.")]
    pub read_block_ms: Option<u64>,

    #[clap(long, env = "FANOUT_OUTBOX_CAPACITY", help = "Frames queued per client before new frames are dropped for it.")]
    pub outbox_capacity: Option<usize>,

    #[clap(long, env = "FANOUT_ROOM_SALT", help = "Secret mixed into account room names (identity-routed).")]
    pub room_salt: Option<String>,

    #[clap(long, env = "FANOUT_ACCOUNTS_URL", help = "Endpoint listing the caller's accounts (identity-routed).")]
    pub accounts_url: Option<String>,

    #[clap(long, env = "FANOUT_IDENTITY_DECODER", value_enum, help = "How bearer tokens are decoded (identity-routed).")]
    pub identity_decoder: Option<DecoderKind>,

    #[clap(long, env = "FANOUT_INTROSPECTION_URL", help = "Token introspection endpoint (introspect decoder).")]
    pub introspection_url: Option<String>,

    #[clap(long, env = "FANOUT_HTTP_TIMEOUT_MS", help = "Timeout in milliseconds of identity HTTP calls.")]
    pub http_timeout_ms: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            mode: other.mode.or(self.mode),
            redis_url: other.redis_url.or(self.redis_url),
            topic_prefix: other.topic_prefix.or(self.topic_prefix),
            subscription_prefix: other.subscription_prefix.or(self.subscription_prefix),
            consumer_name: other.consumer_name.or(self.consumer_name),
            retention_seconds: other.retention_seconds.or(self.retention_seconds),
            retry_backoff_ms: other.retry_backoff_ms.or(self.retry_backoff_ms),
            stale_after_ms: other.stale_after_ms.or(self.stale_after_ms),
            read_block_ms: other.read_block_ms.or(self.read_block_ms),
            outbox_capacity: other.outbox_capacity.or(self.outbox_capacity),
            room_salt: other.room_salt.or(self.room_salt),
            accounts_url: other.accounts_url.or(self.accounts_url),
            identity_decoder: other.identity_decoder.or(self.identity_decoder),
            introspection_url: other.introspection_url.or(self.introspection_url),
            http_timeout_ms: other.http_timeout_ms.or(self.http_timeout_ms),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9003),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            mode: Some(BrokerMode::ClientDeclared),
            redis_url: Some("redis://127.0.0.1/".to_string()),
            topic_prefix: Some("fanout".to_string()),
            subscription_prefix: Some("fanout-sub".to_string()),
            consumer_name: Some(format!("fanout-{}", std::process::id())),
            retention_seconds: Some(20),
            retry_backoff_ms: Some(1000),
            stale_after_ms: Some(5000),
            read_block_ms: Some(400),
            outbox_capacity: Some(DEFAULT_OUTBOX_CAPACITY),
            identity_decoder: Some(DecoderKind::Local),
            http_timeout_ms: Some(5000),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("identity-routed mode requires a room salt (FANOUT_ROOM_SALT)")]
    MissingSalt,
    #[error("identity-routed mode requires an accounts endpoint (FANOUT_ACCOUNTS_URL)")]
    MissingAccountsUrl,
    #[error("the introspect decoder requires an introspection endpoint (FANOUT_INTROSPECTION_URL)")]
    MissingIntrospectionUrl,
    #[error("TLS needs both a certificate and a key path")]
    IncompleteTls,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySettings {
    Local,
    Introspect { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeSettings {
    ClientDeclared,
    IdentityRouted {
        salt: String,
        accounts_url: String,
        decoder: IdentitySettings,
    },
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub mode: ModeSettings,
    pub upstream: RedisStreamsConfig,
    pub policy: LifecyclePolicy,
    pub stale_after: Duration,
    pub outbox_capacity: usize,
    pub http_timeout: Duration,
    pub tls: Option<TlsPaths>,
}

pub fn load_config() -> Result<Settings, ConfigError> {
    resolve(Config::parse())
}

/// Defaults, then the config file, then environment and CLI.
pub fn resolve(cli: Config) -> Result<Settings, ConfigError> {
    let explicit_path = cli.config_path.clone();
    let config_file_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if config_file_path.exists() || explicit_path.is_some() {
        let config_str = fs::read_to_string(&config_file_path)
            .map_err(|source| ConfigError::Read { path: config_file_path.clone(), source })?;
        let file_config = serde_json::from_str::<Config>(&config_str)
            .map_err(|source| ConfigError::Parse { path: config_file_path.clone(), source })?;
        current_config = current_config.merge(file_config);
    }

    validate(current_config.merge(cli))
}

fn validate(config: Config) -> Result<Settings, ConfigError> {
    let defaults = Config::defaults();
    let positive = |value: Option<u64>, fallback: Option<u64>, name: &'static str| -> Result<u64, ConfigError> {
        match value.or(fallback).unwrap_or_default() {
            0 => Err(ConfigError::Zero(name)),
            v => Ok(v),
        }
    };

    let retention = Duration::from_secs(positive(config.retention_seconds, defaults.retention_seconds, "retentionSeconds")?);
    let retry_backoff = Duration::from_millis(positive(config.retry_backoff_ms, defaults.retry_backoff_ms, "retryBackoffMs")?);
    let stale_after = Duration::from_millis(positive(config.stale_after_ms, defaults.stale_after_ms, "staleAfterMs")?);
    let read_block = Duration::from_millis(positive(config.read_block_ms, defaults.read_block_ms, "readBlockMs")?);
    let http_timeout = Duration::from_millis(positive(config.http_timeout_ms, defaults.http_timeout_ms, "httpTimeoutMs")?);
    let outbox_capacity = match config.outbox_capacity.unwrap_or(DEFAULT_OUTBOX_CAPACITY) {
        0 => return Err(ConfigError::Zero("outboxCapacity")),
        n => n,
    };

    let mode = match config.mode.unwrap_or(BrokerMode::ClientDeclared) {
        BrokerMode::ClientDeclared => ModeSettings::ClientDeclared,
        BrokerMode::IdentityRouted => {
            let salt = config.room_salt.filter(|s| !s.is_empty()).ok_or(ConfigError::MissingSalt)?;
            let accounts_url = config.accounts_url.ok_or(ConfigError::MissingAccountsUrl)?;
            let decoder = match config.identity_decoder.unwrap_or(DecoderKind::Local) {
                DecoderKind::Local => IdentitySettings::Local,
                DecoderKind::Introspect => IdentitySettings::Introspect {
                    url: config.introspection_url.ok_or(ConfigError::MissingIntrospectionUrl)?,
                },
            };
            ModeSettings::IdentityRouted { salt, accounts_url, decoder }
        }
    };

    // Identity-routed rooms follow accounts for the whole session.
    let policy = match mode {
        ModeSettings::ClientDeclared => LifecyclePolicy::OnDemand { retention, retry_backoff },
        ModeSettings::IdentityRouted { .. } => LifecyclePolicy::Pinned { retry_backoff },
    };

    let tls = match (config.tls_cert_path, config.tls_key_path) {
        (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
        (None, None) => None,
        _ => return Err(ConfigError::IncompleteTls),
    };

    let upstream_defaults = RedisStreamsConfig::default();
    let upstream = RedisStreamsConfig {
        url: config.redis_url.unwrap_or(upstream_defaults.url),
        topic_prefix: config.topic_prefix.unwrap_or(upstream_defaults.topic_prefix),
        subscription_prefix: config.subscription_prefix.unwrap_or(upstream_defaults.subscription_prefix),
        consumer_name: config.consumer_name.unwrap_or(upstream_defaults.consumer_name),
        read_block,
        ..upstream_defaults
    };

    Ok(Settings {
        port: config.port.unwrap_or(9003),
        log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
        log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
        mode,
        upstream,
        policy,
        stale_after,
        outbox_capacity,
        http_timeout,
        tls,
    })
}
