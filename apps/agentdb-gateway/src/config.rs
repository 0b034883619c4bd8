use std::env;

use thiserror::Error;
use wallet_auth::{BYPASS_AVAILABLE, MutationAuthConfig, NonceStoreConfig};

pub const DB_URL_ENV: &str = "AGENTDB_DB_URL";
pub const NONCE_TTL_SECONDS_ENV: &str = "AGENTDB_NONCE_TTL_SECONDS";
pub const MAX_FUTURE_SKEW_SECONDS_ENV: &str = "AGENTDB_MAX_FUTURE_SKEW_SECONDS";
pub const NONCE_MAX_ENTRIES_ENV: &str = "AGENTDB_NONCE_MAX_ENTRIES";
pub const NONCE_PRUNE_INTERVAL_MS_ENV: &str = "AGENTDB_NONCE_PRUNE_INTERVAL_MS";
pub const MUTATION_AUTH_DISABLED_ENV: &str = "AGENTDB_MUTATION_AUTH_DISABLED";
pub const LOG_FORMAT_ENV: &str = "AGENTDB_LOG_FORMAT";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub db_url: Option<String>,
    pub mutation_auth: MutationAuthConfig,
    pub nonce_store: NonceStoreConfig,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: None,
            mutation_auth: MutationAuthConfig::default(),
            nonce_store: NonceStoreConfig::default(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid AGENTDB_NONCE_TTL_SECONDS: {0}")]
    InvalidNonceTtlSeconds(String),
    #[error("invalid AGENTDB_MAX_FUTURE_SKEW_SECONDS: {0}")]
    InvalidMaxFutureSkewSeconds(String),
    #[error("invalid AGENTDB_NONCE_MAX_ENTRIES: {0}")]
    InvalidNonceMaxEntries(String),
    #[error("invalid AGENTDB_NONCE_PRUNE_INTERVAL_MS: {0}")]
    InvalidNoncePruneIntervalMs(String),
    #[error("invalid AGENTDB_MUTATION_AUTH_DISABLED: {0}")]
    InvalidMutationAuthDisabled(String),
    #[error(
        "AGENTDB_MUTATION_AUTH_DISABLED is set but this build lacks the dev-auth-bypass feature"
    )]
    AuthBypassUnavailable,
    #[error("invalid AGENTDB_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_url = lookup(DB_URL_ENV)
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let nonce_ttl_seconds = parse_i64_env_lookup(
            &lookup,
            NONCE_TTL_SECONDS_ENV,
            wallet_auth::mutation::DEFAULT_NONCE_TTL_SECONDS,
            1,
            86_400,
            ConfigError::InvalidNonceTtlSeconds,
        )?;
        let max_future_skew_seconds = parse_i64_env_lookup(
            &lookup,
            MAX_FUTURE_SKEW_SECONDS_ENV,
            wallet_auth::mutation::DEFAULT_MAX_FUTURE_SKEW_SECONDS,
            0,
            3_600,
            ConfigError::InvalidMaxFutureSkewSeconds,
        )?;
        let max_entries = parse_with_lookup(
            &lookup,
            NONCE_MAX_ENTRIES_ENV,
            wallet_auth::nonce::DEFAULT_NONCE_MAX_ENTRIES,
            |raw| {
                raw.trim()
                    .parse::<usize>()
                    .map(|value| value.clamp(1, 10_000_000))
                    .map_err(|error| ConfigError::InvalidNonceMaxEntries(error.to_string()))
            },
        )?;
        let prune_interval_ms = parse_i64_env_lookup(
            &lookup,
            NONCE_PRUNE_INTERVAL_MS_ENV,
            wallet_auth::nonce::DEFAULT_NONCE_PRUNE_INTERVAL_MS,
            0,
            3_600_000,
            ConfigError::InvalidNoncePruneIntervalMs,
        )?;
        let bypass = parse_with_lookup(&lookup, MUTATION_AUTH_DISABLED_ENV, false, |raw| {
            parse_bool(&raw).map_err(ConfigError::InvalidMutationAuthDisabled)
        })?;
        if bypass && !BYPASS_AVAILABLE {
            return Err(ConfigError::AuthBypassUnavailable);
        }
        let log_format = parse_with_lookup(&lookup, LOG_FORMAT_ENV, LogFormat::Text, |raw| {
            match raw.trim().to_ascii_lowercase().as_str() {
                "" | "text" | "pretty" => Ok(LogFormat::Text),
                "json" => Ok(LogFormat::Json),
                other => Err(ConfigError::InvalidLogFormat(other.to_string())),
            }
        })?;

        Ok(Self {
            db_url,
            mutation_auth: MutationAuthConfig {
                max_future_skew_seconds,
                nonce_ttl_seconds,
                bypass,
            },
            nonce_store: NonceStoreConfig {
                max_entries,
                prune_interval_ms,
            },
            log_format,
        })
    }
}

fn parse_i64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
    error: fn(String) -> ConfigError,
) -> Result<i64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<i64>()
            .map_err(|parse_error| error(parse_error.to_string()))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(other.to_string()),
    }
}
