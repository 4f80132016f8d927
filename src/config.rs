//! Runtime configuration.
//!
//! Read from the environment (after loading `.env` if present). The backend
//! URL and API key may instead come from a connection string or, failing
//! that, from the OS credential store.

use std::env;
use std::path::PathBuf;
use thiserror::Error;

use crate::api;
use crate::storage;
use crate::sync::DEFAULT_INTERVAL_MS;

pub const ENV_BACKEND_URL: &str = "PRINTSHOP_BACKEND_URL";
pub const ENV_API_KEY: &str = "PRINTSHOP_API_KEY";
pub const ENV_CONNECTION: &str = "PRINTSHOP_CONNECTION";
pub const ENV_DB_PATH: &str = "PRINTSHOP_DB_PATH";
pub const ENV_MACHINE_ID: &str = "PRINTSHOP_MACHINE_ID";
pub const ENV_SYNC_INTERVAL_MS: &str = "PRINTSHOP_SYNC_INTERVAL_MS";
pub const ENV_PROBE_INTERVAL_MS: &str = "PRINTSHOP_PROBE_INTERVAL_MS";
pub const ENV_LOG_DIR: &str = "PRINTSHOP_LOG_DIR";

pub const DEFAULT_DB_PATH: &str = "./data/printshop.db";
pub const DEFAULT_MACHINE_ID: &str = "MACHINE-01";
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_LOG_DIR: &str = "./logs";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing configuration: {0} (set it, provide {ENV_CONNECTION}, or store credentials)")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("credential store: {0}")]
    Credentials(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub backend_url: String,
    pub api_key: String,
    pub db_path: PathBuf,
    pub machine_id: String,
    pub sync_interval_ms: u64,
    pub probe_interval_ms: u64,
    pub log_dir: PathBuf,
}

impl Config {
    /// Load configuration from the environment, falling back to the OS
    /// credential store for the backend URL, API key and machine id.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_sources(|name| env::var(name).ok(), storage::get_credential)
    }

    /// Resolve configuration from `var` (environment) and `stored`
    /// (credential store). Precedence per field is env var, connection
    /// string, stored credential, default.
    pub fn from_sources<V, S>(var: V, stored: S) -> Result<Self, ConfigError>
    where
        V: Fn(&str) -> Option<String>,
        S: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let connection = get(ENV_CONNECTION);
        let from_connection = |extract: fn(&str) -> Option<String>| {
            connection.as_deref().and_then(extract)
        };

        if let Some(raw) = connection.as_deref() {
            if api::extract_api_key_from_connection_string(raw).is_none()
                && api::extract_backend_url_from_connection_string(raw).is_none()
            {
                return Err(ConfigError::Invalid {
                    name: ENV_CONNECTION,
                    value: "<undecodable>".into(),
                });
            }
        }

        let backend_url = get(ENV_BACKEND_URL)
            .map(|u| api::normalize_backend_url(&u))
            .or_else(|| from_connection(api::extract_backend_url_from_connection_string))
            .or_else(|| stored(storage::KEY_BACKEND_URL).map(|u| api::normalize_backend_url(&u)))
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::Missing(ENV_BACKEND_URL))?;

        let api_key = get(ENV_API_KEY)
            .or_else(|| from_connection(api::extract_api_key_from_connection_string))
            .or_else(|| stored(storage::KEY_API_KEY))
            .ok_or(ConfigError::Missing(ENV_API_KEY))?;

        let machine_id = get(ENV_MACHINE_ID)
            .or_else(|| from_connection(api::extract_machine_id_from_connection_string))
            .or_else(|| stored(storage::KEY_MACHINE_ID))
            .unwrap_or_else(|| DEFAULT_MACHINE_ID.to_string());

        let paths = LocalPaths::from_lookup(&get);
        Ok(Self {
            backend_url,
            api_key,
            db_path: paths.db_path,
            machine_id,
            sync_interval_ms: parse_interval(
                ENV_SYNC_INTERVAL_MS,
                get(ENV_SYNC_INTERVAL_MS),
                DEFAULT_INTERVAL_MS,
            )?,
            probe_interval_ms: parse_interval(
                ENV_PROBE_INTERVAL_MS,
                get(ENV_PROBE_INTERVAL_MS),
                DEFAULT_PROBE_INTERVAL_MS,
            )?,
            log_dir: paths.log_dir,
        })
    }

    /// Store the backend URL, API key and machine id in the OS credential
    /// store so later runs need no environment.
    pub fn persist_credentials(&self) -> Result<(), ConfigError> {
        let pairs = [
            (storage::KEY_BACKEND_URL, self.backend_url.as_str()),
            (storage::KEY_API_KEY, self.api_key.as_str()),
            (storage::KEY_MACHINE_ID, self.machine_id.as_str()),
        ];
        for (key, value) in pairs {
            storage::set_credential(key, value)
                .map_err(|e| ConfigError::Credentials(format!("{key}: {e}")))?;
        }
        tracing::info!(machine_id = %self.machine_id, "Backend credentials stored");
        Ok(())
    }
}

/// Store and log locations. Commands that never talk to the backend need only
/// these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPaths {
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
}

impl LocalPaths {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok().filter(|v| !v.trim().is_empty()))
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            db_path: get(ENV_DB_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            log_dir: get(ENV_LOG_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
        }
    }
}

fn parse_interval(
    name: &'static str,
    raw: Option<String>,
    default: u64,
) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => match value.parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(ms),
            _ => Err(ConfigError::Invalid { name, value }),
        },
    }
}
