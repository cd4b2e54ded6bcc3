//! Runtime configuration, read once from the environment.
//!
//! Every setting has a default so the server starts with no environment at
//! all. Service URLs must be HTTPS unless they point at the local machine.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_DB_PATH: &str = ".sheets_db";
pub const DEFAULT_CORPUS_URL: &str = "https://www.sefaria.org/api";
pub const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 2000;
pub const DEFAULT_COMPLETION_LIMIT: usize = 10;
pub const DEFAULT_SEARCH_SIZE: usize = 10;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 30 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub db_path: String,
    pub corpus_url: Url,
    pub assistant_url: Option<Url>,
    /// Signing key for account sessions. Accounts are disabled without it.
    pub secret: Option<String>,
    pub password: Option<String>,
    pub save_debounce: Duration,
    pub completion_limit: usize,
    pub search_size: usize,
    pub http_timeout: Duration,
    /// Edit sessions unused for this long are saved and closed.
    pub session_idle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: DEFAULT_BIND.to_string(),
            db_path: DEFAULT_DB_PATH.to_string(),
            corpus_url: Url::parse(DEFAULT_CORPUS_URL).expect("default corpus URL is valid"),
            assistant_url: None,
            secret: None,
            password: None,
            save_debounce: Duration::from_millis(DEFAULT_SAVE_DEBOUNCE_MS),
            completion_limit: DEFAULT_COMPLETION_LIMIT,
            search_size: DEFAULT_SEARCH_SIZE,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            session_idle: Duration::from_secs(DEFAULT_SESSION_IDLE_SECS),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Build from an explicit variable map; unset or empty values use defaults.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            vars.get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Config::default();

        let corpus_url = match get("SHEETS_CORPUS_URL") {
            Some(raw) => validate_service_url("SHEETS_CORPUS_URL", &raw)?,
            None => defaults.corpus_url,
        };
        let assistant_url = get("SHEETS_ASSISTANT_URL")
            .map(|raw| validate_service_url("SHEETS_ASSISTANT_URL", &raw))
            .transpose()?;

        Ok(Config {
            bind: get("SHEETS_BIND").unwrap_or(defaults.bind),
            db_path: get("SHEETS_DB_PATH").unwrap_or(defaults.db_path),
            corpus_url,
            assistant_url,
            secret: get("SHEETS_SECRET"),
            password: get("SHEETS_PASSWORD"),
            save_debounce: Duration::from_millis(parse_number(
                "SHEETS_SAVE_DEBOUNCE_MS",
                get("SHEETS_SAVE_DEBOUNCE_MS"),
                DEFAULT_SAVE_DEBOUNCE_MS,
            )?),
            completion_limit: parse_number(
                "SHEETS_COMPLETION_LIMIT",
                get("SHEETS_COMPLETION_LIMIT"),
                DEFAULT_COMPLETION_LIMIT,
            )?,
            search_size: parse_number(
                "SHEETS_SEARCH_SIZE",
                get("SHEETS_SEARCH_SIZE"),
                DEFAULT_SEARCH_SIZE,
            )?,
            http_timeout: Duration::from_secs(parse_number(
                "SHEETS_HTTP_TIMEOUT_SECS",
                get("SHEETS_HTTP_TIMEOUT_SECS"),
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
            session_idle: Duration::from_secs(parse_number(
                "SHEETS_SESSION_IDLE_SECS",
                get("SHEETS_SESSION_IDLE_SECS"),
                DEFAULT_SESSION_IDLE_SECS,
            )?),
        })
    }

    /// Sign-in needs both a signing secret and a password to check against.
    pub fn accounts_enabled(&self) -> bool {
        self.secret.is_some() && self.password.is_some()
    }
}

fn parse_number<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value: v }),
        None => Ok(default),
    }
}

fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Parse a service base URL. Plain HTTP is only accepted for loopback hosts.
pub fn validate_service_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { name, source })?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if url.host_str().map(is_local_host).unwrap_or(false) => Ok(url),
        _ => Err(ConfigError::InsecureUrl {
            name,
            url: raw.to_string(),
        }),
    }
}
