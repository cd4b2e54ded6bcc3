//! Error types for the sheets service.
//!
//! Each boundary gets its own enum:
//! - corpus and assistant HTTP calls
//! - durable stores (remote document store and local cache)
//! - the persistence coordinator
//! - the edit session
//! - configuration loading

/// Failure talking to the text corpus. Treated as "not found" by the resolver.
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("could not decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("corpus reported: {0}")]
    NotFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("assistant is not configured")]
    NotConfigured,

    #[error("assistant request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("assistant returned status {0}")]
    Status(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("sheet {0} belongs to another owner")]
    Forbidden(String),

    #[error("sheet {0} no longer exists")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Recoverable persistence failures, surfaced to the user and never fatal.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PersistenceError {
    #[error("could not save sheet: {0}")]
    Write(String),

    #[error("could not load sheet: {0}")]
    Load(String),

    #[error("a newer load replaced this one")]
    Superseded,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionError {
    #[error("finish choosing a match for \"{0}\" first")]
    DisambiguationPending(String),

    #[error("no disambiguation is open")]
    NoDisambiguation,

    #[error("\"{0}\" is not one of the offered matches")]
    UnknownCandidate(String),

    #[error("entry {0} not found")]
    EntryNotFound(String),

    #[error("entry {0} is not a text source")]
    NotATextSource(String),

    #[error("source {0} has no text in either language")]
    EmptySource(String),

    #[error("version \"{0}\" has no English text")]
    VersionUnavailable(String),

    #[error("{0} must not be empty")]
    EmptyInput(&'static str),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("assistant unavailable: {0}")]
    Assistant(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is not a valid URL: {source}")]
    InvalidUrl {
        name: &'static str,
        source: url::ParseError,
    },

    #[error("{name} must use https (got {url})")]
    InsecureUrl { name: &'static str, url: String },

    #[error("{name} must be a number (got {value})")]
    InvalidNumber { name: &'static str, value: String },
}

/// Failure while wiring the service together at startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not open database: {0}")]
    Database(#[from] sled::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("could not build corpus client: {0}")]
    Corpus(#[from] CorpusError),

    #[error("could not build assistant client: {0}")]
    Assistant(#[from] AssistantError),

    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(std::io::Error),
}
