use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("failed to parse config {path}: {source}")]
    Json {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("unknown {kind} `{name}` (available: {available})")]
    UnknownKey {
        kind: &'static str,
        name: String,
        available: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
