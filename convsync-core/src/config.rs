use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "scraper-config.json";
pub const DEFAULT_SMART_MAX_PAGES: u32 = 5;
pub const DEFAULT_CONVERSATIONS_PER_PAGE: u32 = 20;
pub const DEFAULT_COLLISION_THRESHOLD: u32 = 5;
pub const DEFAULT_MAX_CONVERSATIONS: u32 = 600;

/// Timeout names read by the host side of a run. The remaining entries of the
/// table are consumed by the in-page scripts.
pub mod timeout_keys {
    pub const NAVIGATION: &str = "navigation";
    pub const LOGIN_SCRIPT: &str = "loginScript";
    pub const CONVERSATION_SCRIPT: &str = "conversationScript";
    pub const LOAD_MORE_SCRIPT: &str = "loadMoreScript";
    pub const COUNT_SCRIPT: &str = "countScript";
    /// Polling window the scrape script spends waiting for the list to render.
    pub const COUNT_RETRY: &str = "countRetry";
    pub const SETTLE: &str = "settle";
    pub const LOGIN_REDIRECT: &str = "loginRedirect";
}

const DEFAULT_TIMEOUTS: &[(&str, u64)] = &[
    ("modal", 1500),
    ("input", 200),
    ("submit", 300),
    ("loginSuccess", 5000),
    ("xhrTimeout", 3000),
    ("annonceModal", 1500),
    ("betweenConvs", 300),
    ("loadMore", 1000),
    ("images", 500),
    (timeout_keys::COUNT_RETRY, 10_000),
    (timeout_keys::NAVIGATION, 30_000),
    (timeout_keys::LOGIN_SCRIPT, 60_000),
    (timeout_keys::CONVERSATION_SCRIPT, 30_000),
    (timeout_keys::LOAD_MORE_SCRIPT, 15_000),
    (timeout_keys::COUNT_SCRIPT, 15_000),
    (timeout_keys::SETTLE, 2_000),
    (timeout_keys::LOGIN_REDIRECT, 5_000),
];

const DEFAULT_SELECTORS: &[(&str, &str)] = &[
    ("loginModal", "mat-dialog-container annonces-login"),
    ("loginEmail", "input[type=\"email\"]"),
    ("loginPassword", "input[type=\"password\"]"),
    ("loginSubmit", "button[type=\"submit\"]"),
    ("convList", ".conversations__sidebar__content > .clickable"),
    ("convTitle", ".text-dark.text-sm"),
    ("convUser", ".font-weight-normal.position-relative"),
    (
        "voirPlus",
        ".conversations__sidebar__content button.rounded-pill",
    ),
    ("annonceBtn", "button.btn-primary.ml-2"),
    (
        "annonceDesc",
        ".mat-dialog-container .card-body .pre-wrap.text-justify",
    ),
    (
        "annonceBadge",
        ".mat-dialog-container .badge.badge-light.text-sm",
    ),
    ("annonceClose", ".mat-dialog-container .text-2x"),
    ("images", ".chat-content annonces-image img"),
];

/// Named timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeoutTable(BTreeMap<String, u64>);

impl TimeoutTable {
    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.get(name).copied()
    }

    /// Looks up `name`, falling back to the built-in default for it.
    pub fn duration(&self, name: &str) -> Duration {
        let millis = self
            .get(name)
            .or_else(|| default_timeout(name))
            .unwrap_or(30_000);
        Duration::from_millis(millis)
    }

    pub fn set(&mut self, name: &str, millis: u64) -> Result<()> {
        if !self.0.contains_key(name) {
            return Err(ConfigError::UnknownKey {
                kind: "timeout",
                name: name.to_string(),
                available: self.names().join(", "),
            });
        }
        self.0.insert(name.to_string(), millis);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    fn fill_defaults(&mut self) {
        for (name, value) in DEFAULT_TIMEOUTS {
            self.0.entry((*name).to_string()).or_insert(*value);
        }
    }
}

impl Default for TimeoutTable {
    fn default() -> Self {
        let mut table = Self(BTreeMap::new());
        table.fill_defaults();
        table
    }
}

fn default_timeout(name: &str) -> Option<u64> {
    DEFAULT_TIMEOUTS
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| *value)
}

/// Logical element name to CSS selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectorTable(BTreeMap<String, String>);

impl SelectorTable {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, selector: impl Into<String>) -> Result<()> {
        if !self.0.contains_key(name) {
            return Err(ConfigError::UnknownKey {
                kind: "selector",
                name: name.to_string(),
                available: self.names().join(", "),
            });
        }
        self.0.insert(name.to_string(), selector.into());
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    fn fill_defaults(&mut self) {
        for (name, value) in DEFAULT_SELECTORS {
            self.0
                .entry((*name).to_string())
                .or_insert_with(|| (*value).to_string());
        }
    }
}

impl Default for SelectorTable {
    fn default() -> Self {
        let mut table = Self(BTreeMap::new());
        table.fill_defaults();
        table
    }
}

/// The document shared by the host and the in-page scripts. Field names are
/// camelCase because the scripts read the same JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfiguration {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(
        rename = "dbName",
        alias = "db_name",
        alias = "dataStoreId",
        default
    )]
    pub data_store_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    #[serde(default = "default_max_conversations")]
    pub max_conversations: u32,
    #[serde(default = "default_smart_stop")]
    pub smart_stop: bool,
    #[serde(default = "default_collision_threshold")]
    pub collision_threshold: u32,
    #[serde(default = "default_conversations_per_page")]
    pub conversations_per_page: u32,
    #[serde(default)]
    pub timeouts: TimeoutTable,
    #[serde(default)]
    pub selectors: SelectorTable,
}

fn default_max_conversations() -> u32 {
    DEFAULT_MAX_CONVERSATIONS
}

fn default_smart_stop() -> bool {
    true
}

fn default_collision_threshold() -> u32 {
    DEFAULT_COLLISION_THRESHOLD
}

fn default_conversations_per_page() -> u32 {
    DEFAULT_CONVERSATIONS_PER_PAGE
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            api_url: "http://localhost/annonces/api.php?action=save".to_string(),
            data_store_id: String::new(),
            max_pages: Some(DEFAULT_SMART_MAX_PAGES),
            max_conversations: DEFAULT_MAX_CONVERSATIONS,
            smart_stop: true,
            collision_threshold: DEFAULT_COLLISION_THRESHOLD,
            conversations_per_page: DEFAULT_CONVERSATIONS_PER_PAGE,
            timeouts: TimeoutTable::default(),
            selectors: SelectorTable::default(),
        }
    }
}

impl RunConfiguration {
    /// Checks the invariants that must hold before a browser session starts.
    pub fn validate(&self) -> Result<()> {
        if self.email.trim().is_empty() || self.password.is_empty() {
            return Err(ConfigError::Invalid(
                "missing credentials: email and password are required".to_string(),
            ));
        }
        url::Url::parse(&self.api_url).map_err(|err| {
            ConfigError::Invalid(format!("apiUrl `{}` is not a valid URL: {err}", self.api_url))
        })?;
        if self.max_conversations == 0 {
            return Err(ConfigError::Invalid(
                "maxConversations must be at least 1".to_string(),
            ));
        }
        if self.conversations_per_page == 0 {
            return Err(ConfigError::Invalid(
                "conversationsPerPage must be at least 1".to_string(),
            ));
        }
        if self.smart_stop && self.collision_threshold == 0 {
            return Err(ConfigError::Invalid(
                "collisionThreshold must be at least 1 when smartStop is enabled".to_string(),
            ));
        }
        let count_limit = self.timeouts.duration(timeout_keys::COUNT_SCRIPT);
        let count_polling = self.timeouts.duration(timeout_keys::COUNT_RETRY);
        if count_limit <= count_polling {
            return Err(ConfigError::Invalid(format!(
                "timeout {} ({}ms) must exceed {} ({}ms)",
                timeout_keys::COUNT_SCRIPT,
                count_limit.as_millis(),
                timeout_keys::COUNT_RETRY,
                count_polling.as_millis()
            )));
        }
        Ok(())
    }

    /// Partition identifier, derived from the identity when the document does
    /// not carry one.
    pub fn partition(&self) -> String {
        if !self.data_store_id.trim().is_empty() {
            return self.data_store_id.clone();
        }
        let local = self.email.split('@').next().unwrap_or_default();
        let normalized: String = local
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("annonces_messages_{normalized}")
    }

    fn fill_defaults(&mut self) {
        self.timeouts.fill_defaults();
        self.selectors.fill_defaults();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Full,
    Smart,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::Smart => write!(f, "smart"),
        }
    }
}

/// What the caller asked for before the store was consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeRequest {
    #[default]
    Auto,
    Full,
    Smart,
}

/// A configuration whose derived fields have been computed. Nothing mutates it
/// after resolution.
#[derive(Debug, Clone)]
pub struct ResolvedRun {
    config: RunConfiguration,
    mode: RunMode,
    stored_messages: Option<u64>,
}

impl ResolvedRun {
    pub(crate) fn new(config: RunConfiguration, mode: RunMode, stored_messages: Option<u64>) -> Self {
        Self {
            config,
            mode,
            stored_messages,
        }
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn stored_messages(&self) -> Option<u64> {
        self.stored_messages
    }

    pub fn max_pages(&self) -> u32 {
        self.config.max_pages.unwrap_or(DEFAULT_SMART_MAX_PAGES).max(1)
    }

    pub fn partition(&self) -> String {
        self.config.partition()
    }
}

/// Reads a run configuration, picking the format from the file extension
/// (`.toml` or JSON otherwise). Missing tables are filled with defaults; the
/// result is not validated.
pub fn load_run_config<P: AsRef<Path>>(path: P) -> Result<RunConfiguration> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let mut config: RunConfiguration = if is_toml(path) {
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            source,
            path: path.to_path_buf(),
        })?
    } else {
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            source,
            path: path.to_path_buf(),
        })?
    };
    config.fill_defaults();
    Ok(config)
}

/// Like [`load_run_config`], but writes and returns the defaults when the file
/// does not exist yet.
pub fn load_or_create_run_config<P: AsRef<Path>>(path: P) -> Result<(RunConfiguration, bool)> {
    let path = path.as_ref();
    if path.exists() {
        return Ok((load_run_config(path)?, false));
    }
    let config = RunConfiguration::default();
    save_run_config(path, &config)?;
    Ok((config, true))
}

pub fn save_run_config<P: AsRef<Path>>(path: P, config: &RunConfiguration) -> Result<()> {
    let path = path.as_ref();
    let rendered = if is_toml(path) {
        toml::to_string_pretty(config).map_err(|err| ConfigError::Serialize(err.to_string()))?
    } else {
        serde_json::to_string_pretty(config)
            .map_err(|err| ConfigError::Serialize(err.to_string()))?
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
    }
    std::fs::write(path, rendered).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn credentials() -> RunConfiguration {
        RunConfiguration {
            email: "jane@example.com".into(),
            password: "secret".into(),
            ..RunConfiguration::default()
        }
    }

    #[test]
    fn partial_tables_are_merged_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"email":"a@b.c","password":"x","apiUrl":"http://h/api.php?action=save",
               "timeouts":{"modal":9000},"selectors":{"convList":".custom"}}"#,
        )
        .unwrap();

        let config = load_run_config(&path).unwrap();
        assert_eq!(config.timeouts.get("modal"), Some(9000));
        assert_eq!(config.timeouts.get("xhrTimeout"), Some(3000));
        assert_eq!(config.selectors.get("convList"), Some(".custom"));
        assert!(config.selectors.get("voirPlus").is_some());
        assert_eq!(config.max_conversations, DEFAULT_MAX_CONVERSATIONS);
        assert!(config.smart_stop);
    }

    #[test]
    fn toml_documents_are_supported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            "email = \"a@b.c\"\npassword = \"x\"\napiUrl = \"http://h/api\"\ndbName = \"store_a\"\nmaxConversations = 40\n",
        )
        .unwrap();

        let config = load_run_config(&path).unwrap();
        assert_eq!(config.data_store_id, "store_a");
        assert_eq!(config.max_conversations, 40);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let config = RunConfiguration::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_threshold_is_rejected_only_with_smart_stop() {
        let mut config = credentials();
        config.collision_threshold = 0;
        assert!(config.validate().is_err());
        config.smart_stop = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn count_timeout_must_outlast_in_page_polling() {
        let mut config = credentials();
        assert!(config.validate().is_ok());
        config.timeouts.set(timeout_keys::COUNT_SCRIPT, 10_000).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("countScript"));
        config.timeouts.set(timeout_keys::COUNT_RETRY, 4_000).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_timeout_names_are_rejected() {
        let mut table = TimeoutTable::default();
        let err = table.set("nope", 10).unwrap_err();
        assert!(err.to_string().contains("modal"));
        table.set("modal", 10).unwrap();
        assert_eq!(table.get("modal"), Some(10));
    }

    #[test]
    fn partition_falls_back_to_identity() {
        let mut config = credentials();
        config.email = "Jane.Doe@example.com".into();
        assert_eq!(config.partition(), "annonces_messages_jane_doe");
        config.data_store_id = "custom".into();
        assert_eq!(config.partition(), "custom");
    }

    #[test]
    fn save_then_load_preserves_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/run.json");
        let config = credentials();
        save_run_config(&path, &config).unwrap();
        assert_eq!(load_run_config(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.json");
        let (config, created) = load_or_create_run_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config, RunConfiguration::default());
    }
}
