use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RunMode;
use crate::harvest::ScrapeOutcome;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_REGISTRY_PATH: &str = "config/users.json";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("io error at {path:?}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("invalid user registry {path:?}: {source}")]
    Registry {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("telegram request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("telegram answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Chat ids are stored either as numbers or as strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ChatId {
    Number(i64),
    Text(String),
}

impl ChatId {
    fn normalized(&self) -> Option<String> {
        match self {
            ChatId::Number(id) => Some(id.to_string()),
            ChatId::Text(text) if text.trim().is_empty() => None,
            ChatId::Text(text) => Some(text.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredUser {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<ChatId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramSection {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRegistry {
    #[serde(default)]
    pub users: Vec<RegisteredUser>,
    #[serde(default)]
    pub telegram: Option<TelegramSection>,
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub admin_telegram_chat_id: Option<ChatId>,
}

impl UserRegistry {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NotifyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| NotifyError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        serde_json::from_str(&content).map_err(|source| NotifyError::Registry {
            source,
            path: path.to_path_buf(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.telegram.as_ref().map_or(true, |section| section.enabled)
    }

    pub fn bot_token(&self) -> Option<&str> {
        self.telegram
            .as_ref()
            .and_then(|section| section.bot_token.as_deref())
            .or(self.telegram_bot_token.as_deref())
            .filter(|token| !token.trim().is_empty())
    }

    /// Chat of the user owning `identity` or `partition`, else the
    /// administrator's.
    pub fn destination(&self, identity: &str, partition: &str) -> Option<String> {
        let identity = identity.trim().to_lowercase();
        self.users
            .iter()
            .find(|user| {
                user.email.trim().to_lowercase() == identity
                    || user.db_name.as_deref() == Some(partition)
            })
            .and_then(|user| user.telegram_chat_id.as_ref())
            .and_then(ChatId::normalized)
            .or_else(|| {
                self.admin_telegram_chat_id
                    .as_ref()
                    .and_then(ChatId::normalized)
            })
    }
}

/// What a notification says about one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub identity: String,
    pub partition: String,
    pub mode: Option<RunMode>,
    pub success: bool,
    pub scrape: Option<ScrapeOutcome>,
    pub failure: Option<String>,
    pub finished_at: DateTime<Local>,
    pub host: String,
}

impl RunSummary {
    pub fn new(identity: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            partition: partition.into(),
            mode: None,
            success: false,
            scrape: None,
            failure: None,
            finished_at: Local::now(),
            host: local_hostname(),
        }
    }

    pub fn render(&self) -> String {
        let mut text = if self.success {
            "✅ <b>Sync finished</b>\n\n".to_string()
        } else {
            "❌ <b>Sync failed</b>\n\n".to_string()
        };
        text.push_str(&format!(
            "👤 {}\n",
            escape_html(&self.identity)
        ));
        if let Some(mode) = self.mode {
            text.push_str(&format!("⚙️ Mode: <b>{mode}</b>\n"));
        }
        if let Some(scrape) = &self.scrape {
            text.push_str("📊 <b>Summary:</b>\n");
            text.push_str(&format!("  • Total: {} conversations\n", scrape.total));
            text.push_str(&format!("  • Succeeded: {}\n", scrape.succeeded));
            text.push_str(&format!("  • Failed: {}\n", scrape.failed));
            text.push_str(&format!(
                "  • New messages: {}\n",
                scrape.total_new_messages
            ));
            text.push_str(&format!("  • Stop reason: {}\n", scrape.stop_reason));
        }
        if let Some(failure) = &self.failure {
            text.push_str(&format!("⚠️ {}\n", escape_html(failure)));
        }
        text.push_str(&format!(
            "\n⏰ {} on {}",
            self.finished_at.format("%d/%m/%Y %H:%M"),
            escape_html(&self.host)
        ));
        text
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

pub fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramClient {
    pub fn new(api_base: impl Into<String>, bot_token: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        })
    }

    pub async fn send(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let response = self
            .client
            .post(url)
            .json(&SendMessage {
                chat_id,
                text,
                parse_mode: "HTML",
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    Sent { chat_id: String },
    Skipped { reason: String },
    Failed { reason: String },
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchStatus::Sent { chat_id } => write!(f, "sent to {chat_id}"),
            DispatchStatus::Skipped { reason } => write!(f, "skipped: {reason}"),
            DispatchStatus::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Best-effort delivery of run summaries. Nothing here returns an error to
/// the caller.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    registry_path: PathBuf,
    api_base: String,
}

impl NotificationDispatcher {
    pub fn new(registry_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub async fn dispatch(&self, summary: &RunSummary) -> DispatchStatus {
        let status = self.try_dispatch(summary).await;
        match &status {
            DispatchStatus::Sent { chat_id } => info!(chat_id = %chat_id, "run summary sent"),
            DispatchStatus::Skipped { reason } => info!(reason = %reason, "notification skipped"),
            DispatchStatus::Failed { reason } => warn!(reason = %reason, "notification failed"),
        }
        status
    }

    /// Runs [`dispatch`](Self::dispatch) on its own task and waits at most
    /// `grace` for it. A send still in flight after that is abandoned.
    pub async fn dispatch_detached(self, summary: RunSummary, grace: Duration) -> DispatchStatus {
        let mut task = tokio::spawn(async move { self.dispatch(&summary).await });
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                warn!(error = %err, "notification task failed");
                DispatchStatus::Failed {
                    reason: err.to_string(),
                }
            }
            Err(_) => {
                task.abort();
                warn!(grace_ms = grace.as_millis() as u64, "notification still pending, abandoned");
                DispatchStatus::Failed {
                    reason: format!("still pending after {}ms", grace.as_millis()),
                }
            }
        }
    }

    async fn try_dispatch(&self, summary: &RunSummary) -> DispatchStatus {
        if !self.registry_path.exists() {
            return DispatchStatus::Skipped {
                reason: format!("no registry at {}", self.registry_path.display()),
            };
        }
        let registry = match UserRegistry::load(&self.registry_path) {
            Ok(registry) => registry,
            Err(err) => {
                return DispatchStatus::Failed {
                    reason: err.to_string(),
                }
            }
        };
        if !registry.enabled() {
            return DispatchStatus::Skipped {
                reason: "telegram disabled".to_string(),
            };
        }
        let Some(token) = registry.bot_token() else {
            return DispatchStatus::Skipped {
                reason: "no bot token configured".to_string(),
            };
        };
        let Some(chat_id) = registry.destination(&summary.identity, &summary.partition) else {
            return DispatchStatus::Skipped {
                reason: "no destination for this identity".to_string(),
            };
        };
        let client = match TelegramClient::new(self.api_base.clone(), token) {
            Ok(client) => client,
            Err(err) => {
                return DispatchStatus::Failed {
                    reason: err.to_string(),
                }
            }
        };
        match client.send(&chat_id, &summary.render()).await {
            Ok(()) => DispatchStatus::Sent { chat_id },
            Err(err) => DispatchStatus::Failed {
                reason: err.to_string(),
            },
        }
    }
}
