use chromiumoxide::cdp::js_protocol::runtime::{
    ConsoleApiCalledType, EventConsoleApiCalled, RemoteObject,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::BrowserResult;

static TIMESTAMP_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[?(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2})?|\d{2}:\d{2}:\d{2})")
        .expect("timestamp pattern is valid")
});

static PHASE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[([A-Z][A-Z0-9_-]*)\]\s?(.*)$").expect("tag pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    /// The page already stamped the line; it is forwarded verbatim.
    Timestamped(String),
    Tagged { tag: String, body: String },
    Untagged(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&ConsoleApiCalledType> for ConsoleLevel {
    fn from(kind: &ConsoleApiCalledType) -> Self {
        match kind {
            ConsoleApiCalledType::Error | ConsoleApiCalledType::Assert => ConsoleLevel::Error,
            ConsoleApiCalledType::Warning => ConsoleLevel::Warn,
            ConsoleApiCalledType::Debug => ConsoleLevel::Debug,
            _ => ConsoleLevel::Info,
        }
    }
}

pub fn classify(text: &str) -> ConsoleLine {
    let trimmed = text.trim_end();
    if TIMESTAMP_PREFIX.is_match(trimmed) {
        return ConsoleLine::Timestamped(trimmed.to_string());
    }
    if let Some(captures) = PHASE_TAG.captures(trimmed) {
        return ConsoleLine::Tagged {
            tag: captures[1].to_string(),
            body: captures[2].to_string(),
        };
    }
    ConsoleLine::Untagged(trimmed.to_string())
}

pub fn relay(level: ConsoleLevel, line: &ConsoleLine) {
    match line {
        ConsoleLine::Timestamped(text) => emit(level, "-", text),
        ConsoleLine::Tagged { tag, body } => emit(level, tag, body),
        ConsoleLine::Untagged(text) => emit(level, "PAGE", text),
    }
}

fn emit(level: ConsoleLevel, tag: &str, text: &str) {
    match level {
        ConsoleLevel::Debug => debug!(target: "page", tag, "{text}"),
        ConsoleLevel::Info => info!(target: "page", tag, "{text}"),
        ConsoleLevel::Warn => warn!(target: "page", tag, "{text}"),
        ConsoleLevel::Error => error!(target: "page", tag, "{text}"),
    }
}

/// Joins console arguments the way devtools prints them.
pub fn render_args(args: &[RemoteObject]) -> String {
    args.iter()
        .map(|arg| match &arg.value {
            Some(Value::String(text)) => text.clone(),
            Some(value) => value.to_string(),
            None => arg.description.clone().unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Forwards every console call of `page` to the host log until the page goes
/// away.
pub async fn spawn_console_relay(page: &Page) -> BrowserResult<JoinHandle<()>> {
    let mut events = page.event_listener::<EventConsoleApiCalled>().await?;
    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let text = render_args(&event.args);
            if text.is_empty() {
                continue;
            }
            relay(ConsoleLevel::from(&event.r#type), &classify(&text));
        }
    }))
}
