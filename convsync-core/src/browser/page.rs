use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::error::{BrowserError, BrowserResult};

/// What a run needs from a live page. The site-specific DOM logic stays inside
/// the scripts handed to [`HarvestPage::evaluate`].
#[async_trait(?Send)]
pub trait HarvestPage {
    async fn navigate(&self, url: &str, timeout: Duration) -> BrowserResult<()>;

    /// Evaluates `script`, awaiting any promise it returns, and hands back the
    /// JSON value it resolved to (`null` for `undefined`).
    async fn evaluate(&self, script: &str, timeout: Duration) -> BrowserResult<Value>;

    async fn screenshot(&self, path: &Path) -> BrowserResult<()>;
}

/// Scoped acquisition of a browser for one run.
#[async_trait(?Send)]
pub trait SessionLauncher {
    type Session: RunSession;

    async fn open(&self) -> BrowserResult<Self::Session>;
}

#[async_trait(?Send)]
pub trait RunSession {
    type Page: HarvestPage;

    fn page(&self) -> &Self::Page;

    /// Waits for the operator to dismiss a visible browser.
    async fn hold(&self);

    /// Releases every resource held by the session.
    async fn release(self) -> BrowserResult<()>;
}

pub async fn bounded<T, F>(label: &str, limit: Duration, operation: F) -> BrowserResult<T>
where
    F: Future<Output = BrowserResult<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(BrowserError::Timeout(format!(
            "{label} after {}ms",
            limit.as_millis()
        ))),
    }
}
