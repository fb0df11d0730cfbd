use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::browser::{BrowserError, HarvestPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Launch,
    Navigation,
    Injection,
    Login,
    Scrape,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Launch => "launch",
            Phase::Navigation => "navigation",
            Phase::Injection => "injection",
            Phase::Login => "login",
            Phase::Scrape => "scrape",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub message: String,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
}

/// Turns a phase failure into a recorded, non-fatal result, capturing a
/// screenshot when the run is headless.
#[derive(Debug, Clone)]
pub struct FailureRecoveryHandler {
    artifacts_dir: PathBuf,
    partition: String,
    headless: bool,
}

impl FailureRecoveryHandler {
    pub fn new(artifacts_dir: impl Into<PathBuf>, partition: impl Into<String>, headless: bool) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            partition: partition.into(),
            headless,
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// `error-<phase>-<partition>.png`, with the partition reduced to
    /// filename-safe characters.
    pub fn artifact_path(&self, phase: Phase) -> PathBuf {
        let partition: String = self
            .partition
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.artifacts_dir
            .join(format!("error-{phase}-{partition}.png"))
    }

    pub async fn recover_error<P>(
        &self,
        page: Option<&P>,
        phase: Phase,
        err: &BrowserError,
    ) -> PhaseFailure
    where
        P: HarvestPage + ?Sized,
    {
        self.recover(page, phase, err.to_string(), err.is_timeout())
            .await
    }

    pub async fn recover<P>(
        &self,
        page: Option<&P>,
        phase: Phase,
        message: String,
        timed_out: bool,
    ) -> PhaseFailure
    where
        P: HarvestPage + ?Sized,
    {
        error!(phase = %phase, timed_out, error = %message, "run phase failed");
        let artifact = match page {
            Some(page) if self.headless => self.capture(page, phase).await,
            _ => None,
        };
        PhaseFailure {
            phase,
            message,
            timed_out,
            artifact,
        }
    }

    async fn capture<P>(&self, page: &P, phase: Phase) -> Option<PathBuf>
    where
        P: HarvestPage + ?Sized,
    {
        if let Err(err) = tokio::fs::create_dir_all(&self.artifacts_dir).await {
            warn!(
                dir = %self.artifacts_dir.display(),
                error = %err,
                "cannot create artifacts directory"
            );
            return None;
        }
        let path = self.artifact_path(phase);
        match page.screenshot(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "failure screenshot saved");
                Some(path)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to capture screenshot");
                None
            }
        }
    }
}
