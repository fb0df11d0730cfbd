use std::cell::{Cell, RefCell};
use std::future::Future;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::browser::{BrowserError, ConfigInjector, HarvestPage, RunSession, SessionLauncher};
use crate::config::{timeout_keys, ResolvedRun, RunMode};
use crate::error::{ConfigError, Result};
use crate::feed::ScriptedFeed;
use crate::harvest::{HarvestLimits, PaginatedScraper, ScrapeOutcome};
use crate::login::{LoginOutcome, LoginStateMachine, LoginTransition};
use crate::notify::RunSummary;
use crate::recovery::{FailureRecoveryHandler, Phase, PhaseFailure};

pub const DEFAULT_TARGET_URL: &str = "https://annonces.nc/dashboard/conversations";
pub const LOGIN_SCRIPT_FILE: &str = "login.js";
pub const SCRAPER_SCRIPT_FILE: &str = "scraper.js";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target_url: String,
    pub headless: bool,
    /// Wait for Enter before closing a visible browser.
    pub pause_before_release: bool,
    pub artifacts_dir: PathBuf,
}

impl RunOptions {
    pub fn new(headless: bool, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_url: DEFAULT_TARGET_URL.to_string(),
            headless,
            pause_before_release: !headless,
            artifacts_dir: artifacts_dir.into(),
        }
    }
}

/// The two in-page programs a run evaluates.
#[derive(Debug, Clone)]
pub struct PageScripts {
    pub login: String,
    pub scraper: String,
}

impl PageScripts {
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            login: read_script(&dir.join(LOGIN_SCRIPT_FILE))?,
            scraper: read_script(&dir.join(SCRAPER_SCRIPT_FILE))?,
        })
    }
}

fn read_script(path: &Path) -> Result<String> {
    let script = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    if script.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "page script {} is empty",
            path.display()
        )));
    }
    Ok(script)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub success: bool,
    pub mode: RunMode,
    pub partition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<LoginOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrape: Option<ScrapeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<PhaseFailure>,
}

impl RunResult {
    fn new(run: &ResolvedRun) -> Self {
        Self {
            success: false,
            mode: run.mode(),
            partition: run.partition(),
            login: None,
            scrape: None,
            failure: None,
        }
    }

    pub fn failure_artifact_path(&self) -> Option<&Path> {
        self.failure
            .as_ref()
            .and_then(|failure| failure.artifact.as_deref())
    }

    pub fn summary(&self, identity: &str) -> RunSummary {
        let mut summary = RunSummary::new(identity, self.partition.clone());
        summary.mode = Some(self.mode);
        summary.success = self.success;
        summary.scrape = self.scrape.clone();
        summary.failure = self
            .failure
            .as_ref()
            .map(|failure| format!("{}: {}", failure.phase, failure.message));
        summary
    }
}

/// What a run has established so far. Lives outside the driving future so an
/// interrupted run still reports its login and partial harvest.
struct RunProgress {
    phase: Cell<Phase>,
    login: RefCell<Option<LoginOutcome>>,
    scrape: RefCell<Option<ScrapeOutcome>>,
}

impl RunProgress {
    fn new() -> Self {
        Self {
            phase: Cell::new(Phase::Navigation),
            login: RefCell::new(None),
            scrape: RefCell::new(None),
        }
    }

    fn interrupted(&self, run: &ResolvedRun) -> RunResult {
        let phase = self.phase.get();
        let mut result = RunResult::new(run);
        result.login = self.login.take();
        result.scrape = self.scrape.take().map(ScrapeOutcome::interrupted);
        result.failure = Some(PhaseFailure {
            phase,
            message: BrowserError::Interrupted.to_string(),
            timed_out: false,
            artifact: None,
        });
        result
    }
}

/// Drives one run: navigation, injection, login, harvest. Owns no browser;
/// sessions come from the launcher handed to [`RunOrchestrator::run`].
pub struct RunOrchestrator {
    run: ResolvedRun,
    scripts: PageScripts,
    options: RunOptions,
    injector: ConfigInjector,
    recovery: FailureRecoveryHandler,
}

impl RunOrchestrator {
    pub fn new(run: ResolvedRun, scripts: PageScripts, options: RunOptions) -> Self {
        let recovery =
            FailureRecoveryHandler::new(&options.artifacts_dir, run.partition(), options.headless);
        Self {
            run,
            scripts,
            options,
            injector: ConfigInjector::new(),
            recovery,
        }
    }

    pub fn resolved(&self) -> &ResolvedRun {
        &self.run
    }

    pub async fn run<L: SessionLauncher>(&self, launcher: &L) -> RunResult {
        self.run_until(launcher, std::future::pending::<()>()).await
    }

    /// Like [`run`](Self::run), but gives up as soon as `interrupt` resolves.
    /// The browser is released on every path.
    pub async fn run_until<L, I>(&self, launcher: &L, interrupt: I) -> RunResult
    where
        L: SessionLauncher,
        I: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        info!(
            mode = %self.run.mode(),
            partition = %self.run.partition(),
            target = %self.options.target_url,
            headless = self.options.headless,
            "starting run"
        );

        let session = tokio::select! {
            opened = launcher.open() => opened,
            _ = &mut interrupt => Err(BrowserError::Interrupted),
        };
        let session = match session {
            Ok(session) => session,
            Err(err) => {
                let failure = self
                    .recovery
                    .recover_error::<<L::Session as RunSession>::Page>(None, Phase::Launch, &err)
                    .await;
                return self.failed(RunResult::new(&self.run), failure);
            }
        };

        let progress = RunProgress::new();
        let mut interrupted = false;
        let result = tokio::select! {
            result = self.drive(session.page(), &progress) => result,
            _ = &mut interrupt => {
                interrupted = true;
                warn!(phase = %progress.phase.get(), "run interrupted");
                progress.interrupted(&self.run)
            }
        };

        if self.options.pause_before_release && !interrupted {
            tokio::select! {
                _ = session.hold() => {}
                _ = &mut interrupt => warn!("interrupt received while paused, closing browser"),
            }
        }
        if let Err(err) = session.release().await {
            warn!(error = %err, "failed to release browser session");
        }
        info!(success = result.success, "run finished");
        result
    }

    async fn drive<P>(&self, page: &P, progress: &RunProgress) -> RunResult
    where
        P: HarvestPage + ?Sized,
    {
        let config = self.run.config();
        let timeouts = &config.timeouts;
        let phase = &progress.phase;
        let mut result = RunResult::new(&self.run);

        phase.set(Phase::Navigation);
        info!(url = %self.options.target_url, "navigating");
        if let Err(err) = page
            .navigate(&self.options.target_url, timeouts.duration(timeout_keys::NAVIGATION))
            .await
        {
            return self.fail(page, result, Phase::Navigation, &err).await;
        }
        sleep(timeouts.duration(timeout_keys::SETTLE)).await;

        phase.set(Phase::Injection);
        if let Err(err) = self.injector.inject(page, config).await {
            return self.fail(page, result, Phase::Injection, &err).await;
        }

        phase.set(Phase::Login);
        let machine = LoginStateMachine::new(self.scripts.login.as_str(), timeouts);
        let outcome = match machine.run(page).await {
            Ok(outcome) => outcome,
            Err(err) => return self.fail(page, result, Phase::Login, &err).await,
        };
        let transition = machine.transition(&outcome);
        result.login = Some(outcome.clone());
        progress.login.replace(Some(outcome.clone()));
        let (settle, reinject) = match transition {
            LoginTransition::Proceed { settle, reinject } => (settle, reinject),
            LoginTransition::Abort => {
                let message = match &outcome.diagnostic_code {
                    Some(code) => format!("{code}: {}", outcome.message),
                    None => outcome.message.clone(),
                };
                let failure = self
                    .recovery
                    .recover(Some(page), Phase::Login, message, false)
                    .await;
                return self.failed(result, failure);
            }
        };
        info!(settle_ms = settle.as_millis() as u64, "waiting for the page to settle");
        sleep(settle).await;
        if reinject {
            phase.set(Phase::Injection);
            if let Err(err) = self.injector.inject(page, config).await {
                return self.fail(page, result, Phase::Injection, &err).await;
            }
        }

        phase.set(Phase::Scrape);
        if let Err(err) = self
            .injector
            .mark_partition(page, &self.run.partition())
            .await
        {
            return self.fail(page, result, Phase::Scrape, &err).await;
        }
        let feed = ScriptedFeed::new(page, &self.scripts.scraper, timeouts);
        let scraper = PaginatedScraper::new(HarvestLimits::from_run(&self.run));
        let outcome = scraper.run_tracked(&feed, &progress.scrape).await;
        let scrape_error = outcome.error.clone();
        let timed_out = outcome.timed_out;
        result.scrape = Some(outcome);
        match scrape_error {
            None => {
                result.success = true;
                result
            }
            Some(message) => {
                let failure = self
                    .recovery
                    .recover(Some(page), Phase::Scrape, message, timed_out)
                    .await;
                self.failed(result, failure)
            }
        }
    }

    async fn fail<P>(&self, page: &P, result: RunResult, phase: Phase, err: &BrowserError) -> RunResult
    where
        P: HarvestPage + ?Sized,
    {
        let failure = self.recovery.recover_error(Some(page), phase, err).await;
        self.failed(result, failure)
    }

    fn failed(&self, mut result: RunResult, failure: PhaseFailure) -> RunResult {
        result.success = false;
        result.failure = Some(failure);
        result
    }
}
