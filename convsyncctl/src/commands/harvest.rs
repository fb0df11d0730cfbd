use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use convsync_core::{
    load_run_config, BrowserEngine, BrowserLauncher, BrowserSettings, ConfigurationResolver,
    DispatchStatus, HttpStatsProbe, ModeRequest, NotificationDispatcher, PageScripts, RunOptions,
    RunOrchestrator, RunResult, RunSummary,
};

use crate::{Cli, DisplayFallback, Result};

const STATS_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
pub struct HarvestReport {
    #[serde(flatten)]
    pub result: RunResult,
    pub notification: String,
}

impl DisplayFallback for HarvestReport {
    fn display(&self) -> String {
        let result = &self.result;
        let mut lines = vec![
            "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".to_string(),
            format!(
                "Resultado: {}",
                if result.success { "sucesso" } else { "falha" }
            ),
            format!("Modo: {}", result.mode),
            format!("Partição: {}", result.partition),
        ];
        if let Some(login) = &result.login {
            lines.push(format!("Login: {} ({})", login.status, login.message));
        }
        if let Some(scrape) = &result.scrape {
            lines.push(format!("Total de conversas: {}", scrape.total));
            lines.push(format!("Sucessos: {}", scrape.succeeded));
            lines.push(format!("Falhas: {}", scrape.failed));
            lines.push(format!("Novas mensagens: {}", scrape.total_new_messages));
            lines.push(format!("Motivo de parada: {}", scrape.stop_reason));
        }
        if let Some(failure) = &result.failure {
            lines.push(format!("Fase com erro: {}: {}", failure.phase, failure.message));
        }
        if let Some(path) = result.failure_artifact_path() {
            lines.push(format!("Captura: {}", path.display()));
        }
        lines.push(format!("Notificação: {}", self.notification));
        lines.push("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".to_string());
        lines.join("\n")
    }
}

pub fn mode_request(cli: &Cli) -> ModeRequest {
    if cli.full {
        ModeRequest::Full
    } else if cli.smart {
        ModeRequest::Smart
    } else {
        ModeRequest::Auto
    }
}

pub fn browser_settings(cli: &Cli) -> BrowserSettings {
    let engine = if cli.firefox {
        BrowserEngine::Firefox
    } else {
        BrowserEngine::Chromium
    };
    BrowserSettings::new(engine, !cli.headful, &cli.profiles_dir)
        .with_executable(cli.browser_path.clone())
}

/// Loads and resolves the configuration, drives one run and sends the
/// summary. Configuration problems are returned as errors; everything after
/// resolution ends up in the report.
pub async fn execute(cli: &Cli) -> Result<HarvestReport> {
    let config = load_run_config(&cli.config)?;
    let identity = config.email.clone();
    info!(
        config = %cli.config.display(),
        email = %identity,
        api = %config.api_url,
        max_conversations = config.max_conversations,
        "configuration loaded"
    );

    let probe = HttpStatsProbe::new(STATS_TIMEOUT)?;
    let resolved = ConfigurationResolver::new(&probe)
        .resolve(config, mode_request(cli))
        .await?;
    let scripts = PageScripts::load(&cli.scripts_dir)?;
    info!(
        login_bytes = scripts.login.len(),
        scraper_bytes = scripts.scraper.len(),
        "page scripts loaded"
    );

    let launcher = BrowserLauncher::new(browser_settings(cli))?;
    let mut options = RunOptions::new(!cli.headful, &cli.artifacts_dir);
    options.target_url = cli.target_url.clone();
    let orchestrator = RunOrchestrator::new(resolved, scripts, options);

    let result = orchestrator.run_until(&launcher, interrupted()).await;

    let dispatcher = NotificationDispatcher::new(&cli.registry);
    let notification = deliver(
        dispatcher,
        result.summary(&identity),
        NOTIFY_GRACE,
        interrupted(),
    )
    .await;

    Ok(HarvestReport {
        result,
        notification: notification.to_string(),
    })
}

/// Sends the summary off the main task; a Ctrl-C stops the wait.
async fn deliver<I>(
    dispatcher: NotificationDispatcher,
    summary: RunSummary,
    grace: Duration,
    interrupt: I,
) -> DispatchStatus
where
    I: Future<Output = ()>,
{
    tokio::select! {
        status = dispatcher.dispatch_detached(summary, grace) => status,
        _ = interrupt => DispatchStatus::Skipped {
            reason: "interrupted".to_string(),
        },
    }
}

async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("interrupt received, stopping run"),
        Err(err) => {
            warn!(error = %err, "cannot listen for interrupts");
            std::future::pending::<()>().await;
        }
    }
}
