pub mod browser;
pub mod config;
pub mod error;
pub mod feed;
pub mod harvest;
pub mod login;
pub mod notify;
pub mod orchestrator;
pub mod recovery;
pub mod resolver;

pub use browser::{
    BrowserEngine, BrowserError, BrowserLauncher, BrowserResult, BrowserSettings, HarvestPage,
    RunSession, SessionLauncher,
};
pub use config::{
    load_or_create_run_config, load_run_config, save_run_config, ModeRequest, ResolvedRun,
    RunConfiguration, RunMode, SelectorTable, TimeoutTable, DEFAULT_CONFIG_FILE,
};
pub use error::{ConfigError, Result};
pub use feed::{FeedOp, ScriptedFeed};
pub use harvest::{
    CollisionTracker, ConversationFeed, ConversationOutcome, HarvestLimits, PaginatedScraper,
    ScrapeOutcome, StopReason,
};
pub use login::{LoginOutcome, LoginStateMachine, LoginStatus, LoginTransition};
pub use notify::{
    DispatchStatus, NotificationDispatcher, NotifyError, RunSummary, TelegramClient,
    UserRegistry, DEFAULT_REGISTRY_PATH,
};
pub use orchestrator::{
    PageScripts, RunOptions, RunOrchestrator, RunResult, DEFAULT_TARGET_URL,
};
pub use recovery::{FailureRecoveryHandler, Phase, PhaseFailure};
pub use resolver::{ConfigurationResolver, HttpStatsProbe, ProbeError, StatsProbe};
