use std::cell::RefCell;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserResult};
use crate::config::ResolvedRun;

/// Counts consecutive conversations that produced nothing new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionTracker {
    consecutive: u32,
    threshold: u32,
}

impl CollisionTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn record(&mut self, new_messages: u64) {
        if new_messages > 0 {
            self.consecutive = 0;
        } else {
            self.consecutive += 1;
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn tripped(&self) -> bool {
        self.consecutive >= self.threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    CollisionThreshold,
    PageLimit,
    ConversationLimit,
    Error,
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StopReason::Completed => "completed",
            StopReason::CollisionThreshold => "collision_threshold",
            StopReason::PageLimit => "page_limit",
            StopReason::ConversationLimit => "conversation_limit",
            StopReason::Error => "error",
            StopReason::Interrupted => "interrupted",
        };
        f.write_str(label)
    }
}

/// Aggregate of one harvest. Serializes to the same shape the scrape script
/// reports, so hosts and scripts print identical summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub total_new_messages: u64,
    pub stop_reason: StopReason,
    pub pages_loaded: u32,
    /// Set when the harvest ended on a timed-out page operation.
    #[serde(skip)]
    pub timed_out: bool,
}

impl Default for ScrapeOutcome {
    fn default() -> Self {
        Self {
            success: true,
            error: None,
            total: 0,
            succeeded: 0,
            failed: 0,
            total_new_messages: 0,
            stop_reason: StopReason::Completed,
            pages_loaded: 1,
            timed_out: false,
        }
    }
}

impl ScrapeOutcome {
    fn abort(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self.stop_reason = StopReason::Error;
        self
    }

    fn abort_on(self, operation: &str, err: &BrowserError) -> Self {
        warn!(operation, error = %err, "feed operation failed, aborting harvest");
        let mut outcome = self.abort(format!("{operation} failed: {err}"));
        outcome.timed_out = err.is_timeout();
        outcome
    }

    /// Closes a harvest cut short from outside, keeping its counts.
    pub fn interrupted(mut self) -> Self {
        self.success = false;
        self.error = Some(BrowserError::Interrupted.to_string());
        self.stop_reason = StopReason::Interrupted;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationOutcome {
    Harvested { new_messages: u64 },
    Failed { reason: String },
}

/// The lazily revealed conversation list. An `Err` from any method means the
/// page itself is unusable; per-item problems are reported through
/// [`ConversationOutcome::Failed`].
#[async_trait(?Send)]
pub trait ConversationFeed {
    /// Number of conversations currently revealed.
    async fn revealed(&self) -> BrowserResult<usize>;

    async fn scrape(&self, index: usize) -> BrowserResult<ConversationOutcome>;

    /// Triggers the "load more" affordance; `false` when none remains.
    async fn load_more(&self) -> BrowserResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestLimits {
    pub max_pages: u32,
    pub max_conversations: u32,
    pub smart_stop: bool,
    pub collision_threshold: u32,
}

impl HarvestLimits {
    pub fn from_run(run: &ResolvedRun) -> Self {
        let config = run.config();
        Self {
            max_pages: run.max_pages(),
            max_conversations: config.max_conversations.max(1),
            smart_stop: config.smart_stop,
            collision_threshold: config.collision_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaginatedScraper {
    limits: HarvestLimits,
}

impl PaginatedScraper {
    pub fn new(limits: HarvestLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &HarvestLimits {
        &self.limits
    }

    /// Walks the feed until a stop condition holds. Always returns an outcome;
    /// a transport failure ends the walk with `StopReason::Error` and keeps the
    /// counts gathered so far.
    pub async fn run<F>(&self, feed: &F) -> ScrapeOutcome
    where
        F: ConversationFeed + ?Sized,
    {
        self.run_tracked(feed, &RefCell::new(None)).await
    }

    /// Same as [`run`](Self::run), mirroring the counts into `progress` after
    /// every step so a caller that drops this future still holds them.
    pub async fn run_tracked<F>(
        &self,
        feed: &F,
        progress: &RefCell<Option<ScrapeOutcome>>,
    ) -> ScrapeOutcome
    where
        F: ConversationFeed + ?Sized,
    {
        let mut outcome = ScrapeOutcome::default();
        let mut tracker = CollisionTracker::new(self.limits.collision_threshold);
        progress.replace(Some(outcome.clone()));

        let mut revealed = match feed.revealed().await {
            Ok(count) => count,
            Err(err) => return outcome.abort_on("count", &err),
        };
        if revealed == 0 {
            warn!("no conversations found on the page");
            return outcome.abort("no_conversations");
        }
        info!(
            revealed,
            max_pages = self.limits.max_pages,
            max_conversations = self.limits.max_conversations,
            smart_stop = self.limits.smart_stop,
            threshold = self.limits.collision_threshold,
            "starting harvest"
        );

        let mut next = 0usize;
        loop {
            while next < revealed {
                match feed.scrape(next).await {
                    Ok(ConversationOutcome::Harvested { new_messages }) => {
                        outcome.succeeded += 1;
                        outcome.total_new_messages += new_messages;
                        tracker.record(new_messages);
                        debug!(
                            index = next,
                            new_messages,
                            collisions = tracker.consecutive(),
                            "conversation harvested"
                        );
                    }
                    Ok(ConversationOutcome::Failed { reason }) => {
                        outcome.failed += 1;
                        warn!(index = next, reason = %reason, "conversation failed");
                    }
                    Err(err) => {
                        return self.finish(outcome.abort_on("scrape", &err));
                    }
                }
                next += 1;
                outcome.total += 1;
                progress.replace(Some(outcome.clone()));

                if let Some(reason) =
                    self.check_stop(&tracker, outcome.total, next >= revealed, outcome.pages_loaded)
                {
                    outcome.stop_reason = reason;
                    return self.finish(outcome);
                }
            }

            match feed.load_more().await {
                Ok(true) => {}
                Ok(false) => return self.finish(outcome),
                Err(err) => return self.finish(outcome.abort_on("load_more", &err)),
            }
            outcome.pages_loaded += 1;
            progress.replace(Some(outcome.clone()));
            let now_revealed = match feed.revealed().await {
                Ok(count) => count,
                Err(err) => return self.finish(outcome.abort_on("count", &err)),
            };
            if now_revealed <= revealed {
                debug!(revealed, "load more revealed nothing new");
                return self.finish(outcome);
            }
            info!(
                page = outcome.pages_loaded,
                revealed = now_revealed,
                "loaded more conversations"
            );
            revealed = now_revealed;
        }
    }

    /// Stop rules in priority order. Exhaustion without a "load more" is
    /// detected by the caller.
    fn check_stop(
        &self,
        tracker: &CollisionTracker,
        visited: u32,
        all_revealed_visited: bool,
        pages_loaded: u32,
    ) -> Option<StopReason> {
        if self.limits.smart_stop && tracker.tripped() {
            return Some(StopReason::CollisionThreshold);
        }
        if visited >= self.limits.max_conversations {
            return Some(StopReason::ConversationLimit);
        }
        if all_revealed_visited && pages_loaded >= self.limits.max_pages {
            return Some(StopReason::PageLimit);
        }
        None
    }

    fn finish(&self, outcome: ScrapeOutcome) -> ScrapeOutcome {
        info!(
            total = outcome.total,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            new_messages = outcome.total_new_messages,
            pages = outcome.pages_loaded,
            stop_reason = %outcome.stop_reason,
            "harvest finished"
        );
        outcome
    }
}
