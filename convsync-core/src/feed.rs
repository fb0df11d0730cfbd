use std::cell::Cell;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::browser::{BrowserError, BrowserResult, HarvestPage};
use crate::config::{timeout_keys, TimeoutTable};
use crate::harvest::{ConversationFeed, ConversationOutcome};

pub const OPERATION_GLOBAL: &str = "__CONVSYNC_OP__";

/// Request handed to the scrape script through a page global. `call` tags a
/// scrape so the script can drop work left behind by an abandoned earlier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FeedOp {
    Count,
    Scrape { index: usize, call: u64 },
    LoadMore,
}

#[derive(Debug, Deserialize)]
struct CountReply {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct ScrapeReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    new_messages: u64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoadMoreReply {
    #[serde(default)]
    loaded: bool,
}

/// [`ConversationFeed`] backed by the in-page scrape script.
pub struct ScriptedFeed<'a, P: HarvestPage + ?Sized> {
    page: &'a P,
    script: &'a str,
    count_timeout: Duration,
    conversation_timeout: Duration,
    load_more_timeout: Duration,
    calls: Cell<u64>,
}

impl<'a, P: HarvestPage + ?Sized> ScriptedFeed<'a, P> {
    pub fn new(page: &'a P, script: &'a str, timeouts: &TimeoutTable) -> Self {
        Self {
            page,
            script,
            count_timeout: timeouts.duration(timeout_keys::COUNT_SCRIPT),
            conversation_timeout: timeouts.duration(timeout_keys::CONVERSATION_SCRIPT),
            load_more_timeout: timeouts.duration(timeout_keys::LOAD_MORE_SCRIPT),
            calls: Cell::new(0),
        }
    }

    pub fn count_timeout(&self) -> Duration {
        self.count_timeout
    }

    fn next_call(&self) -> u64 {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        call
    }

    async fn call(&self, op: FeedOp, timeout: Duration) -> BrowserResult<Value> {
        self.page.evaluate(&envelope(op, self.script)?, timeout).await
    }
}

pub fn envelope(op: FeedOp, script: &str) -> BrowserResult<String> {
    let request = serde_json::to_string(&op)?;
    Ok(format!("window.{OPERATION_GLOBAL} = {request};\n{script}"))
}

#[async_trait(?Send)]
impl<'a, P: HarvestPage + ?Sized> ConversationFeed for ScriptedFeed<'a, P> {
    async fn revealed(&self) -> BrowserResult<usize> {
        let value = self.call(FeedOp::Count, self.count_timeout).await?;
        let reply: CountReply = serde_json::from_value(value)?;
        Ok(reply.count)
    }

    async fn scrape(&self, index: usize) -> BrowserResult<ConversationOutcome> {
        let op = FeedOp::Scrape {
            index,
            call: self.next_call(),
        };
        let value = match self.call(op, self.conversation_timeout).await
        {
            Ok(value) => value,
            Err(err) if err.is_script_exception() || err.is_timeout() => {
                return Ok(ConversationOutcome::Failed {
                    reason: err.to_string(),
                })
            }
            Err(err) => return Err(err),
        };
        let reply: ScrapeReply = match serde_json::from_value(value) {
            Ok(reply) => reply,
            Err(err) => {
                return Ok(ConversationOutcome::Failed {
                    reason: format!("malformed scrape result: {err}"),
                })
            }
        };
        if reply.success {
            Ok(ConversationOutcome::Harvested {
                new_messages: reply.new_messages,
            })
        } else {
            Ok(ConversationOutcome::Failed {
                reason: reply
                    .error
                    .unwrap_or_else(|| "scrape script reported failure".to_string()),
            })
        }
    }

    async fn load_more(&self) -> BrowserResult<bool> {
        let value = self.call(FeedOp::LoadMore, self.load_more_timeout).await?;
        let reply: LoadMoreReply = serde_json::from_value(value).map_err(|err| {
            BrowserError::Script(format!("malformed load_more result: {err}"))
        })?;
        debug!(loaded = reply.loaded, "load more");
        Ok(reply.loaded)
    }
}
