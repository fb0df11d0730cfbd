use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::config::{ModeRequest, ResolvedRun, RunConfiguration, RunMode, DEFAULT_SMART_MAX_PAGES};
use crate::error::{ConfigError, Result};

pub const PARTITION_HEADER: &str = "X-User-Database";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid stats url: {0}")]
    Url(#[from] url::ParseError),
    #[error("stats request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("stats endpoint answered {0}")]
    Status(u16),
}

/// Reads how many messages the remote store already holds for a partition.
#[async_trait]
pub trait StatsProbe: Send + Sync {
    async fn message_count(&self, api_url: &str, partition: &str)
        -> std::result::Result<u64, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct StatsReply {
    messages: u64,
}

pub struct HttpStatsProbe {
    client: reqwest::Client,
}

impl HttpStatsProbe {
    pub fn new(timeout: Duration) -> std::result::Result<Self, ProbeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// Rewrites the configured endpoint (usually `...?action=save`) into the stats
/// query.
pub fn stats_url(api_url: &str) -> std::result::Result<Url, url::ParseError> {
    let mut url = Url::parse(api_url)?;
    url.set_query(None);
    url.query_pairs_mut().append_pair("action", "stats");
    Ok(url)
}

#[async_trait]
impl StatsProbe for HttpStatsProbe {
    async fn message_count(
        &self,
        api_url: &str,
        partition: &str,
    ) -> std::result::Result<u64, ProbeError> {
        let url = stats_url(api_url)?;
        let response = self
            .client
            .get(url)
            .header(PARTITION_HEADER, partition)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status().as_u16()));
        }
        Ok(response.json::<StatsReply>().await?.messages)
    }
}

pub struct ConfigurationResolver<'a> {
    probe: &'a dyn StatsProbe,
}

impl<'a> ConfigurationResolver<'a> {
    pub fn new(probe: &'a dyn StatsProbe) -> Self {
        Self { probe }
    }

    /// Validates `config` and fixes the run mode and derived limits. Only an
    /// invalid document is an error; an unreachable store falls back to smart
    /// mode.
    pub async fn resolve(&self, mut config: RunConfiguration, request: ModeRequest) -> Result<ResolvedRun> {
        config.validate()?;
        let partition = config.partition();

        let (mode, stored) = match request {
            ModeRequest::Full => {
                info!("full mode forced by caller");
                (RunMode::Full, None)
            }
            ModeRequest::Smart => {
                info!("smart mode forced by caller");
                (RunMode::Smart, None)
            }
            ModeRequest::Auto => match self.probe.message_count(&config.api_url, &partition).await {
                Ok(0) => {
                    info!(partition = %partition, "store is empty, switching to full mode");
                    (RunMode::Full, Some(0))
                }
                Ok(count) => {
                    info!(partition = %partition, messages = count, "store has data, smart mode");
                    (RunMode::Smart, Some(count))
                }
                Err(err) => {
                    warn!(partition = %partition, error = %err, "stats probe failed, assuming smart mode");
                    (RunMode::Smart, None)
                }
            },
        };

        match mode {
            RunMode::Full => {
                config.smart_stop = false;
                config.max_pages = Some(full_page_budget(
                    config.max_conversations,
                    config.conversations_per_page,
                )?);
            }
            RunMode::Smart => {
                config.smart_stop = true;
                if config.collision_threshold == 0 {
                    return Err(ConfigError::Invalid(
                        "collisionThreshold must be at least 1 in smart mode".to_string(),
                    ));
                }
                config.max_pages = Some(config.max_pages.unwrap_or(DEFAULT_SMART_MAX_PAGES).max(1));
            }
        }
        info!(
            mode = %mode,
            max_pages = config.max_pages.unwrap_or_default(),
            max_conversations = config.max_conversations,
            smart_stop = config.smart_stop,
            "run configuration resolved"
        );
        Ok(ResolvedRun::new(config, mode, stored))
    }
}

fn full_page_budget(max_conversations: u32, per_page: u32) -> Result<u32> {
    if per_page == 0 {
        return Err(ConfigError::Invalid(
            "conversationsPerPage must be at least 1".to_string(),
        ));
    }
    Ok((max_conversations / per_page).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedProbe {
        reply: Mutex<Option<std::result::Result<u64, ProbeError>>>,
        calls: Mutex<u32>,
    }

    impl FixedProbe {
        fn new(reply: std::result::Result<u64, ProbeError>) -> Self {
            Self {
                reply: Mutex::new(Some(reply)),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl StatsProbe for FixedProbe {
        async fn message_count(
            &self,
            _api_url: &str,
            _partition: &str,
        ) -> std::result::Result<u64, ProbeError> {
            *self.calls.lock().unwrap() += 1;
            self.reply.lock().unwrap().take().unwrap_or(Ok(1))
        }
    }

    fn config() -> RunConfiguration {
        RunConfiguration {
            email: "jean@example.nc".into(),
            password: "secret".into(),
            api_url: "https://example.nc/api.php?action=save".into(),
            max_conversations: 200,
            conversations_per_page: 20,
            ..RunConfiguration::default()
        }
    }

    #[tokio::test]
    async fn empty_store_forces_full_mode() {
        let probe = FixedProbe::new(Ok(0));
        let run = ConfigurationResolver::new(&probe)
            .resolve(config(), ModeRequest::Auto)
            .await
            .unwrap();
        assert_eq!(run.mode(), RunMode::Full);
        assert_eq!(run.max_pages(), 10);
        assert!(!run.config().smart_stop);
        assert_eq!(run.stored_messages(), Some(0));
    }

    #[tokio::test]
    async fn full_mode_needs_at_least_one_page() {
        let probe = FixedProbe::new(Ok(0));
        let mut small = config();
        small.max_conversations = 5;
        let run = ConfigurationResolver::new(&probe)
            .resolve(small, ModeRequest::Auto)
            .await
            .unwrap();
        assert_eq!(run.max_pages(), 1);
    }

    #[tokio::test]
    async fn probe_failure_falls_back_to_smart() {
        let probe = FixedProbe::new(Err(ProbeError::Status(500)));
        let run = ConfigurationResolver::new(&probe)
            .resolve(config(), ModeRequest::Auto)
            .await
            .unwrap();
        assert_eq!(run.mode(), RunMode::Smart);
        assert!(run.config().smart_stop);
        assert_eq!(run.max_pages(), DEFAULT_SMART_MAX_PAGES);
    }

    #[tokio::test]
    async fn explicit_requests_skip_the_probe() {
        let probe = FixedProbe::new(Ok(0));
        let run = ConfigurationResolver::new(&probe)
            .resolve(config(), ModeRequest::Smart)
            .await
            .unwrap();
        assert_eq!(run.mode(), RunMode::Smart);
        assert_eq!(*probe.calls.lock().unwrap(), 0);

        let run = ConfigurationResolver::new(&probe)
            .resolve(config(), ModeRequest::Full)
            .await
            .unwrap();
        assert_eq!(run.mode(), RunMode::Full);
    }

    #[tokio::test]
    async fn missing_credentials_are_fatal() {
        let probe = FixedProbe::new(Ok(10));
        let mut anonymous = config();
        anonymous.password.clear();
        let err = ConfigurationResolver::new(&probe)
            .resolve(anonymous, ModeRequest::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert_eq!(*probe.calls.lock().unwrap(), 0);
    }

    #[test]
    fn stats_url_replaces_the_action() {
        let url = stats_url("https://example.nc/annonces/api.php?action=save").unwrap();
        assert_eq!(url.as_str(), "https://example.nc/annonces/api.php?action=stats");
    }
}
