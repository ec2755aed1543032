//! Account-wide usage limits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::rate_limits::{from_codex, normalize, BackendUsage, ClaudeUsageReport, UsageLimits};
use crate::registry::SessionRegistry;

pub const ANTHROPIC_USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";
const ANTHROPIC_BETA: &str = "oauth-2025-04-20";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct UsageConfig {
    /// OAuth token for the Anthropic usage endpoint; without one only Codex
    /// reports are used.
    pub anthropic_oauth_token: Option<String>,
    pub usage_url: String,
    pub cache_ttl: Duration,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            anthropic_oauth_token: None,
            usage_url: ANTHROPIC_USAGE_URL.to_string(),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("invalid oauth token header")]
    InvalidToken,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug)]
struct CachedLimits {
    fetched_at: Instant,
    limits: UsageLimits,
}

/// Answers "how much of my plan is left", preferring the Anthropic account
/// report and falling back to the newest Codex report seen by any session.
#[derive(Debug)]
pub struct UsageLimitsService {
    config: UsageConfig,
    client: Client,
    registry: Arc<SessionRegistry>,
    cache: Mutex<Option<CachedLimits>>,
}

impl UsageLimitsService {
    pub fn new(config: UsageConfig, registry: Arc<SessionRegistry>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "falling back to default http client");
                Client::new()
            });
        Self {
            config,
            client,
            registry,
            cache: Mutex::new(None),
        }
    }

    pub async fn get_usage_limits(&self) -> UsageLimits {
        if let Some(limits) = self.anthropic_limits().await {
            return limits;
        }
        self.registry
            .latest_rate_limits()
            .await
            .map(|snapshot| from_codex(&snapshot))
            .unwrap_or_default()
    }

    async fn anthropic_limits(&self) -> Option<UsageLimits> {
        let token = self.config.anthropic_oauth_token.as_deref()?;
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.config.cache_ttl {
                return Some(cached.limits.clone());
            }
        }

        match self.fetch(token).await {
            Ok(report) => {
                let limits = normalize(&BackendUsage::Claude(report));
                *cache = Some(CachedLimits {
                    fetched_at: Instant::now(),
                    limits: limits.clone(),
                });
                Some(limits)
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to fetch anthropic usage");
                None
            }
        }
    }

    async fn fetch(&self, token: &str) -> Result<ClaudeUsageReport, FetchError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| FetchError::InvalidToken)?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("anthropic-beta", HeaderValue::from_static(ANTHROPIC_BETA));

        let report = self
            .client
            .get(&self.config.usage_url)
            .headers(headers)
            .send()
            .await?
            .error_for_status()?
            .json::<ClaudeUsageReport>()
            .await?;
        Ok(report)
    }
}
