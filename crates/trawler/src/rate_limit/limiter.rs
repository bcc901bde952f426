//! The limiter facade: override resolution and bucket handles.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::backend::{RateLimitBackend, RateLimitError, RateLimitResult};
use super::config::{RateLimitConfig, RateLimitMode};
use crate::config::Settings;
use crate::models::plan_key;

/// Outcome of a consume call that was admitted.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Points left in the window (0 when admitted exactly at the limit).
    pub remaining: u32,
}

/// A handle on one (mode, plan) bucket. Keys passed to the operations
/// identify the tenant (or token) being counted.
pub struct Bucket {
    backend: Arc<dyn RateLimitBackend>,
    prefix: String,
    points: u32,
    window: Duration,
}

impl Bucket {
    pub fn points(&self) -> u32 {
        self.points
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Take `points` from the window. `Limited` when the bucket is
    /// exhausted or the key is blocked; backend trouble admits the
    /// request (fail-open) after logging.
    pub async fn consume(&self, key: &str, points: u32) -> RateLimitResult<RateDecision> {
        let full_key = self.full_key(key);

        match self.backend.is_blocked(&full_key).await {
            Ok(true) => {
                return Err(RateLimitError::Limited {
                    retry_after: self.backend.window_ttl(&full_key).await.unwrap_or(None),
                })
            }
            Ok(false) => {}
            Err(e) => {
                warn!(key = %full_key, error = %e, "rate limit block check failed, allowing");
                return Ok(RateDecision {
                    remaining: self.points,
                });
            }
        }

        match self.backend.incr_window(&full_key, points, self.window).await {
            Ok(total) if total > u64::from(self.points) => Err(RateLimitError::Limited {
                retry_after: self.backend.window_ttl(&full_key).await.unwrap_or(None),
            }),
            Ok(total) => Ok(RateDecision {
                remaining: self.points.saturating_sub(total as u32),
            }),
            Err(e) => {
                warn!(key = %full_key, error = %e, "rate limit backend failed, allowing");
                Ok(RateDecision {
                    remaining: self.points,
                })
            }
        }
    }

    /// Refuse the key for `seconds` regardless of remaining points.
    pub async fn block(&self, key: &str, seconds: u64) -> RateLimitResult<()> {
        self.backend
            .block(&self.full_key(key), Duration::from_secs(seconds))
            .await
    }

    /// Charge extra points without an admit/deny decision.
    pub async fn penalty(&self, key: &str, points: u32) -> RateLimitResult<()> {
        let _ = self
            .backend
            .incr_window(&self.full_key(key), points, self.window)
            .await?;
        Ok(())
    }

    /// Return points to the window.
    pub async fn reward(&self, key: &str, points: u32) -> RateLimitResult<()> {
        self.backend.refund(&self.full_key(key), points).await
    }
}

/// Resolves (mode, token, plan, tenant) to a bucket, applying overrides
/// in fixed priority order before the table lookup:
/// 1. test-suite token markers
/// 2. the dev tenant
/// 3. manually boosted tenants
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    config: RateLimitConfig,
    test_suite_token_markers: Vec<String>,
    dev_team_id: Option<String>,
    manual_team_ids: Vec<String>,
    unlimited: bool,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>, config: RateLimitConfig, settings: &Settings) -> Self {
        if settings.rate_limit_unlimited {
            warn!("rate limiting disabled via settings; local testing only");
        }
        Self {
            backend,
            config,
            test_suite_token_markers: settings.test_suite_token_markers.clone(),
            dev_team_id: settings.dev_team_id.clone(),
            manual_team_ids: settings.manual_team_ids.clone(),
            unlimited: settings.rate_limit_unlimited,
        }
    }

    pub fn get(
        &self,
        mode: RateLimitMode,
        token: &str,
        plan: Option<&str>,
        team_id: Option<&str>,
    ) -> Bucket {
        if self.unlimited {
            return self.bucket("unlimited", u32::MAX);
        }
        if self
            .test_suite_token_markers
            .iter()
            .any(|marker| token.contains(marker.as_str()))
        {
            return self.bucket("test-suite", self.config.test_suite_points);
        }
        if let Some(team_id) = team_id {
            if self.dev_team_id.as_deref() == Some(team_id) {
                return self.bucket("dev", self.config.dev_team_points);
            }
            if self.manual_team_ids.iter().any(|id| id == team_id) {
                return self.bucket("manual", self.config.manual_team_points);
            }
        }

        let plan = plan.unwrap_or("default");
        let points = self.config.points_for(mode, plan);
        let prefix = format!("{}-{}", mode.as_str(), plan_key(plan));
        self.bucket(&prefix, points)
    }

    fn bucket(&self, prefix: &str, points: u32) -> Bucket {
        Bucket {
            backend: self.backend.clone(),
            prefix: prefix.to_string(),
            points,
            window: self.config.window,
        }
    }
}
