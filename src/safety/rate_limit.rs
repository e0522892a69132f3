//! Per-API rate limiting with throttling, exponential backoff, and
//! persisted state.
//!
//! Usage ratios are compared in [0, 1] everywhere: warning at 0.8 (1 s
//! sleep), critical at 0.95 (5 s sleep), refusal at 1.0. Backoff starts at
//! 1 s, doubles per consecutive failure up to 60 s, and resets on success.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const WARNING_THRESHOLD: f64 = 0.8;
const CRITICAL_THRESHOLD: f64 = 0.95;
const WARNING_DELAY: Duration = Duration::from_secs(1);
const CRITICAL_DELAY: Duration = Duration::from_secs(5);
const BACKOFF_INITIAL_SECS: f64 = 1.0;
const BACKOFF_MULTIPLIER: f64 = 2.0;
const BACKOFF_MAX_SECS: f64 = 60.0;

/// Rate limit snapshot for one API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitState {
    pub limit: u64,
    pub remaining: u64,
    pub used: u64,
    pub reset_time: DateTime<Utc>,
}

impl RateLimitState {
    pub fn new(limit: u64, remaining: u64, reset_time: DateTime<Utc>) -> Self {
        Self {
            limit,
            remaining: remaining.min(limit),
            used: limit - remaining.min(limit),
            reset_time,
        }
    }

    /// Usage ratio in [0, 1].
    pub fn usage_ratio(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.used as f64 / self.limit as f64
    }

    pub fn seconds_until_reset(&self) -> f64 {
        let delta = self.reset_time - Utc::now();
        (delta.num_milliseconds() as f64 / 1000.0).max(0.0)
    }
}

/// Per-API throttling status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleStatus {
    Ok,
    Warning,
    Critical,
    Exceeded,
    Unknown,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    rate_limits: BTreeMap<String, RateLimitState>,
    #[serde(default)]
    backoff_delays: BTreeMap<String, f64>,
}

/// Rate limiter with persisted per-API state.
pub struct RateLimiter {
    state: Mutex<PersistedState>,
    state_path: PathBuf,
    throttling_enabled: bool,
}

impl RateLimiter {
    /// Load state from `state_path`, starting empty when the file is
    /// missing or unreadable.
    pub fn open(state_path: impl AsRef<Path>) -> Self {
        let state_path = state_path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&state_path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "corrupt rate limiter state, starting empty");
                    PersistedState::default()
                }
            },
            Err(_) => {
                debug!(path = %state_path.display(), "no rate limiter state found");
                PersistedState::default()
            }
        };

        info!(
            apis = state.rate_limits.len(),
            path = %state_path.display(),
            "rate limiter initialized"
        );
        Self {
            state: Mutex::new(state),
            state_path,
            throttling_enabled: true,
        }
    }

    pub fn with_throttling(mut self, enabled: bool) -> Self {
        self.throttling_enabled = enabled;
        self
    }

    /// Replace the tracked state for an API (typically from response
    /// headers) and flush to disk.
    pub fn update(&self, api: &str, limit: u64, remaining: u64, reset_time: DateTime<Utc>) -> Result<()> {
        let state = RateLimitState::new(limit, remaining, reset_time);
        debug!(
            api,
            limit,
            remaining,
            ratio = state.usage_ratio(),
            "rate limit updated"
        );
        let mut guard = self.lock()?;
        guard.rate_limits.insert(api.to_string(), state);
        self.save(&guard)
    }

    /// Check that `required` requests fit in the remaining budget. Refusal
    /// carries seconds-until-reset so callers can distinguish it from
    /// provider faults.
    pub fn check(&self, api: &str, required: u64) -> Result<()> {
        let guard = self.lock()?;
        let Some(state) = guard.rate_limits.get(api) else {
            // No info yet: allow.
            return Ok(());
        };

        if state.remaining < required {
            let wait = state.seconds_until_reset();
            warn!(api, remaining = state.remaining, required, wait, "rate limit exceeded");
            return Err(Error::rate_limited(api, wait));
        }
        Ok(())
    }

    /// Sleep when approaching the limit: 1 s past the warning threshold,
    /// 5 s past the critical threshold.
    pub async fn wait_if_needed(&self, api: &str) -> Result<()> {
        if !self.throttling_enabled {
            return Ok(());
        }

        let delay = {
            let guard = self.lock()?;
            match guard.rate_limits.get(api) {
                Some(state) if state.usage_ratio() >= CRITICAL_THRESHOLD => {
                    warn!(api, ratio = state.usage_ratio(), "critical throttling");
                    Some(CRITICAL_DELAY)
                }
                Some(state) if state.usage_ratio() >= WARNING_THRESHOLD => {
                    info!(api, ratio = state.usage_ratio(), "warning throttling");
                    Some(WARNING_DELAY)
                }
                _ => None,
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Check-with-recovery: throttle if needed, then check the budget. A
    /// refusal triggers one backoff-and-recheck; a second refusal surfaces
    /// to the caller.
    pub async fn acquire(&self, api: &str, required: u64) -> Result<()> {
        self.wait_if_needed(api).await?;
        match self.check(api, required) {
            Ok(()) => {
                self.reset_backoff(api)?;
                Ok(())
            }
            Err(Error::RateLimited { .. }) => {
                self.backoff(api).await?;
                self.check(api, required)
            }
            Err(e) => Err(e),
        }
    }

    /// Record that requests were spent against an API's budget.
    pub fn track_request(&self, api: &str, requests_used: u64) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(state) = guard.rate_limits.get_mut(api) {
            let spent = requests_used.min(state.remaining);
            state.remaining -= spent;
            state.used += spent;
            debug!(api, remaining = state.remaining, used = state.used, "request tracked");
            self.save(&guard)?;
        }
        Ok(())
    }

    /// Apply one step of exponential backoff for an API and sleep it.
    pub async fn backoff(&self, api: &str) -> Result<Duration> {
        let delay = {
            let mut guard = self.lock()?;
            let current = guard
                .backoff_delays
                .get(api)
                .copied()
                .unwrap_or(BACKOFF_INITIAL_SECS / BACKOFF_MULTIPLIER);
            let next = (current * BACKOFF_MULTIPLIER).min(BACKOFF_MAX_SECS);
            guard.backoff_delays.insert(api.to_string(), next);
            self.save(&guard)?;
            Duration::from_secs_f64(next)
        };

        warn!(api, delay_secs = delay.as_secs_f64(), "backing off");
        tokio::time::sleep(delay).await;
        Ok(delay)
    }

    /// Clear backoff for an API after a success.
    pub fn reset_backoff(&self, api: &str) -> Result<()> {
        let mut guard = self.lock()?;
        if guard.backoff_delays.remove(api).is_some() {
            debug!(api, "backoff reset");
            self.save(&guard)?;
        }
        Ok(())
    }

    /// Throttling status for one API.
    pub fn status(&self, api: &str) -> ThrottleStatus {
        let Ok(guard) = self.lock() else {
            return ThrottleStatus::Unknown;
        };
        match guard.rate_limits.get(api) {
            None => ThrottleStatus::Unknown,
            Some(state) => {
                let ratio = state.usage_ratio();
                if ratio >= 1.0 {
                    ThrottleStatus::Exceeded
                } else if ratio >= CRITICAL_THRESHOLD {
                    ThrottleStatus::Critical
                } else if ratio >= WARNING_THRESHOLD {
                    ThrottleStatus::Warning
                } else {
                    ThrottleStatus::Ok
                }
            }
        }
    }

    /// Snapshot of the tracked state for an API.
    pub fn state_for(&self, api: &str) -> Option<RateLimitState> {
        self.lock().ok()?.rate_limits.get(api).cloned()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PersistedState>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("rate limiter lock poisoned: {e}")))
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::storage(format!("creating state dir: {e}")))?;
            }
        }
        let data = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.state_path, data)
            .map_err(|e| Error::storage(format!("writing rate limiter state: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn limiter() -> (TempDir, RateLimiter) {
        let dir = TempDir::new().unwrap();
        let limiter = RateLimiter::open(dir.path().join("rate_limiter.json"));
        (dir, limiter)
    }

    fn reset_in_one_hour() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::hours(1)
    }

    #[test]
    fn test_unknown_api_allowed() {
        let (_dir, limiter) = limiter();
        assert!(limiter.check("github", 10).is_ok());
        assert_eq!(limiter.status("github"), ThrottleStatus::Unknown);
    }

    #[test]
    fn test_refusal_when_budget_insufficient() {
        let (_dir, limiter) = limiter();
        limiter
            .update("github", 5000, 5, reset_in_one_hour())
            .unwrap();

        // 10 needed, 5 remaining: refused with seconds-until-reset.
        let err = limiter.check("github", 10).unwrap_err();
        match err {
            Error::RateLimited { api, retry_after_secs } => {
                assert_eq!(api, "github");
                assert!(retry_after_secs > 3500.0);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }

        // 3 needed fits.
        assert!(limiter.check("github", 3).is_ok());
    }

    #[test]
    fn test_invariant_used_plus_remaining_is_limit() {
        let (_dir, limiter) = limiter();
        limiter
            .update("github", 100, 80, reset_in_one_hour())
            .unwrap();

        for _ in 0..30 {
            limiter.track_request("github", 5).unwrap();
            let state = limiter.state_for("github").unwrap();
            assert_eq!(state.used + state.remaining, state.limit);
            assert!(state.used <= state.limit);
        }

        // Fully exhausted, never past the limit.
        let state = limiter.state_for("github").unwrap();
        assert_eq!(state.remaining, 0);
        assert_eq!(state.used, 100);
    }

    #[test]
    fn test_status_bands() {
        let (_dir, limiter) = limiter();
        let reset = reset_in_one_hour();

        limiter.update("api", 100, 50, reset).unwrap();
        assert_eq!(limiter.status("api"), ThrottleStatus::Ok);

        limiter.update("api", 100, 15, reset).unwrap();
        assert_eq!(limiter.status("api"), ThrottleStatus::Warning);

        limiter.update("api", 100, 3, reset).unwrap();
        assert_eq!(limiter.status("api"), ThrottleStatus::Critical);

        limiter.update("api", 100, 0, reset).unwrap();
        assert_eq!(limiter.status("api"), ThrottleStatus::Exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_sleeps_at_warning() {
        let (_dir, limiter) = limiter();
        limiter
            .update("api", 100, 15, reset_in_one_hour())
            .unwrap();

        let start = tokio::time::Instant::now();
        limiter.wait_if_needed("api").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_caps() {
        let (_dir, limiter) = limiter();

        let d1 = limiter.backoff("api").await.unwrap();
        assert_eq!(d1, Duration::from_secs(1));
        let d2 = limiter.backoff("api").await.unwrap();
        assert_eq!(d2, Duration::from_secs(2));
        let d3 = limiter.backoff("api").await.unwrap();
        assert_eq!(d3, Duration::from_secs(4));

        for _ in 0..10 {
            limiter.backoff("api").await.unwrap();
        }
        let capped = limiter.backoff("api").await.unwrap();
        assert_eq!(capped, Duration::from_secs(60));

        // Success clears the ladder.
        limiter.reset_backoff("api").unwrap();
        let fresh = limiter.backoff("api").await.unwrap();
        assert_eq!(fresh, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_retries_once_then_surfaces() {
        let (_dir, limiter) = limiter();
        limiter
            .update("github", 100, 0, reset_in_one_hour())
            .unwrap();

        // Budget never recovers: one backoff, then the refusal surfaces.
        let result = limiter.acquire("github", 1).await;
        assert!(matches!(result, Err(Error::RateLimited { .. })));

        // With budget available, acquire succeeds and clears backoff.
        limiter
            .update("github", 100, 50, reset_in_one_hour())
            .unwrap();
        limiter.acquire("github", 1).await.unwrap();
        let fresh = limiter.backoff("github").await.unwrap();
        assert_eq!(fresh, Duration::from_secs(1));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rate_limiter.json");
        let reset = reset_in_one_hour();

        {
            let limiter = RateLimiter::open(&path);
            limiter.update("github", 5000, 4200, reset).unwrap();
        }

        let reloaded = RateLimiter::open(&path);
        let state = reloaded.state_for("github").unwrap();
        assert_eq!(state.limit, 5000);
        assert_eq!(state.remaining, 4200);
        assert_eq!(state.used, 800);
        assert_eq!(state.reset_time, reset);
    }

    #[test]
    fn test_corrupt_state_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rate_limiter.json");
        std::fs::write(&path, "{not json at all").unwrap();

        let limiter = RateLimiter::open(&path);
        assert!(limiter.state_for("github").is_none());
    }

    proptest! {
        /// used + remaining = limit holds after any update and tracking.
        #[test]
        fn prop_rate_limit_bounds(limit in 1u64..10_000, remaining in 0u64..20_000, spends in proptest::collection::vec(1u64..100, 0..20)) {
            let dir = TempDir::new().unwrap();
            let limiter = RateLimiter::open(dir.path().join("s.json"));
            limiter.update("api", limit, remaining, Utc::now()).unwrap();

            for spend in spends {
                limiter.track_request("api", spend).unwrap();
                let state = limiter.state_for("api").unwrap();
                prop_assert_eq!(state.used + state.remaining, state.limit);
                prop_assert!(state.used <= state.limit);
            }
        }
    }
}
