//! Named-frequency scheduler with persisted state for the outer cycles.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How often a cycle should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleFrequency {
    /// Only when forced
    Manual,
    Daily,
    Weekly,
    Monthly,
}

impl CycleFrequency {
    fn interval(&self) -> Option<Duration> {
        match self {
            Self::Manual => None,
            Self::Daily => Some(Duration::days(1)),
            Self::Weekly => Some(Duration::weeks(1)),
            Self::Monthly => Some(Duration::days(30)),
        }
    }
}

impl std::str::FromStr for CycleFrequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "manual" => Self::Manual,
            "daily" => Self::Daily,
            "weekly" => Self::Weekly,
            "monthly" => Self::Monthly,
            other => return Err(format!("unknown frequency: {other}")),
        })
    }
}

/// Persisted scheduler state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleState {
    pub last_generation_time: Option<DateTime<Utc>>,
    pub generation_count: u64,
    pub last_failure: Option<String>,
    pub last_cycle_id: Option<String>,
}

/// Scheduler status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub frequency: CycleFrequency,
    pub last_generation_time: Option<DateTime<Utc>>,
    pub generation_count: u64,
    pub last_failure: Option<String>,
    pub last_cycle_id: Option<String>,
    pub due: bool,
}

/// Decides when a cycle is due and records outcomes durably.
pub struct CycleScheduler {
    frequency: CycleFrequency,
    state: Mutex<ScheduleState>,
    state_path: PathBuf,
}

impl CycleScheduler {
    /// Load persisted state (tolerating a missing or corrupt file).
    pub fn open(frequency: CycleFrequency, state_path: impl AsRef<Path>) -> Self {
        let state_path = state_path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&state_path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "corrupt scheduler state, starting fresh");
                    ScheduleState::default()
                }
            },
            Err(_) => ScheduleState::default(),
        };

        debug!(?frequency, path = %state_path.display(), "scheduler initialized");
        Self {
            frequency,
            state: Mutex::new(state),
            state_path,
        }
    }

    /// Whether a cycle should run now.
    pub fn should_generate(&self, force: bool) -> bool {
        if force {
            return true;
        }
        let Some(interval) = self.frequency.interval() else {
            return false;
        };
        let Ok(state) = self.state.lock() else {
            return false;
        };
        match state.last_generation_time {
            None => true,
            Some(last) => Utc::now() - last >= interval,
        }
    }

    /// Record a successful cycle.
    pub fn mark_complete(&self, cycle_id: &str, time: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        state.last_generation_time = Some(time);
        state.generation_count += 1;
        state.last_failure = None;
        state.last_cycle_id = Some(cycle_id.to_string());
        self.save(&state)?;
        info!(cycle_id, count = state.generation_count, "cycle marked complete");
        Ok(())
    }

    /// Record a failed cycle. The schedule is left untouched so the next
    /// tick retries.
    pub fn mark_failed(&self, reason: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.last_failure = Some(reason.to_string());
        self.save(&state)?;
        warn!(reason, "cycle marked failed");
        Ok(())
    }

    pub fn status(&self) -> Result<ScheduleStatus> {
        let snapshot = self.lock()?.clone();
        Ok(ScheduleStatus {
            frequency: self.frequency,
            last_generation_time: snapshot.last_generation_time,
            generation_count: snapshot.generation_count,
            last_failure: snapshot.last_failure,
            last_cycle_id: snapshot.last_cycle_id,
            due: self.should_generate(false),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ScheduleState>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("scheduler lock poisoned: {e}")))
    }

    fn save(&self, state: &ScheduleState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::storage(format!("creating scheduler dir: {e}")))?;
            }
        }
        let data = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.state_path, data)
            .map_err(|e| Error::storage(format!("writing scheduler state: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_manual_only_runs_forced() {
        let dir = TempDir::new().unwrap();
        let scheduler = CycleScheduler::open(CycleFrequency::Manual, dir.path().join("s.json"));
        assert!(!scheduler.should_generate(false));
        assert!(scheduler.should_generate(true));
    }

    #[test]
    fn test_first_run_is_due() {
        let dir = TempDir::new().unwrap();
        let scheduler = CycleScheduler::open(CycleFrequency::Weekly, dir.path().join("s.json"));
        assert!(scheduler.should_generate(false));
    }

    #[test]
    fn test_interval_gating() {
        let dir = TempDir::new().unwrap();
        let scheduler = CycleScheduler::open(CycleFrequency::Weekly, dir.path().join("s.json"));

        // Just ran: not due.
        scheduler.mark_complete("cycle-1", Utc::now()).unwrap();
        assert!(!scheduler.should_generate(false));

        // Ran eight days ago: due again.
        scheduler
            .mark_complete("cycle-2", Utc::now() - Duration::days(8))
            .unwrap();
        assert!(scheduler.should_generate(false));
    }

    #[test]
    fn test_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.json");

        {
            let scheduler = CycleScheduler::open(CycleFrequency::Daily, &path);
            scheduler.mark_complete("cycle-9", Utc::now()).unwrap();
            scheduler.mark_failed("provider down").unwrap();
        }

        let scheduler = CycleScheduler::open(CycleFrequency::Daily, &path);
        let status = scheduler.status().unwrap();
        assert_eq!(status.generation_count, 1);
        assert_eq!(status.last_cycle_id.as_deref(), Some("cycle-9"));
        assert_eq!(status.last_failure.as_deref(), Some("provider down"));
        assert!(!status.due);
    }

    #[test]
    fn test_failure_does_not_consume_schedule() {
        let dir = TempDir::new().unwrap();
        let scheduler = CycleScheduler::open(CycleFrequency::Daily, dir.path().join("s.json"));
        scheduler.mark_failed("boom").unwrap();
        // Never completed: still due.
        assert!(scheduler.should_generate(false));
    }

    #[test]
    fn test_frequency_parsing() {
        assert_eq!(
            "weekly".parse::<CycleFrequency>().unwrap(),
            CycleFrequency::Weekly
        );
        assert!("fortnightly".parse::<CycleFrequency>().is_err());
    }
}
