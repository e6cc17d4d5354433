//! Recovery state machine for one locality.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Session recycles for one locality before it is skipped.
    pub stale_cache_retry_cap: u32,
    /// Page replacements for one locality before it is skipped.
    pub dead_session_retry_cap: u32,
    /// Filter application attempts on one page before it is discarded.
    pub filter_attempts: u32,
    pub filter_cooldown_ms: u64,
    /// Abandon a locality when nothing was persisted for this long.
    pub locality_timeout_secs: u64,
    /// Share of region-parsed records that must mismatch to call the view stale.
    pub stale_share_threshold: f64,
    /// How long a fresh page gets to answer a liveness probe.
    pub probe_timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_cache_retry_cap: 2,
            dead_session_retry_cap: 2,
            filter_attempts: 2,
            filter_cooldown_ms: 5000,
            locality_timeout_secs: 600,
            stale_share_threshold: 0.5,
            probe_timeout_ms: 5000,
        }
    }
}

/// What the harvest callback tells the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestSignal {
    Continue,
    StaleCacheRetry,
    DeadSession,
    SkipLocality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Close, relaunch and re-authenticate the whole browser session.
    RecycleSession,
    /// Provision a replacement page and re-authenticate.
    ReplacePage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Requested,
    StaleCacheExhausted,
    DeadSessionExhausted,
    InactivityTimeout,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Requested => "skipped",
            SkipReason::StaleCacheExhausted => "stale cache retries exhausted",
            SkipReason::DeadSessionExhausted => "dead session retries exhausted",
            SkipReason::InactivityTimeout => "inactivity timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalityStep {
    Done,
    Retry(RecoveryAction),
    Skip(SkipReason),
}

/// Retry counters for the locality in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalityAttempts {
    pub stale_cache: u32,
    pub dead_session: u32,
}

impl LocalityAttempts {
    pub fn next(&mut self, signal: HarvestSignal, config: &RecoveryConfig) -> LocalityStep {
        match signal {
            HarvestSignal::Continue => LocalityStep::Done,
            HarvestSignal::SkipLocality => LocalityStep::Skip(SkipReason::Requested),
            HarvestSignal::StaleCacheRetry => {
                if self.stale_cache >= config.stale_cache_retry_cap {
                    return LocalityStep::Skip(SkipReason::StaleCacheExhausted);
                }
                self.stale_cache += 1;
                LocalityStep::Retry(RecoveryAction::RecycleSession)
            }
            HarvestSignal::DeadSession => {
                if self.dead_session >= config.dead_session_retry_cap {
                    return LocalityStep::Skip(SkipReason::DeadSessionExhausted);
                }
                self.dead_session += 1;
                LocalityStep::Retry(RecoveryAction::ReplacePage)
            }
        }
    }
}

/// At least one mismatch, and mismatches make up at least `threshold` of region-parsed records.
pub fn stale_cache_detected(mismatched: usize, region_parsed: usize, threshold: f64) -> bool {
    if mismatched == 0 || region_parsed == 0 {
        return false;
    }
    mismatched as f64 / region_parsed as f64 >= threshold
}

#[derive(Debug)]
struct ClockState {
    last_progress: Instant,
    suspended: bool,
}

/// Inactivity timer for one locality. Suspended while recovery runs.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    timeout: Duration,
    state: Arc<Mutex<ClockState>>,
}

impl ActivityClock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::new(Mutex::new(ClockState {
                last_progress: Instant::now(),
                suspended: false,
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut ClockState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// A record was persisted.
    pub fn touch(&self) {
        self.with(|s| s.last_progress = Instant::now());
    }

    pub fn suspend(&self) {
        self.with(|s| s.suspended = true);
    }

    /// Ends a suspension and restarts the countdown.
    pub fn resume(&self) {
        self.with(|s| {
            s.suspended = false;
            s.last_progress = Instant::now();
        });
    }

    pub fn expired(&self) -> bool {
        self.with(|s| !s.suspended && s.last_progress.elapsed() >= self.timeout)
    }

    /// Resolves once the clock expires.
    pub async fn expiry(&self) {
        let tick = (self.timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));
        while !self.expired() {
            tokio::time::sleep(tick).await;
        }
    }
}
