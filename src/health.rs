//! Liveness and health tracking for the evaluation engine.
//!
//! Counters are lock-free so every firefighter task can record outcomes
//! without contending on a mutex. Health is reported healthy when the store
//! answered the last probe and a tick completed within the last N intervals.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NEVER: i64 = i64::MIN;

/// Process-wide engine health counters.
#[derive(Debug)]
pub struct HealthMonitor {
    /// Identifies this evaluator instance in logs and health reports
    instance_id: String,
    /// Number of ticks started
    ticks_started: AtomicU64,
    /// Number of ticks that ran to completion
    ticks_completed: AtomicU64,
    /// Firefighters skipped because their previous evaluation was still running
    firefighters_skipped: AtomicU64,
    /// Number of decision records written
    keys_evaluated: AtomicU64,
    /// Number of decisions at or above their limit
    keys_exceeded: AtomicU64,
    /// Number of failed firefighter evaluations
    errors: AtomicU64,
    /// Completion time of the last tick, in epoch milliseconds
    last_tick_completed_ms: AtomicI64,
    /// Result of the last store probe
    store_reachable: AtomicBool,
    /// Monitor start time
    started_at: DateTime<Utc>,
    /// Path for persisting counters
    persist_path: Option<PathBuf>,
}

impl HealthMonitor {
    /// Create a new monitor.
    pub fn new() -> Self {
        Self {
            instance_id: instance_id(),
            ticks_started: AtomicU64::new(0),
            ticks_completed: AtomicU64::new(0),
            firefighters_skipped: AtomicU64::new(0),
            keys_evaluated: AtomicU64::new(0),
            keys_exceeded: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_tick_completed_ms: AtomicI64::new(NEVER),
            store_reachable: AtomicBool::new(true),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a monitor whose counters survive restarts.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut monitor = Self::new();
        monitor.persist_path = Some(path);

        if let Err(e) = monitor.load() {
            tracing::warn!(error = %e, "could not load previous health counters");
        }

        monitor
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn record_tick_started(&self) {
        self.ticks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick_completed(&self, at: DateTime<Utc>) {
        self.ticks_completed.fetch_add(1, Ordering::Relaxed);
        self.last_tick_completed_ms
            .fetch_max(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_firefighter_skipped(&self) {
        self.firefighters_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one written decision.
    pub fn record_decision(&self, exceeded: bool) {
        self.keys_evaluated.fetch_add(1, Ordering::Relaxed);
        if exceeded {
            self.keys_exceeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_store_reachable(&self, reachable: bool) {
        self.store_reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn last_tick_completed(&self) -> Option<DateTime<Utc>> {
        match self.last_tick_completed_ms.load(Ordering::Relaxed) {
            NEVER => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Get the current counters.
    pub fn stats(&self) -> HealthStats {
        HealthStats {
            ticks_started: self.ticks_started.load(Ordering::Relaxed),
            ticks_completed: self.ticks_completed.load(Ordering::Relaxed),
            firefighters_skipped: self.firefighters_skipped.load(Ordering::Relaxed),
            keys_evaluated: self.keys_evaluated.load(Ordering::Relaxed),
            keys_exceeded: self.keys_exceeded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Evaluate liveness at `now` for a scheduler running every `interval`.
    pub fn report(&self, now: DateTime<Utc>, interval: Duration, stale_ticks: u32) -> HealthReport {
        let last_tick_completed = self.last_tick_completed();
        let store_reachable = self.store_reachable.load(Ordering::Relaxed);

        let allowed = interval.saturating_mul(stale_ticks.max(1));
        let tick_recent = last_tick_completed.is_some_and(|last| {
            let age = (now - last).to_std().unwrap_or(Duration::ZERO);
            age <= allowed
        });

        HealthReport {
            instance_id: self.instance_id.clone(),
            healthy: store_reachable && tick_recent,
            store_reachable,
            tick_recent,
            last_tick_completed,
            checked_at: now,
            stats: self.stats(),
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let last = self
            .last_tick_completed()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        format!(
            "Engine Statistics ({}):\n\
             - Ticks started: {}\n\
             - Ticks completed: {}\n\
             - Firefighters skipped: {}\n\
             - Decisions written: {}\n\
             - Decisions exceeded: {}\n\
             - Failed evaluations: {}\n\
             - Last tick completed: {}\n\
             - Uptime: {} seconds",
            self.instance_id,
            stats.ticks_started,
            stats.ticks_completed,
            stats.firefighters_skipped,
            stats.keys_evaluated,
            stats.keys_exceeded,
            stats.errors,
            last,
            stats.uptime_secs
        )
    }

    /// Save counters to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedHealth {
                ticks_started: stats.ticks_started,
                ticks_completed: stats.ticks_completed,
                firefighters_skipped: stats.firefighters_skipped,
                keys_evaluated: stats.keys_evaluated,
                keys_exceeded: stats.keys_exceeded,
                errors: stats.errors,
                last_tick_completed: self.last_tick_completed(),
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedHealth =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.ticks_started
                    .store(persisted.ticks_started, Ordering::Relaxed);
                self.ticks_completed
                    .store(persisted.ticks_completed, Ordering::Relaxed);
                self.firefighters_skipped
                    .store(persisted.firefighters_skipped, Ordering::Relaxed);
                self.keys_evaluated
                    .store(persisted.keys_evaluated, Ordering::Relaxed);
                self.keys_exceeded
                    .store(persisted.keys_exceeded, Ordering::Relaxed);
                self.errors.store(persisted.errors, Ordering::Relaxed);
                if let Some(last) = persisted.last_tick_completed {
                    self.last_tick_completed_ms
                        .store(last.timestamp_millis(), Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStats {
    pub ticks_started: u64,
    pub ticks_completed: u64,
    pub firefighters_skipped: u64,
    pub keys_evaluated: u64,
    pub keys_exceeded: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Liveness signal for operational health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub instance_id: String,
    pub healthy: bool,
    pub store_reachable: bool,
    /// A tick completed within the allowed number of intervals
    pub tick_recent: bool,
    pub last_tick_completed: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
    pub stats: HealthStats,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedHealth {
    ticks_started: u64,
    ticks_completed: u64,
    #[serde(default)]
    firefighters_skipped: u64,
    keys_evaluated: u64,
    keys_exceeded: u64,
    errors: u64,
    last_tick_completed: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared health monitor.
pub type SharedHealth = Arc<HealthMonitor>;
