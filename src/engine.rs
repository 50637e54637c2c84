//! Tick execution: fetch, aggregate, evaluate and persist for every active
//! firefighter.
//!
//! Each firefighter is evaluated in its own task. Tasks share nothing but the
//! read-only limit snapshot taken at the start of the tick and the store
//! handle. A firefighter whose previous evaluation is still running is skipped
//! for this tick rather than evaluated twice at once.

use crate::config::Config;
use crate::core::decision::{evaluate, DecisionKey, DecisionRecord, DecisionStatus, ExposureState};
use crate::core::limits::{LimitRegistry, LimitTable};
use crate::core::status::FirefighterStatus;
use crate::core::types::{Firefighter, FirefighterId};
use crate::core::windowing::aggregate;
use crate::error::EngineError;
use crate::health::{HealthReport, SharedHealth};
use crate::store::{PutOutcome, SharedStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Outcome of one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSummary {
    /// Evaluation instant every window ended at
    pub tick: DateTime<Utc>,
    pub limits_version: String,
    pub limits_generation: u64,
    /// Active firefighters found for this tick
    pub firefighters: usize,
    /// Decisions in force for this tick (UNKNOWN included). On a rerun these
    /// are the records already stored, not recomputed ones.
    pub evaluated_count: usize,
    /// Records written as UNKNOWN for lack of data
    pub unknown_count: usize,
    /// Firefighters whose evaluation failed
    pub error_count: usize,
    /// Firefighters left out because their previous evaluation was still running
    pub skipped_firefighters: Vec<FirefighterId>,
    pub exceeded_keys: Vec<DecisionKey>,
    pub failures: Vec<FirefighterFailure>,
    pub duration_ms: u64,
}

impl TickSummary {
    fn empty(tick: DateTime<Utc>, limits: &LimitTable) -> Self {
        Self {
            tick,
            limits_version: limits.version().to_string(),
            limits_generation: limits.generation(),
            firefighters: 0,
            evaluated_count: 0,
            unknown_count: 0,
            error_count: 0,
            skipped_firefighters: Vec::new(),
            exceeded_keys: Vec::new(),
            failures: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// A firefighter whose evaluation did not finish this tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirefighterFailure {
    /// Empty when the active firefighters could not be listed at all
    pub firefighter_id: FirefighterId,
    pub error: String,
    /// Retried on the next tick without operator action
    pub transient: bool,
}

impl FirefighterFailure {
    fn new(firefighter_id: impl Into<FirefighterId>, error: &EngineError) -> Self {
        Self {
            firefighter_id: firefighter_id.into(),
            error: error.to_string(),
            transient: error.is_transient(),
        }
    }
}

/// Decisions written by one firefighter task so far.
#[derive(Debug, Default)]
struct Progress {
    evaluated: usize,
    unknown: usize,
    exceeded: Vec<DecisionKey>,
}

impl Progress {
    fn record(&mut self, record: &DecisionRecord) {
        self.evaluated += 1;
        match record.status {
            DecisionStatus::Unknown => self.unknown += 1,
            DecisionStatus::Exceeded => self.exceeded.push(record.key()),
            DecisionStatus::Ok | DecisionStatus::Recovered => {}
        }
    }
}

type SharedProgress = Arc<Mutex<Progress>>;
type InFlight = Arc<Mutex<HashSet<FirefighterId>>>;

/// Marks a firefighter as being evaluated until dropped.
struct InFlightGuard {
    in_flight: InFlight,
    firefighter_id: FirefighterId,
}

impl InFlightGuard {
    fn acquire(in_flight: &InFlight, firefighter_id: &str) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(firefighter_id.to_string()) {
            return None;
        }
        Some(Self {
            in_flight: Arc::clone(in_flight),
            firefighter_id: firefighter_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.firefighter_id);
    }
}

/// The exposure evaluation engine.
pub struct Engine {
    store: SharedStore,
    limits: Arc<LimitRegistry>,
    config: Arc<Config>,
    health: SharedHealth,
    in_flight: InFlight,
}

impl Engine {
    pub fn new(
        store: SharedStore,
        limits: Arc<LimitRegistry>,
        config: Config,
        health: SharedHealth,
    ) -> Self {
        Self {
            store,
            limits,
            config: Arc::new(config),
            health,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn health_monitor(&self) -> &SharedHealth {
        &self.health
    }

    pub fn limits(&self) -> &Arc<LimitRegistry> {
        &self.limits
    }

    /// The limit table currently in force.
    pub fn limits_snapshot(&self) -> Arc<LimitTable> {
        self.limits.snapshot()
    }

    /// Run one tick for the instant derived from `now`.
    ///
    /// Never fails as a whole: per-firefighter errors are logged, counted and
    /// reported in the summary.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickSummary {
        let started = Instant::now();
        let tick = self.config.evaluation_instant(now);
        let limits = self.limits.snapshot();
        let mut summary = TickSummary::empty(tick, &limits);
        self.health.record_tick_started();

        let since = tick - limits.longest_window();
        let firefighters = match self.store.active_firefighters(since, tick).await {
            Ok(firefighters) => {
                self.health.set_store_reachable(true);
                firefighters
            }
            Err(e) => {
                let error = EngineError::from(e);
                tracing::warn!(tick = %tick, error = %error, "Could not list active firefighters");
                self.health.set_store_reachable(false);
                self.health.record_error();
                summary.error_count = 1;
                summary.failures.push(FirefighterFailure::new("", &error));
                summary.duration_ms = elapsed_ms(started);
                return summary;
            }
        };
        summary.firefighters = firefighters.len();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let budget = self.config.firefighter_budget;
        let mut tasks = JoinSet::new();
        let mut pending: Vec<(FirefighterId, SharedProgress)> = Vec::new();

        for firefighter in firefighters {
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, &firefighter.id) else {
                tracing::warn!(
                    firefighter = %firefighter.id,
                    tick = %tick,
                    "Previous evaluation still running, skipping"
                );
                self.health.record_firefighter_skipped();
                summary.skipped_firefighters.push(firefighter.id);
                continue;
            };

            let progress = SharedProgress::default();
            pending.push((firefighter.id.clone(), Arc::clone(&progress)));

            let store = Arc::clone(&self.store);
            let limits = Arc::clone(&limits);
            let health = Arc::clone(&self.health);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _guard = guard;
                let _permit = semaphore.acquire_owned().await;
                let id = firefighter.id.clone();
                let work = evaluate_firefighter(store, limits, health, firefighter, tick, progress);
                let result = match tokio::time::timeout(budget, work).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::BudgetExceeded(budget)),
                };
                (id, result)
            });
        }

        let mut finished: HashSet<FirefighterId> = HashSet::new();
        let mut panics: Vec<String> = Vec::new();
        let mut completed = 0usize;
        let mut store_failures = 0usize;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => {
                    completed += 1;
                    finished.insert(id);
                }
                Ok((id, Err(error))) => {
                    if matches!(error, EngineError::Store(_)) {
                        store_failures += 1;
                    }
                    tracing::warn!(
                        firefighter = %id,
                        tick = %tick,
                        error = %error,
                        transient = error.is_transient(),
                        "Evaluation failed, will retry next tick"
                    );
                    self.health.record_error();
                    summary.failures.push(FirefighterFailure::new(id.clone(), &error));
                    finished.insert(id);
                }
                Err(join_error) => {
                    tracing::error!(tick = %tick, error = %join_error, "Evaluation task panicked");
                    panics.push(join_error.to_string());
                }
            }
        }

        // A task that panicked never returned its id; it is whichever one is missing.
        if !panics.is_empty() {
            let detail = panics.join("; ");
            for (id, _) in pending.iter().filter(|(id, _)| !finished.contains(id)) {
                self.health.record_error();
                let error = EngineError::TaskPanicked(detail.clone());
                summary.failures.push(FirefighterFailure::new(id.clone(), &error));
            }
        }

        // Every evaluation failed on the store: treat it as unreachable.
        if completed == 0 && store_failures > 0 {
            self.health.set_store_reachable(false);
        }

        for (_, progress) in &pending {
            let mut progress = progress.lock().unwrap_or_else(PoisonError::into_inner);
            summary.evaluated_count += progress.evaluated;
            summary.unknown_count += progress.unknown;
            summary.exceeded_keys.append(&mut progress.exceeded);
        }
        summary.exceeded_keys.sort();
        summary.failures.sort_by(|a, b| a.firefighter_id.cmp(&b.firefighter_id));
        summary.error_count = summary.failures.len();
        summary.duration_ms = elapsed_ms(started);

        self.health.record_tick_completed(Utc::now());
        tracing::info!(
            tick = %tick,
            limits_version = %summary.limits_version,
            firefighters = summary.firefighters,
            evaluated = summary.evaluated_count,
            unknown = summary.unknown_count,
            exceeded = summary.exceeded_keys.len(),
            errors = summary.error_count,
            skipped = summary.skipped_firefighters.len(),
            duration_ms = summary.duration_ms,
            "Tick completed"
        );

        summary
    }

    /// Latest decision of every key recorded for a firefighter.
    pub async fn firefighter_status(
        &self,
        firefighter_id: &str,
    ) -> Result<FirefighterStatus, EngineError> {
        let limits = self.limits.snapshot();
        let mut decisions = Vec::new();
        for gas in limits.gases() {
            for window in limits.windows_for_gas(gas) {
                if let Some(record) = self
                    .store
                    .latest_decision(firefighter_id, gas, &window.name, None)
                    .await?
                {
                    decisions.push(record);
                }
            }
        }
        Ok(FirefighterStatus::from_decisions(
            firefighter_id,
            decisions,
            self.config.yellow_warning_percent,
        ))
    }

    /// Every decision written for a firefighter at `tick`.
    pub async fn decisions_at(
        &self,
        firefighter_id: &str,
        tick: DateTime<Utc>,
    ) -> Result<Vec<DecisionRecord>, EngineError> {
        Ok(self.store.decisions_at(firefighter_id, tick).await?)
    }

    /// Probe the store and report liveness.
    pub async fn health(&self, now: DateTime<Utc>) -> HealthReport {
        match self.store.ping().await {
            Ok(()) => self.health.set_store_reachable(true),
            Err(e) => {
                tracing::warn!(error = %e, "Store health probe failed");
                self.health.set_store_reachable(false);
            }
        }
        self.health.report(
            now,
            self.config.tick_interval,
            self.config.health_stale_ticks,
        )
    }
}

async fn evaluate_firefighter(
    store: SharedStore,
    limits: Arc<LimitTable>,
    health: SharedHealth,
    firefighter: Firefighter,
    tick: DateTime<Utc>,
    progress: SharedProgress,
) -> Result<(), EngineError> {
    let Firefighter { id, region } = firefighter;
    if !limits.has_region(&region) {
        return Err(EngineError::Evaluation(format!(
            "no limits configured for region {region}"
        )));
    }

    let since = tick - limits.longest_window();
    for gas in limits.gases() {
        let keys: Vec<_> = limits
            .windows_for_gas(gas)
            .filter_map(|window| limits.lookup(gas, &region, &window.name).map(|l| (window, l)))
            .collect();
        if keys.is_empty() {
            continue;
        }

        let readings = store.get_readings(&id, gas, since, tick).await?;

        for (window, limit) in keys {
            let statistic =
                aggregate(&id, gas, &readings, window, tick).rounded(limits.rounding_for(gas));
            let prior = store
                .latest_decision(&id, gas, &window.name, Some(tick))
                .await?;
            let record = evaluate(&statistic, limit, prior.as_ref());

            // On a rerun the stored record stands; count that one, not the recomputation.
            let in_force = match store.put_decision(&record).await? {
                PutOutcome::Inserted => {
                    log_decision(prior.as_ref(), &record);
                    health.record_decision(record.is_exceeded());
                    record
                }
                PutOutcome::AlreadyRecorded => {
                    let stored = store.get_decision(&record.key()).await?;
                    tracing::debug!(
                        firefighter = %id,
                        gas = %gas,
                        window = %window.name,
                        tick = %tick,
                        recomputed = %record.status,
                        stored = ?stored.as_ref().map(|d| d.status),
                        "Decision already recorded for this tick"
                    );
                    stored.unwrap_or(record)
                }
            };

            progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(&in_force);
        }
    }
    Ok(())
}

fn log_decision(prior: Option<&DecisionRecord>, record: &DecisionRecord) {
    let prior_state = prior.map(|p| p.state).unwrap_or_default();
    match record.status {
        DecisionStatus::Exceeded if prior_state == ExposureState::Ok => tracing::info!(
            firefighter = %record.firefighter_id,
            gas = %record.gas,
            window = %record.window,
            value = ?record.value,
            limit = record.limit,
            range_exceeded = record.range_exceeded,
            "Exposure limit exceeded"
        ),
        DecisionStatus::Recovered => tracing::info!(
            firefighter = %record.firefighter_id,
            gas = %record.gas,
            window = %record.window,
            value = ?record.value,
            limit = record.limit,
            "Exposure recovered below limit"
        ),
        status => tracing::debug!(
            firefighter = %record.firefighter_id,
            gas = %record.gas,
            window = %record.window,
            value = ?record.value,
            status = %status,
            "Decision recorded"
        ),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
