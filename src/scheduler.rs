//! Periodic tick driver.
//!
//! Fires on a fixed interval and spawns each tick so a slow tick never delays
//! the driver. Missed intervals are skipped, not queued. On cancellation the
//! driver stops firing, waits up to the shutdown grace period for running
//! ticks and abandons whatever is left at task boundaries.

use crate::engine::{Engine, TickSummary};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counts reported when the driver stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks_started: u64,
    pub ticks_finished: u64,
    /// Ticks still running when the grace period ran out
    pub ticks_abandoned: u64,
}

/// Drives [`Engine::run_tick`] once per interval.
pub struct Scheduler {
    engine: Arc<Engine>,
    interval: Duration,
    shutdown_grace: Duration,
    summaries: Option<mpsc::UnboundedSender<TickSummary>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let config = engine.config();
        let interval = config.tick_interval;
        let shutdown_grace = config.shutdown_grace;
        Self {
            engine,
            interval,
            shutdown_grace,
            summaries: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Forward every finished tick's summary to `tx`.
    pub fn with_summaries(mut self, tx: mpsc::UnboundedSender<TickSummary>) -> Self {
        self.summaries = Some(tx);
        self
    }

    /// Run until `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        let mut ticks: JoinSet<TickSummary> = JoinSet::new();
        let mut summaries = self.summaries.clone();

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            grace_secs = self.shutdown_grace.as_secs(),
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(running = ticks.len(), "Scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    let engine = Arc::clone(&self.engine);
                    stats.ticks_started += 1;
                    ticks.spawn(async move { engine.run_tick(Utc::now()).await });
                }
                Some(joined) = ticks.join_next(), if !ticks.is_empty() => {
                    finish(joined, &mut stats, &mut summaries);
                }
            }
        }

        let drain = async {
            while let Some(joined) = ticks.join_next().await {
                finish(joined, &mut stats, &mut summaries);
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            stats.ticks_abandoned = ticks.len() as u64;
            tracing::warn!(
                abandoned = stats.ticks_abandoned,
                "Shutdown grace period elapsed, abandoning running ticks"
            );
            ticks.shutdown().await;
        }

        tracing::info!(
            started = stats.ticks_started,
            finished = stats.ticks_finished,
            abandoned = stats.ticks_abandoned,
            "Scheduler stopped"
        );
        stats
    }
}

fn finish(
    joined: Result<TickSummary, tokio::task::JoinError>,
    stats: &mut SchedulerStats,
    summaries: &mut Option<mpsc::UnboundedSender<TickSummary>>,
) {
    match joined {
        Ok(summary) => {
            stats.ticks_finished += 1;
            let closed = summaries
                .as_ref()
                .is_some_and(|tx| tx.send(summary).is_err());
            if closed {
                tracing::debug!("Summary receiver closed, no longer forwarding tick summaries");
                *summaries = None;
            }
        }
        Err(e) => tracing::error!(error = %e, "Tick task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::limits::tests::table;
    use crate::core::limits::LimitRegistry;
    use crate::core::decision::DecisionRecord;
    use crate::core::types::{Firefighter, Reading};
    use crate::error::StoreError;
    use crate::health::HealthMonitor;
    use crate::store::{MemoryStore, PutOutcome, ReadingStore};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(
            Arc::new(MemoryStore::new("EU")),
            Arc::new(LimitRegistry::new(table())),
            Config {
                floor_to_minute: false,
                ..Config::default()
            },
            Arc::new(HealthMonitor::new()),
        ))
    }

    #[tokio::test]
    async fn test_runs_ticks_until_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(engine())
            .with_interval(Duration::from_millis(10))
            .with_summaries(tx);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        let handle = tokio::spawn(async move { scheduler.run(stopper).await });

        // The first tick fires immediately.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.error_count, 0);
        rx.recv().await.unwrap();

        cancel.cancel();
        let stats = handle.await.unwrap();
        assert!(stats.ticks_started >= 2);
        assert!(stats.ticks_finished >= 2);
        assert_eq!(stats.ticks_abandoned, 0);
    }

    #[tokio::test]
    async fn test_closed_summary_receiver_does_not_stop_ticks() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let scheduler = Scheduler::new(engine())
            .with_interval(Duration::from_millis(10))
            .with_summaries(tx);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        let handle = tokio::spawn(async move { scheduler.run(stopper).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let stats = handle.await.unwrap();
        assert!(stats.ticks_finished >= 2);
        assert_eq!(stats.ticks_abandoned, 0);
    }

    #[tokio::test]
    async fn test_stops_immediately_when_already_cancelled() {
        let scheduler = Scheduler::new(engine()).with_interval(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = scheduler.run(cancel).await;
        assert!(stats.ticks_started <= 1);
        assert_eq!(stats.ticks_abandoned, 0);
    }

    /// Holds every reading fetch while `stalled` is set.
    struct GatedStore {
        inner: MemoryStore,
        stalled: AtomicBool,
        entered: Notify,
    }

    #[async_trait]
    impl ReadingStore for GatedStore {
        async fn active_firefighters(
            &self,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> Result<Vec<Firefighter>, StoreError> {
            self.inner.active_firefighters(since, until).await
        }

        async fn get_readings(
            &self,
            firefighter_id: &str,
            gas: &str,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> Result<Vec<Reading>, StoreError> {
            if self.stalled.load(Ordering::SeqCst) {
                self.entered.notify_one();
                std::future::pending::<()>().await;
            }
            self.inner.get_readings(firefighter_id, gas, since, until).await
        }

        async fn put_decision(&self, record: &DecisionRecord) -> Result<PutOutcome, StoreError> {
            self.inner.put_decision(record).await
        }

        async fn latest_decision(
            &self,
            firefighter_id: &str,
            gas: &str,
            window: &str,
            before: Option<DateTime<Utc>>,
        ) -> Result<Option<DecisionRecord>, StoreError> {
            self.inner
                .latest_decision(firefighter_id, gas, window, before)
                .await
        }

        async fn decisions_at(
            &self,
            firefighter_id: &str,
            tick: DateTime<Utc>,
        ) -> Result<Vec<DecisionRecord>, StoreError> {
            self.inner.decisions_at(firefighter_id, tick).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_tick_outliving_grace_is_abandoned() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new("EU"),
            stalled: AtomicBool::new(true),
            entered: Notify::new(),
        });
        store
            .inner
            .insert_reading(Reading::new(
                "F1",
                "carbon_monoxide",
                30.0,
                Utc::now() - chrono::Duration::minutes(1),
            ))
            .await;
        let engine = Arc::new(Engine::new(
            Arc::clone(&store) as Arc<dyn ReadingStore>,
            Arc::new(LimitRegistry::new(table())),
            Config {
                floor_to_minute: false,
                ..Config::default()
            },
            Arc::new(HealthMonitor::new()),
        ));

        let scheduler = Scheduler::new(Arc::clone(&engine))
            .with_interval(Duration::from_secs(3600))
            .with_shutdown_grace(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = tokio::spawn(async move { scheduler.run(stopper).await });

        // Cancel while the first tick is stuck fetching readings.
        store.entered.notified().await;
        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.ticks_started, 1);
        assert_eq!(stats.ticks_finished, 0);
        assert_eq!(stats.ticks_abandoned, 1);
        assert_eq!(store.inner.decision_count().await, 0);

        // Aborted firefighter tasks release their in-flight mark once dropped.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.stalled.store(false, Ordering::SeqCst);
        let summary = engine.run_tick(Utc::now()).await;
        assert!(summary.skipped_firefighters.is_empty());
        assert_eq!(summary.evaluated_count, 2);
        assert_eq!(store.inner.decision_count().await, 2);
    }
}
