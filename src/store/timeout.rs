//! Per-operation timeout around any reading store.

use crate::core::decision::{DecisionKey, DecisionRecord};
use crate::core::types::{Firefighter, Reading};
use crate::error::StoreError;
use crate::store::{PutOutcome, ReadingStore, SharedStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Wraps a store so every call fails with [`StoreError::Timeout`] once it
/// takes longer than `timeout`.
pub struct TimeoutStore {
    inner: SharedStore,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: SharedStore, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl ReadingStore for TimeoutStore {
    async fn active_firefighters(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Firefighter>, StoreError> {
        self.bounded(self.inner.active_firefighters(since, until)).await
    }

    async fn get_readings(
        &self,
        firefighter_id: &str,
        gas: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        self.bounded(self.inner.get_readings(firefighter_id, gas, since, until))
            .await
    }

    async fn put_decision(&self, record: &DecisionRecord) -> Result<PutOutcome, StoreError> {
        self.bounded(self.inner.put_decision(record)).await
    }

    async fn latest_decision(
        &self,
        firefighter_id: &str,
        gas: &str,
        window: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<DecisionRecord>, StoreError> {
        self.bounded(self.inner.latest_decision(firefighter_id, gas, window, before))
            .await
    }

    async fn get_decision(&self, key: &DecisionKey) -> Result<Option<DecisionRecord>, StoreError> {
        self.bounded(self.inner.get_decision(key)).await
    }

    async fn decisions_at(
        &self,
        firefighter_id: &str,
        tick: DateTime<Utc>,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        self.bounded(self.inner.decisions_at(firefighter_id, tick)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded(self.inner.ping()).await
    }
}
