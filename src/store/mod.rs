//! Reading store adapter.
//!
//! The engine only talks to persisted readings and decisions through the
//! [`ReadingStore`] trait. [`MemoryStore`] keeps everything in process and can
//! be seeded from and saved to a JSON snapshot; [`TimeoutStore`] bounds every
//! call of another store.

pub mod memory;
pub mod timeout;

use crate::core::decision::{DecisionKey, DecisionRecord};
use crate::core::types::{Firefighter, Reading};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use memory::{MemoryStore, StoreSnapshot};
pub use timeout::TimeoutStore;

/// Result of an append-only decision write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// A record for the same key and tick already exists and was kept.
    AlreadyRecorded,
}

/// Read/write access to sensor readings and decision records.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Firefighters with at least one reading in `[since, until]`, with their region.
    async fn active_firefighters(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Firefighter>, StoreError>;

    /// Readings for one firefighter and gas with timestamps in `[since, until]`.
    /// Ordering is not guaranteed.
    async fn get_readings(
        &self,
        firefighter_id: &str,
        gas: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError>;

    /// Append a decision. Writing the same key and tick twice never creates a
    /// second record.
    async fn put_decision(&self, record: &DecisionRecord) -> Result<PutOutcome, StoreError>;

    /// Most recent decision for the key, strictly before `before` when given.
    async fn latest_decision(
        &self,
        firefighter_id: &str,
        gas: &str,
        window: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<DecisionRecord>, StoreError>;

    /// The decision stored for exactly this key and tick.
    async fn get_decision(&self, key: &DecisionKey) -> Result<Option<DecisionRecord>, StoreError> {
        Ok(self
            .decisions_at(&key.firefighter_id, key.tick)
            .await?
            .into_iter()
            .find(|d| d.gas == key.gas && d.window == key.window))
    }

    /// Every decision written for a firefighter at exactly `tick`.
    async fn decisions_at(
        &self,
        firefighter_id: &str,
        tick: DateTime<Utc>,
    ) -> Result<Vec<DecisionRecord>, StoreError>;

    /// Cheap connectivity check for health reporting.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Store shared between the scheduler and every firefighter task.
pub type SharedStore = Arc<dyn ReadingStore>;
