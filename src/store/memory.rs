//! In-process reading store with JSON snapshot persistence.

use crate::core::decision::{DecisionKey, DecisionRecord};
use crate::core::types::{Firefighter, FirefighterId, GasId, Reading, RegionId};
use crate::error::StoreError;
use crate::store::{PutOutcome, ReadingStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::path::Path;
use tokio::sync::RwLock;

/// Persisted form of a [`MemoryStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Region assignment per firefighter
    #[serde(default)]
    pub firefighters: Vec<Firefighter>,
    #[serde(default)]
    pub readings: Vec<Reading>,
    #[serde(default)]
    pub decisions: Vec<DecisionRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    regions: HashMap<FirefighterId, RegionId>,
    readings: HashMap<(FirefighterId, GasId), Vec<Reading>>,
    decisions: BTreeMap<DecisionKey, DecisionRecord>,
}

/// Reading store backed by process memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// Region for firefighters with no explicit assignment
    default_region: RegionId,
}

impl MemoryStore {
    pub fn new(default_region: impl Into<RegionId>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            default_region: default_region.into(),
        }
    }

    /// Build a store from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot, default_region: impl Into<RegionId>) -> Self {
        Self {
            inner: RwLock::new(Inner::from_snapshot(snapshot)),
            default_region: default_region.into(),
        }
    }

    /// Load a snapshot file. A missing file yields an empty store.
    pub fn load(path: &Path, default_region: impl Into<RegionId>) -> Result<Self, StoreError> {
        Ok(match read_snapshot(path)? {
            Some(snapshot) => Self::from_snapshot(snapshot, default_region),
            None => Self::new(default_region),
        })
    }

    /// Exchange state with the snapshot file shared with the ingest side.
    ///
    /// Readings and region assignments are taken from the file as it is now;
    /// decisions are merged append-only, keeping the first record of every
    /// key. The merged state is then written back.
    pub async fn sync(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(snapshot) = read_snapshot(path)? {
            let on_disk = Inner::from_snapshot(snapshot);
            let mut inner = self.inner.write().await;
            let before = inner.readings.values().map(Vec::len).sum::<usize>();
            inner.regions = on_disk.regions;
            inner.readings = on_disk.readings;
            for (key, decision) in on_disk.decisions {
                inner.decisions.entry(key).or_insert(decision);
            }
            tracing::debug!(
                readings_before = before,
                readings_after = inner.readings.values().map(Vec::len).sum::<usize>(),
                decisions = inner.decisions.len(),
                "Store synced with snapshot file"
            );
        }
        self.save(path).await
    }

    /// Current contents as a snapshot.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read().await;
        let mut firefighters: Vec<Firefighter> = inner
            .regions
            .iter()
            .map(|(id, region)| Firefighter::new(id.clone(), region.clone()))
            .collect();
        firefighters.sort_by(|a, b| a.id.cmp(&b.id));

        let mut readings: Vec<Reading> = inner.readings.values().flatten().cloned().collect();
        readings.sort_by(|a, b| {
            (&a.firefighter_id, &a.gas, a.timestamp).cmp(&(&b.firefighter_id, &b.gas, b.timestamp))
        });

        StoreSnapshot {
            firefighters,
            readings,
            decisions: inner.decisions.values().cloned().collect(),
        }
    }

    /// Save the current contents to a snapshot file.
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot = self.snapshot().await;
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))
    }

    /// Assign a firefighter to a region.
    pub async fn register_firefighter(&self, id: impl Into<FirefighterId>, region: impl Into<RegionId>) {
        self.inner.write().await.regions.insert(id.into(), region.into());
    }

    /// Record one reading (the upstream ingest path).
    pub async fn insert_reading(&self, reading: Reading) {
        self.insert_readings([reading]).await;
    }

    pub async fn insert_readings<I>(&self, readings: I)
    where
        I: IntoIterator<Item = Reading>,
    {
        let mut inner = self.inner.write().await;
        for reading in readings {
            inner
                .readings
                .entry((reading.firefighter_id.clone(), reading.gas.clone()))
                .or_default()
                .push(reading);
        }
    }

    /// Every decision, ordered by firefighter, gas, window and tick.
    pub async fn all_decisions(&self) -> Vec<DecisionRecord> {
        self.inner.read().await.decisions.values().cloned().collect()
    }

    pub async fn decision_count(&self) -> usize {
        self.inner.read().await.decisions.len()
    }

    /// Regions explicitly assigned to at least one firefighter.
    pub async fn regions(&self) -> BTreeSet<RegionId> {
        self.inner.read().await.regions.values().cloned().collect()
    }

    fn region_for(&self, inner: &Inner, id: &str) -> RegionId {
        inner
            .regions
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.default_region.clone())
    }
}

impl Inner {
    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut inner = Inner::default();
        for firefighter in snapshot.firefighters {
            inner.regions.insert(firefighter.id, firefighter.region);
        }
        for reading in snapshot.readings {
            inner
                .readings
                .entry((reading.firefighter_id.clone(), reading.gas.clone()))
                .or_default()
                .push(reading);
        }
        for decision in snapshot.decisions {
            inner.decisions.entry(decision.key()).or_insert(decision);
        }
        inner
    }
}

fn read_snapshot(path: &Path) -> Result<Option<StoreSnapshot>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))
}

fn key_prefix(firefighter_id: &str, gas: &str, window: &str, tick: DateTime<Utc>) -> DecisionKey {
    DecisionKey {
        firefighter_id: firefighter_id.to_string(),
        gas: gas.to_string(),
        window: window.to_string(),
        tick,
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn active_firefighters(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Firefighter>, StoreError> {
        let inner = self.inner.read().await;
        // BTreeSet dedupes across gases and keeps the result ordered by id.
        let active: Vec<Firefighter> = inner
            .readings
            .iter()
            .filter(|(_, readings)| {
                readings
                    .iter()
                    .any(|r| r.timestamp >= since && r.timestamp <= until)
            })
            .map(|((id, _), _)| id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|id| {
                let region = self.region_for(&inner, &id);
                Firefighter::new(id, region)
            })
            .collect();
        Ok(active)
    }

    async fn get_readings(
        &self,
        firefighter_id: &str,
        gas: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        let inner = self.inner.read().await;
        let readings: Vec<Reading> = inner
            .readings
            .get(&(firefighter_id.to_string(), gas.to_string()))
            .map(|readings| {
                readings
                    .iter()
                    .filter(|r| r.timestamp >= since && r.timestamp <= until)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(readings)
    }

    async fn put_decision(&self, record: &DecisionRecord) -> Result<PutOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        let key = record.key();
        if inner.decisions.contains_key(&key) {
            return Ok(PutOutcome::AlreadyRecorded);
        }
        inner.decisions.insert(key, record.clone());
        Ok(PutOutcome::Inserted)
    }

    async fn latest_decision(
        &self,
        firefighter_id: &str,
        gas: &str,
        window: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<DecisionRecord>, StoreError> {
        let inner = self.inner.read().await;
        let lower = key_prefix(firefighter_id, gas, window, DateTime::<Utc>::MIN_UTC);
        let upper = match before {
            Some(tick) => Bound::Excluded(key_prefix(firefighter_id, gas, window, tick)),
            None => Bound::Included(key_prefix(firefighter_id, gas, window, DateTime::<Utc>::MAX_UTC)),
        };
        Ok(inner
            .decisions
            .range((Bound::Included(lower), upper))
            .next_back()
            .map(|(_, record)| record.clone()))
    }

    async fn get_decision(&self, key: &DecisionKey) -> Result<Option<DecisionRecord>, StoreError> {
        Ok(self.inner.read().await.decisions.get(key).cloned())
    }

    async fn decisions_at(
        &self,
        firefighter_id: &str,
        tick: DateTime<Utc>,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .decisions
            .values()
            .filter(|d| d.firefighter_id == firefighter_id && d.tick == tick)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::{DecisionStatus, ExposureState};
    use crate::core::windowing::WindowKind;
    use chrono::{Duration, TimeZone};

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn decision(window: &str, tick: DateTime<Utc>, status: DecisionStatus) -> DecisionRecord {
        DecisionRecord {
            firefighter_id: "F1".into(),
            gas: "carbon_monoxide".into(),
            region: "EU".into(),
            window: window.into(),
            window_kind: WindowKind::Twa,
            tick,
            value: Some(1.0),
            limit: 25.0,
            limits_version: "test".into(),
            gauge_percent: Some(4.0),
            status,
            state: ExposureState::Ok,
            range_exceeded: false,
            sample_count: 1,
        }
    }

    #[tokio::test]
    async fn test_active_firefighters_use_registered_region() {
        let store = MemoryStore::new("EU");
        store.register_firefighter("F2", "US").await;
        store
            .insert_readings([
                Reading::new("F1", "carbon_monoxide", 1.0, t(0)),
                Reading::new("F2", "carbon_monoxide", 1.0, t(5)),
                Reading::new("F3", "carbon_monoxide", 1.0, t(-100)),
            ])
            .await;

        let active = store.active_firefighters(t(-10), t(10)).await.unwrap();
        assert_eq!(
            active,
            vec![Firefighter::new("F1", "EU"), Firefighter::new("F2", "US")]
        );
    }

    #[tokio::test]
    async fn test_get_readings_filters_range() {
        let store = MemoryStore::new("EU");
        store
            .insert_readings([
                Reading::new("F1", "carbon_monoxide", 1.0, t(0)),
                Reading::new("F1", "carbon_monoxide", 2.0, t(10)),
                Reading::new("F1", "nitrogen_dioxide", 3.0, t(5)),
            ])
            .await;

        let readings = store
            .get_readings("F1", "carbon_monoxide", t(0), t(5))
            .await
            .unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].concentration, 1.0);
    }

    #[tokio::test]
    async fn test_put_decision_is_append_only() {
        let store = MemoryStore::new("EU");
        let first = decision("TWA-8h", t(0), DecisionStatus::Ok);
        let mut conflicting = first.clone();
        conflicting.status = DecisionStatus::Exceeded;

        assert_eq!(store.put_decision(&first).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(
            store.put_decision(&conflicting).await.unwrap(),
            PutOutcome::AlreadyRecorded
        );
        assert_eq!(store.decision_count().await, 1);
        assert_eq!(store.all_decisions().await[0].status, DecisionStatus::Ok);
    }

    #[tokio::test]
    async fn test_latest_decision_strictly_before() {
        let store = MemoryStore::new("EU");
        for minute in [0, 1, 2] {
            store
                .put_decision(&decision("TWA-8h", t(minute), DecisionStatus::Ok))
                .await
                .unwrap();
        }
        store
            .put_decision(&decision("STEL-15m", t(5), DecisionStatus::Ok))
            .await
            .unwrap();

        let prior = store
            .latest_decision("F1", "carbon_monoxide", "TWA-8h", Some(t(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prior.tick, t(1));

        let latest = store
            .latest_decision("F1", "carbon_monoxide", "TWA-8h", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.tick, t(2));

        assert!(store
            .latest_decision("F1", "carbon_monoxide", "TWA-8h", Some(t(0)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_file() {
        let path = std::env::temp_dir().join(format!("exposure-store-{}.json", uuid::Uuid::new_v4()));
        let store = MemoryStore::new("EU");
        store.register_firefighter("F1", "EU").await;
        store
            .insert_reading(Reading::new("F1", "carbon_monoxide", 4.0, t(0)))
            .await;
        store
            .put_decision(&decision("TWA-8h", t(0), DecisionStatus::Ok))
            .await
            .unwrap();
        store.save(&path).await.unwrap();

        let loaded = MemoryStore::load(&path, "EU").unwrap();
        let snapshot = loaded.snapshot().await;
        assert_eq!(snapshot.firefighters.len(), 1);
        assert_eq!(snapshot.readings.len(), 1);
        assert_eq!(snapshot.decisions.len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_sync_picks_up_new_readings_and_keeps_decisions() {
        let path = std::env::temp_dir().join(format!("exposure-store-{}.json", uuid::Uuid::new_v4()));
        let store = MemoryStore::new("EU");
        store
            .insert_reading(Reading::new("F1", "carbon_monoxide", 4.0, t(0)))
            .await;
        store
            .put_decision(&decision("TWA-8h", t(0), DecisionStatus::Ok))
            .await
            .unwrap();
        store.save(&path).await.unwrap();

        // The ingest side appends to the file while the evaluator runs.
        let ingest = MemoryStore::load(&path, "EU").unwrap();
        ingest
            .insert_reading(Reading::new("F1", "carbon_monoxide", 6.0, t(1)))
            .await;
        ingest.register_firefighter("F2", "US").await;
        ingest.save(&path).await.unwrap();

        store
            .put_decision(&decision("TWA-8h", t(1), DecisionStatus::Ok))
            .await
            .unwrap();
        store.sync(&path).await.unwrap();

        let readings = store
            .get_readings("F1", "carbon_monoxide", t(0), t(1))
            .await
            .unwrap();
        assert_eq!(readings.len(), 2);
        assert!(store.regions().await.contains("US"));
        assert_eq!(store.decision_count().await, 2);

        // Nothing written upstream or by the evaluator is lost on disk.
        let on_disk = MemoryStore::load(&path, "EU").unwrap().snapshot().await;
        assert_eq!(on_disk.readings.len(), 2);
        assert_eq!(on_disk.decisions.len(), 2);
        assert_eq!(on_disk.firefighters.len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_get_decision_by_key() {
        let store = MemoryStore::new("EU");
        let record = decision("TWA-8h", t(0), DecisionStatus::Ok);
        store.put_decision(&record).await.unwrap();

        assert_eq!(store.get_decision(&record.key()).await.unwrap(), Some(record.clone()));
        let mut other = record.key();
        other.tick = t(1);
        assert!(store.get_decision(&other).await.unwrap().is_none());
    }

    #[test]
    fn test_missing_snapshot_file_is_empty_store() {
        let path = std::env::temp_dir().join("exposure-store-does-not-exist.json");
        assert!(MemoryStore::load(&path, "EU").is_ok());
    }
}
