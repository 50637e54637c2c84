//! Threshold decisions for one (firefighter, gas, window) key per tick.
//!
//! The evaluator is a pure function of the exposure statistic, the limit and
//! the most recent earlier decision for the same key. The underlying state
//! machine has two states, OK and EXCEEDED; each record additionally carries a
//! status that marks the tick a key recovered and ticks that could not be
//! evaluated at all.

use crate::core::limits::Limit;
use crate::core::types::{FirefighterId, GasId, RegionId};
use crate::core::windowing::{Exposure, ExposureStatistic, WindowKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Underlying exposure state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExposureState {
    #[default]
    Ok,
    Exceeded,
}

/// Status written for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    /// Below the limit
    Ok,
    /// At or above the limit
    Exceeded,
    /// First tick back below the limit after being exceeded
    Recovered,
    /// No readings in the window; no comparison was made
    Unknown,
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DecisionStatus::Ok => "OK",
            DecisionStatus::Exceeded => "EXCEEDED",
            DecisionStatus::Recovered => "RECOVERED",
            DecisionStatus::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Unique key of a decision record. Ordered so that records for one
/// (firefighter, gas, window) sort by tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DecisionKey {
    pub firefighter_id: FirefighterId,
    pub gas: GasId,
    pub window: String,
    pub tick: DateTime<Utc>,
}

impl fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.firefighter_id,
            self.gas,
            self.window,
            self.tick.to_rfc3339()
        )
    }
}

/// Append-only decision for one key at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub firefighter_id: FirefighterId,
    pub gas: GasId,
    pub region: RegionId,
    pub window: String,
    pub window_kind: WindowKind,
    pub tick: DateTime<Utc>,
    /// Computed TWA or ceiling; absent when unknown or range exceeded
    pub value: Option<f64>,
    pub limit: f64,
    pub limits_version: String,
    /// `value / limit` as a whole percentage
    pub gauge_percent: Option<f64>,
    pub status: DecisionStatus,
    pub state: ExposureState,
    /// The device reported a value outside its sensor range in this window
    #[serde(default)]
    pub range_exceeded: bool,
    pub sample_count: usize,
}

impl DecisionRecord {
    pub fn key(&self) -> DecisionKey {
        DecisionKey {
            firefighter_id: self.firefighter_id.clone(),
            gas: self.gas.clone(),
            window: self.window.clone(),
            tick: self.tick,
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.status == DecisionStatus::Exceeded
    }
}

/// Produce this tick's decision for one key.
///
/// `prior` must be the most recent record for the same key strictly before
/// this tick; with no prior record the key is treated as OK.
pub fn evaluate(
    statistic: &ExposureStatistic,
    limit: &Limit,
    prior: Option<&DecisionRecord>,
) -> DecisionRecord {
    let prior_state = prior.map(|p| p.state).unwrap_or_default();

    let (value, gauge_percent, exceeded, range_exceeded) = match statistic.exposure {
        Exposure::InsufficientData => {
            return record(statistic, limit, None, None, DecisionStatus::Unknown, prior_state, false);
        }
        // The true value is at least the sensor maximum; never under-report it.
        Exposure::RangeExceeded => (None, None, true, true),
        Exposure::Value(v) => {
            let gauge = (v * 100.0 / limit.value).round();
            // Reaching the limit counts as exceeding it.
            (Some(v), Some(gauge), v >= limit.value, false)
        }
    };

    let (status, state) = if exceeded {
        (DecisionStatus::Exceeded, ExposureState::Exceeded)
    } else if prior_state == ExposureState::Exceeded {
        (DecisionStatus::Recovered, ExposureState::Ok)
    } else {
        (DecisionStatus::Ok, ExposureState::Ok)
    };

    record(statistic, limit, value, gauge_percent, status, state, range_exceeded)
}

fn record(
    statistic: &ExposureStatistic,
    limit: &Limit,
    value: Option<f64>,
    gauge_percent: Option<f64>,
    status: DecisionStatus,
    state: ExposureState,
    range_exceeded: bool,
) -> DecisionRecord {
    DecisionRecord {
        firefighter_id: statistic.firefighter_id.clone(),
        gas: statistic.gas.clone(),
        region: limit.region.clone(),
        window: statistic.window.clone(),
        window_kind: statistic.kind,
        tick: statistic.bounds.end,
        value,
        limit: limit.value,
        limits_version: limit.version.clone(),
        gauge_percent,
        status,
        state,
        range_exceeded,
        sample_count: statistic.sample_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::windowing::WindowBounds;
    use chrono::{Duration, TimeZone};

    fn tick(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn limit(value: f64) -> Limit {
        Limit {
            gas: "carbon_monoxide".into(),
            region: "EU".into(),
            window: "TWA-8h".into(),
            value,
            version: "test".into(),
        }
    }

    fn statistic(minute: i64, exposure: Exposure) -> ExposureStatistic {
        ExposureStatistic {
            firefighter_id: "F1".into(),
            gas: "carbon_monoxide".into(),
            window: "TWA-8h".into(),
            kind: WindowKind::Twa,
            bounds: WindowBounds {
                start: tick(minute) - Duration::hours(8),
                end: tick(minute),
            },
            exposure,
            sample_count: usize::from(exposure != Exposure::InsufficientData),
            first_sample: None,
            last_sample: None,
        }
    }

    #[test]
    fn test_first_tick_below_limit_is_ok() {
        let decision = evaluate(&statistic(0, Exposure::Value(10.0)), &limit(25.0), None);
        assert_eq!(decision.status, DecisionStatus::Ok);
        assert_eq!(decision.state, ExposureState::Ok);
        assert_eq!(decision.gauge_percent, Some(40.0));
        assert_eq!(decision.tick, tick(0));
    }

    #[test]
    fn test_equal_to_limit_is_exceeded() {
        let decision = evaluate(&statistic(0, Exposure::Value(25.0)), &limit(25.0), None);
        assert_eq!(decision.status, DecisionStatus::Exceeded);
        assert_eq!(decision.gauge_percent, Some(100.0));
    }

    #[test]
    fn test_recovered_once_then_ok() {
        let l = limit(25.0);
        let exceeded = evaluate(&statistic(0, Exposure::Value(30.0)), &l, None);
        assert_eq!(exceeded.status, DecisionStatus::Exceeded);

        let recovered = evaluate(&statistic(1, Exposure::Value(20.0)), &l, Some(&exceeded));
        assert_eq!(recovered.status, DecisionStatus::Recovered);
        assert_eq!(recovered.state, ExposureState::Ok);

        let ok = evaluate(&statistic(2, Exposure::Value(20.0)), &l, Some(&recovered));
        assert_eq!(ok.status, DecisionStatus::Ok);
    }

    #[test]
    fn test_still_exceeded_stays_exceeded() {
        let l = limit(25.0);
        let first = evaluate(&statistic(0, Exposure::Value(30.0)), &l, None);
        let second = evaluate(&statistic(1, Exposure::Value(26.0)), &l, Some(&first));
        assert_eq!(second.status, DecisionStatus::Exceeded);
        assert_eq!(second.state, ExposureState::Exceeded);
    }

    #[test]
    fn test_insufficient_data_keeps_last_known_state() {
        let l = limit(25.0);
        let exceeded = evaluate(&statistic(0, Exposure::Value(30.0)), &l, None);

        let unknown = evaluate(&statistic(1, Exposure::InsufficientData), &l, Some(&exceeded));
        assert_eq!(unknown.status, DecisionStatus::Unknown);
        assert_eq!(unknown.state, ExposureState::Exceeded);
        assert_eq!(unknown.value, None);
        assert!(!unknown.is_exceeded());

        // Coming back below the limit after the gap still reports the crossing.
        let recovered = evaluate(&statistic(2, Exposure::Value(5.0)), &l, Some(&unknown));
        assert_eq!(recovered.status, DecisionStatus::Recovered);
    }

    #[test]
    fn test_insufficient_data_on_first_tick_is_unknown_not_ok() {
        let decision = evaluate(&statistic(0, Exposure::InsufficientData), &limit(25.0), None);
        assert_eq!(decision.status, DecisionStatus::Unknown);
        assert_eq!(decision.state, ExposureState::Ok);
    }

    #[test]
    fn test_range_exceeded_counts_as_exceeded() {
        let decision = evaluate(&statistic(0, Exposure::RangeExceeded), &limit(25.0), None);
        assert_eq!(decision.status, DecisionStatus::Exceeded);
        assert!(decision.range_exceeded);
        assert_eq!(decision.value, None);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&DecisionStatus::Recovered).unwrap();
        assert_eq!(json, "\"RECOVERED\"");
    }
}
