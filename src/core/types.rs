//! Sensor reading types shared by the aggregator, the evaluator and the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Firefighter identifier as reported by the wearable.
pub type FirefighterId = String;

/// Gas identifier, e.g. `carbon_monoxide`.
pub type GasId = String;

/// Regulatory region identifier, e.g. `EU`.
pub type RegionId = String;

/// Value the device reports when a concentration is outside its sensor range.
pub const RANGE_EXCEEDED_SENTINEL: f64 = -1.0;

/// One concentration sample for one gas.
///
/// Readings are unit-normalized (ppm) upstream and never modified here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub firefighter_id: FirefighterId,
    pub gas: GasId,
    /// Concentration in ppm. Negative values mean the sensor range was exceeded.
    pub concentration: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(
        firefighter_id: impl Into<FirefighterId>,
        gas: impl Into<GasId>,
        concentration: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            firefighter_id: firefighter_id.into(),
            gas: gas.into(),
            concentration,
            timestamp,
        }
    }

    /// Whether the device flagged this sample as outside its measurable range.
    pub fn is_range_exceeded(&self) -> bool {
        self.concentration < 0.0 || self.concentration.is_nan()
    }
}

/// A firefighter active in the current evaluation, with their assigned region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Firefighter {
    pub id: FirefighterId,
    pub region: RegionId,
}

impl Firefighter {
    pub fn new(id: impl Into<FirefighterId>, region: impl Into<RegionId>) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_exceeded_sentinel() {
        let now = Utc::now();
        assert!(Reading::new("F1", "carbon_monoxide", RANGE_EXCEEDED_SENTINEL, now).is_range_exceeded());
        assert!(!Reading::new("F1", "carbon_monoxide", 0.0, now).is_range_exceeded());
        assert!(!Reading::new("F1", "carbon_monoxide", 12.5, now).is_range_exceeded());
    }
}
