//! Per-firefighter status view built from the latest decision of every key.

use crate::core::decision::{DecisionRecord, DecisionStatus};
use crate::core::types::FirefighterId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Traffic-light level shown to the command center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Green,
    Yellow,
    Red,
    /// A sensor reported a value outside its range; exposure cannot be measured
    RangeExceeded,
    /// No key could be evaluated
    Unavailable,
}

/// Latest known status of one firefighter across all gases and windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirefighterStatus {
    pub firefighter_id: FirefighterId,
    /// Most recent tick among the included decisions
    pub as_of: Option<DateTime<Utc>>,
    pub level: StatusLevel,
    /// Whether any key is currently at or above its limit
    pub exceeding: bool,
    /// Highest gauge across every evaluated key
    pub max_gauge_percent: Option<f64>,
    pub decisions: Vec<DecisionRecord>,
}

impl FirefighterStatus {
    /// Summarize the latest decision of each key.
    pub fn from_decisions(
        firefighter_id: &str,
        mut decisions: Vec<DecisionRecord>,
        yellow_warning_percent: f64,
    ) -> Self {
        decisions.sort_by(|a, b| (&a.gas, &a.window).cmp(&(&b.gas, &b.window)));

        let as_of = decisions.iter().map(|d| d.tick).max();
        let exceeding = decisions.iter().any(DecisionRecord::is_exceeded);
        let max_gauge_percent = decisions
            .iter()
            .filter_map(|d| d.gauge_percent)
            .reduce(f64::max);

        let level = if decisions.iter().any(|d| d.range_exceeded) {
            StatusLevel::RangeExceeded
        } else if exceeding {
            StatusLevel::Red
        } else if decisions.iter().all(|d| d.status == DecisionStatus::Unknown) {
            StatusLevel::Unavailable
        } else if max_gauge_percent.is_some_and(|g| g >= yellow_warning_percent) {
            StatusLevel::Yellow
        } else {
            StatusLevel::Green
        };

        Self {
            firefighter_id: firefighter_id.to_string(),
            as_of,
            level,
            exceeding,
            max_gauge_percent,
            decisions,
        }
    }

    /// Keys currently at or above their limit.
    pub fn exceeded_decisions(&self) -> impl Iterator<Item = &DecisionRecord> {
        self.decisions.iter().filter(|d| d.is_exceeded())
    }
}
