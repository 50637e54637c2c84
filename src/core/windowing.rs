//! Exposure windows and the time-weighted-average aggregator.
//!
//! Every window ends at the evaluation instant and looks back over its
//! duration. Concentrations are interpolated piecewise-constant: each reading
//! holds until the next reading or the end of the window, and the earliest
//! reading in the window is held back to the window start.

use crate::core::types::{GasId, Reading};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How a window reduces its readings to a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Integral of concentration over time divided by the window duration
    Twa,
    /// Highest single reading, never to be reached even momentarily
    Ceiling,
}

/// A named exposure-averaging interval, e.g. `STEL-15m` or `TWA-8h`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Unique window name used as part of every limit and decision key
    pub name: String,
    /// Window length in minutes
    pub minutes: u32,
    /// Averaging kind
    pub kind: WindowKind,
    /// Gases this window applies to; `None` means every supported gas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gases: Option<Vec<GasId>>,
}

impl WindowSpec {
    pub fn new(name: impl Into<String>, minutes: u32, kind: WindowKind) -> Self {
        Self {
            name: name.into(),
            minutes,
            kind,
            gases: None,
        }
    }

    /// Restrict the window to a subset of gases.
    pub fn for_gases<I, S>(mut self, gases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<GasId>,
    {
        self.gases = Some(gases.into_iter().map(Into::into).collect());
        self
    }

    /// Window length.
    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.minutes))
    }

    /// Whether this window is evaluated for the given gas.
    pub fn applies_to(&self, gas: &str) -> bool {
        match &self.gases {
            Some(gases) => gases.iter().any(|g| g == gas),
            None => true,
        }
    }

    /// Bounds of this window when evaluated at `at`.
    pub fn bounds(&self, at: DateTime<Utc>) -> WindowBounds {
        WindowBounds {
            start: at - self.duration(),
            end: at,
        }
    }

    /// The standard occupational-exposure windows: STEL 10/15 minutes, TWA
    /// 30/60 minutes, 4 and 8 hours.
    pub fn standard_windows() -> Vec<WindowSpec> {
        vec![
            WindowSpec::new("STEL-10m", 10, WindowKind::Twa),
            WindowSpec::new("STEL-15m", 15, WindowKind::Twa),
            WindowSpec::new("TWA-30m", 30, WindowKind::Twa),
            WindowSpec::new("TWA-60m", 60, WindowKind::Twa),
            WindowSpec::new("TWA-4h", 240, WindowKind::Twa),
            WindowSpec::new("TWA-8h", 480, WindowKind::Twa),
        ]
    }
}

/// The closed interval `[start, end]` a window covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Check if a timestamp falls within this window (both ends inclusive).
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Window length in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

/// Outcome of aggregating one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Exposure {
    /// A computed TWA or ceiling in ppm
    Value(f64),
    /// At least one reading in the window was outside the sensor range, so
    /// the true exposure is unknown but at least the sensor maximum
    RangeExceeded,
    /// No readings in the window; cannot be evaluated
    InsufficientData,
}

impl Exposure {
    pub fn value(&self) -> Option<f64> {
        match self {
            Exposure::Value(v) => Some(*v),
            _ => None,
        }
    }
}

/// Exposure statistic for one (firefighter, gas, window) at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureStatistic {
    pub firefighter_id: String,
    pub gas: GasId,
    pub window: String,
    pub kind: WindowKind,
    pub bounds: WindowBounds,
    pub exposure: Exposure,
    /// Number of readings that fell inside the window
    pub sample_count: usize,
    pub first_sample: Option<DateTime<Utc>>,
    pub last_sample: Option<DateTime<Utc>>,
}

impl ExposureStatistic {
    /// Round a computed value to the given number of decimal places.
    pub fn rounded(mut self, decimals: Option<u32>) -> Self {
        if let (Some(decimals), Exposure::Value(v)) = (decimals, self.exposure) {
            let factor = 10f64.powi(decimals as i32);
            self.exposure = Exposure::Value((v * factor).round() / factor);
        }
        self
    }

    pub fn is_insufficient(&self) -> bool {
        self.exposure == Exposure::InsufficientData
    }
}

/// Compute the exposure statistic for `window` evaluated at `at`.
///
/// `readings` may be unsorted and may include samples outside the window;
/// only samples inside `[at - duration, at]` contribute.
pub fn aggregate(
    firefighter_id: &str,
    gas: &str,
    readings: &[Reading],
    window: &WindowSpec,
    at: DateTime<Utc>,
) -> ExposureStatistic {
    let bounds = window.bounds(at);

    let mut samples: Vec<&Reading> = readings
        .iter()
        .filter(|r| bounds.contains(r.timestamp))
        .collect();
    // Stable, so equal timestamps keep arrival order and the last one holds.
    samples.sort_by_key(|r| r.timestamp);

    let exposure = if samples.is_empty() {
        Exposure::InsufficientData
    } else if samples.iter().any(|r| r.is_range_exceeded()) {
        Exposure::RangeExceeded
    } else {
        match window.kind {
            WindowKind::Twa => Exposure::Value(time_weighted_average(&samples, &bounds)),
            WindowKind::Ceiling => Exposure::Value(ceiling(&samples)),
        }
    };

    ExposureStatistic {
        firefighter_id: firefighter_id.to_string(),
        gas: gas.to_string(),
        window: window.name.clone(),
        kind: window.kind,
        bounds,
        exposure,
        sample_count: samples.len(),
        first_sample: samples.first().map(|r| r.timestamp),
        last_sample: samples.last().map(|r| r.timestamp),
    }
}

/// Piecewise-constant integral over the window divided by its duration.
/// `samples` must be non-empty and sorted.
fn time_weighted_average(samples: &[&Reading], bounds: &WindowBounds) -> f64 {
    let total_ms = bounds.duration_ms();
    if total_ms <= 0 {
        return samples[samples.len() - 1].concentration;
    }

    let mut integral = 0.0;
    // The first sample also covers the gap back to the window start.
    let mut segment_start = bounds.start;
    for (idx, reading) in samples.iter().enumerate() {
        let segment_end = samples
            .get(idx + 1)
            .map(|next| next.timestamp)
            .unwrap_or(bounds.end);
        let held_ms = (segment_end - segment_start).num_milliseconds() as f64;
        integral += reading.concentration * held_ms;
        segment_start = segment_end;
    }

    integral / total_ms as f64
}

fn ceiling(samples: &[&Reading]) -> f64 {
    samples
        .iter()
        .map(|r| r.concentration)
        .fold(f64::NEG_INFINITY, f64::max)
}
