//! Core exposure analytics.
//!
//! This module contains:
//! - Reading and firefighter types
//! - Window specifications and the TWA/ceiling aggregator
//! - The versioned limit table
//! - The threshold decision evaluator
//! - The per-firefighter status view

pub mod decision;
pub mod limits;
pub mod status;
pub mod types;
pub mod windowing;

// Re-export commonly used types
pub use decision::{evaluate, DecisionKey, DecisionRecord, DecisionStatus, ExposureState};
pub use limits::{Limit, LimitEntry, LimitKey, LimitRegistry, LimitTable, LimitsFile, SensorRange};
pub use status::{FirefighterStatus, StatusLevel};
pub use types::{Firefighter, FirefighterId, GasId, Reading, RegionId, RANGE_EXCEEDED_SENTINEL};
pub use windowing::{aggregate, Exposure, ExposureStatistic, WindowBounds, WindowKind, WindowSpec};
