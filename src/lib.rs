//! Gas Exposure Analytics - windowed exposure evaluation for firefighters.
//!
//! This library turns timestamped toxin-concentration readings from wearable
//! sensors into rolling exposure statistics and compares them, once per tick,
//! against a versioned table of per-gas, per-region limits.
//!
//! # Guarantees
//!
//! - **No silent OK**: a window without readings yields UNKNOWN, never zero
//! - **Limit reached is exceeded**: a value equal to the limit is EXCEEDED
//! - **Append-only**: one decision per key and tick; reruns never duplicate
//! - **Isolation**: one firefighter's failure never blocks another's decision
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Gas Exposure Analytics                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐        │
//! │  │  Scheduler  │──▶│   Engine    │──▶│  Windowing  │        │
//! │  │ (interval)  │   │ (fan-out)   │   │ (TWA/ceil)  │        │
//! │  └─────────────┘   └─────────────┘   └─────────────┘        │
//! │                       │       ▲              │              │
//! │                       ▼       │              ▼              │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐        │
//! │  │   Health    │   │    Store    │◀──│  Decision   │◀─ Limits│
//! │  │  Monitor    │   │ (readings)  │   │ (evaluate)  │        │
//! │  └─────────────┘   └─────────────┘   └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use gas_exposure_analytics::{Config, Engine, HealthMonitor, LimitRegistry, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! let limits = Arc::new(LimitRegistry::from_file(&config.limits_path)?);
//! let store = Arc::new(MemoryStore::load(&config.store_path, config.default_region.clone())?);
//!
//! let engine = Engine::new(store, limits, config, Arc::new(HealthMonitor::new()));
//! let summary = engine.run_tick(chrono::Utc::now()).await;
//! println!("{} decisions, {} exceeded", summary.evaluated_count, summary.exceeded_keys.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod health;
pub mod scheduler;
pub mod store;

// Re-export key types at crate root for convenience
pub use config::Config;
pub use core::{
    aggregate, evaluate, DecisionRecord, DecisionStatus, Exposure, ExposureStatistic,
    FirefighterStatus, LimitRegistry, LimitTable, Reading, StatusLevel, WindowSpec,
};
pub use engine::{Engine, FirefighterFailure, TickSummary};
pub use error::{ConfigError, EngineError, StoreError};
pub use health::{HealthMonitor, HealthReport, SharedHealth};
pub use scheduler::{Scheduler, SchedulerStats};
pub use store::{MemoryStore, PutOutcome, ReadingStore, SharedStore, TimeoutStore};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
