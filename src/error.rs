//! Error types for the exposure engine.

use std::time::Duration;

/// Configuration errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    /// Every issue found while validating, so operators can fix them in one pass.
    #[error("invalid configuration:{}", format_issues(.0))]
    Invalid(Vec<String>),
}

fn format_issues(issues: &[String]) -> String {
    issues
        .iter()
        .enumerate()
        .map(|(idx, issue)| format!("\n  ({}) {issue}", idx + 1))
        .collect()
}

/// Errors raised by a reading store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store timed out after {0:?}")]
    Timeout(Duration),

    #[error("store data corrupt: {0}")]
    Corrupt(String),
}

/// Errors isolated to a single firefighter's evaluation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("evaluation task panicked: {0}")]
    TaskPanicked(String),

    #[error("evaluation exceeded its {0:?} budget")]
    BudgetExceeded(Duration),
}

impl EngineError {
    /// Transient errors are retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Store(StoreError::Unavailable(_) | StoreError::Timeout(_))
                | EngineError::BudgetExceeded(_)
        )
    }
}
