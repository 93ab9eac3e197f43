//! Types shared across the Quota-Aware Concurrency Fabric.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An LLM routing key with its own concurrency budget.
///
/// The spec's glossary names `data_cleaning` and `semantic_analysis` as the
/// two classes Stage 2 and Stage 4 drive; Stage 4 additionally rotates
/// across both to spread load across queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    DataCleaning,
    SemanticAnalysis,
}

impl TaskClass {
    /// The fixed rotation pool Stage 4 cycles through.
    pub const ROTATION_POOL: [TaskClass; 2] = [TaskClass::SemanticAnalysis, TaskClass::DataCleaning];

    pub fn rotate(index: usize) -> TaskClass {
        Self::ROTATION_POOL[index % Self::ROTATION_POOL.len()]
    }
}

impl std::fmt::Display for TaskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataCleaning => write!(f, "data_cleaning"),
            Self::SemanticAnalysis => write!(f, "semantic_analysis"),
        }
    }
}

/// Outcome of a single LLM call, as reported to `Fabric::observe`.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub success: bool,
    pub duration: Duration,
    pub error_code: Option<String>,
}

impl Outcome {
    pub fn success(duration: Duration) -> Self {
        Self {
            success: true,
            duration,
            error_code: None,
        }
    }

    pub fn failure(duration: Duration, error_code: impl Into<String>) -> Self {
        Self {
            success: false,
            duration,
            error_code: Some(error_code.into()),
        }
    }
}

/// Maximum length of the rolling outcome window per class (≈100 per spec §3).
pub const WINDOW_CAP: usize = 100;

/// Aggregate view over a class's rolling window, computed on demand.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSummary {
    pub count: usize,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_duration: Duration,
}
