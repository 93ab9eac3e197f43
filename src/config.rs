//! Configuration surface for the Fabric, Store and pipeline stages.
//!
//! Mirrors the keys enumerated in the spec's "Configuration surface" section.
//! All values have defaults so the crate works out of the box in tests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::fabric::TaskClass;

/// Per-class adaptive concurrency range and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveRange {
    pub min: usize,
    pub max: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
}

impl Default for AdaptiveRange {
    fn default() -> Self {
        Self {
            min: 1,
            max: 8,
            scale_up_threshold: 0.9,
            scale_down_threshold: 0.3,
        }
    }
}

/// Per-task-class limits: concurrency, RPM share, spacing, adaptive range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassLimits {
    pub rpm_percent: f64,
    pub max_concurrent: usize,
    pub request_interval_ms: u64,
    pub adaptive_range: AdaptiveRange,
}

impl ClassLimits {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

impl Default for ClassLimits {
    fn default() -> Self {
        Self {
            rpm_percent: 0.5,
            max_concurrent: 4,
            request_interval_ms: 250,
            adaptive_range: AdaptiveRange::default(),
        }
    }
}

/// Global ceilings shared across all task classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalLimits {
    pub max_rpm: u32,
    pub max_concurrent: usize,
    pub max_tpm: u32,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            max_rpm: 600,
            max_concurrent: 16,
            max_tpm: 1_000_000,
        }
    }
}

/// Adaptive loop scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub enable: bool,
    pub adjustment_interval_secs: u64,
    pub fast_duration_ms: u64,
    pub slow_duration_ms: u64,
}

impl AdaptiveConfig {
    pub fn adjustment_interval(&self) -> Duration {
        Duration::from_secs(self.adjustment_interval_secs)
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enable: true,
            adjustment_interval_secs: 30,
            fast_duration_ms: 2_000,
            slow_duration_ms: 10_000,
        }
    }
}

/// Top-level configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub global: GlobalLimits,
    pub classes: HashMap<TaskClass, ClassLimits>,
    pub adaptive: AdaptiveConfig,
    pub pdf_timeout_secs: u64,
    pub llm_timeout_secs: u64,
    pub persistence_batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Config {
    pub fn pdf_timeout(&self) -> Duration {
        Duration::from_secs(self.pdf_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn class_limits(&self, class: TaskClass) -> ClassLimits {
        self.classes.get(&class).cloned().unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut classes = HashMap::new();
        classes.insert(TaskClass::DataCleaning, ClassLimits::default());
        classes.insert(TaskClass::SemanticAnalysis, ClassLimits::default());

        Self {
            global: GlobalLimits::default(),
            classes,
            adaptive: AdaptiveConfig::default(),
            pdf_timeout_secs: 180,
            llm_timeout_secs: 300,
            persistence_batch_size: 10,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_both_classes() {
        let cfg = Config::default();
        assert!(cfg.classes.contains_key(&TaskClass::DataCleaning));
        assert!(cfg.classes.contains_key(&TaskClass::SemanticAnalysis));
    }

    #[test]
    fn unconfigured_class_falls_back_to_default_limits() {
        let cfg = Config::default();
        let limits = cfg.class_limits(TaskClass::SemanticAnalysis);
        assert_eq!(limits.max_concurrent, 4);
    }
}
