//! # reconcile-core
//!
//! The Reconciliation Pipeline and Quota-Aware LLM Execution Fabric that
//! reconciles a spreadsheet-derived occupation taxonomy against an
//! independently PDF-extracted transcript, using an LLM subservice to
//! clean and disambiguate rows.
//!
//! ## Core Components
//!
//! - **Store**: versioned persistence of hierarchical classification rows
//! - **LLM Client**: submit/poll/result facade over the LLM subservice
//! - **Fabric**: quota-aware concurrency controller fronting all LLM calls
//! - **Batch Processor**: groups, cleans, and merges PDF-extracted records
//! - **Metrics**: per-stage duration stats, error histogram, activity log
//! - **Pipeline**: the five-stage state machine driving a task to completion

pub mod batch;
pub mod config;
pub mod error;
pub mod fabric;
pub mod llm;
pub mod metrics;
pub mod pdf;
pub mod pipeline;
pub mod store;

pub use batch::{
    clean_pdf_records, clean_rule_records, group_key, group_records, run_pipeline_mode,
    validate_records, BatchRunContext, CleanedItem, DEFAULT_FANOUT_CEILING, DEFAULT_RULE_CHUNK_SIZE,
};
pub use config::{AdaptiveConfig, AdaptiveRange, ClassLimits, Config, GlobalLimits};
pub use error::{Error, Result};
pub use fabric::{ConcurrencyFabric, FabricPermit, Outcome, TaskClass, WindowSummary, WINDOW_CAP};
pub use llm::{
    extract_json_items, HttpLlmClient, LLMClient, MockLlmClient, PollConfig, PollOutcome,
    PollResponse, RetryConfig, SubmitRequest, SubmitResponse,
};
pub use metrics::{ActivityEntry, ActivityStatus, Metrics, MetricsSnapshot, StageStats, ACTIVITY_CAP};
pub use pdf::{ExtractedOccupationCode, HttpPdfExtractClient, MockPdfExtractClient, PdfExtractClient};
pub use pipeline::{Choice, Enhancement, FlatRecord, ReconciliationPipeline};
pub use store::{
    latest_complete_version, parent_code_of, CategoryRow, CategoryStore, CodePatch, DataSource,
    Level, RowFilter, RowPatch, RowStatus, SqliteCategoryStore, VersionHistoryEntry,
};
