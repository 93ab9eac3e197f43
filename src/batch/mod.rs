//! Batch Processor: groups PDF-extracted records by top-level code prefix,
//! fans out concurrent LLM cleanup calls through the Fabric, and merges
//! results back into code order.
//!
//! The fan-out mechanics are grounded in this crate's own `ConcurrencyFabric`
//! plus a fixed-size `tokio::spawn`-per-group ceiling, the idiom this
//! teacher-derived crate uses everywhere it bounds concurrent work; the
//! explicit `{group, clean, validate, merge}` pipeline-mode stages are
//! grounded in the "shared `Arc<Mutex<...>>` mutated by concurrent stages"
//! convention this crate's Store and Fabric both follow.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::fabric::{ConcurrencyFabric, Outcome, TaskClass};
use crate::llm::{extract_json_items, LLMClient};
use crate::metrics::Metrics;
use crate::pdf::ExtractedOccupationCode;

/// Fixed fan-out ceiling for `CleanPdfRecords`' one-goroutine-per-group dispatch.
pub const DEFAULT_FANOUT_CEILING: usize = 8;
/// Fixed chunk size for the alternate `CleanRuleRecords` worker-pool path.
pub const DEFAULT_RULE_CHUNK_SIZE: usize = 20;

/// A single cleaned `(code, name)` pair, at most one per code after merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedItem {
    pub code: String,
    pub name: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LlmCleanedEntry {
    code: String,
    name: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Group key: the leading `-`-separated segment of `code`; an empty code
/// groups under `"unknown"`.
pub fn group_key(code: &str) -> String {
    match code.split('-').next() {
        Some(segment) if !segment.is_empty() => segment.to_string(),
        _ => "unknown".to_string(),
    }
}

/// Partition records by `group_key`, preserving within-group input order.
/// `BTreeMap` keeps groups in ascending key order for stage 4's merge.
pub fn group_records(records: Vec<ExtractedOccupationCode>) -> BTreeMap<String, Vec<ExtractedOccupationCode>> {
    let mut groups: BTreeMap<String, Vec<ExtractedOccupationCode>> = BTreeMap::new();
    for record in records {
        groups.entry(group_key(&record.code)).or_default().push(record);
    }
    groups
}

/// Drop rows lacking a non-empty `code` or `name`.
pub fn validate_records(records: Vec<ExtractedOccupationCode>) -> Vec<ExtractedOccupationCode> {
    records
        .into_iter()
        .filter(|r| !r.code.trim().is_empty() && !r.name.trim().is_empty())
        .collect()
}

fn build_prompt(items: &[ExtractedOccupationCode]) -> String {
    let pairs: Vec<String> = items
        .iter()
        .map(|i| format!("{{\"code\":\"{}\",\"name\":\"{}\"}}", i.code, i.name))
        .collect();
    format!(
        "Clean the following occupation code/name pairs and respond with JSON {{\"items\": [...]}}: [{}]",
        pairs.join(",")
    )
}

async fn clean_group(
    key: String,
    items: Vec<ExtractedOccupationCode>,
    llm: Arc<dyn LLMClient>,
    fabric: Arc<ConcurrencyFabric>,
    metrics: Arc<Metrics>,
    task_class: TaskClass,
    cancel: CancellationToken,
) -> Result<Vec<CleanedItem>> {
    let permit = fabric.acquire(task_class, &cancel).await?;
    let prompt = build_prompt(&items);
    let started = Instant::now();

    let response = llm.call(task_class, &prompt, &cancel).await;
    let elapsed = started.elapsed();
    drop(permit);

    match response {
        Ok(raw) => {
            fabric.observe(task_class, Outcome::success(elapsed)).await;
            metrics.record_duration(format!("batch.clean.{key}"), elapsed);
            let parsed = extract_json_items(&raw)?;
            let cleaned: Vec<CleanedItem> = parsed
                .into_iter()
                .filter_map(|v| serde_json::from_value::<LlmCleanedEntry>(v).ok())
                .map(|e| CleanedItem {
                    code: e.code,
                    name: e.name,
                    confidence: e.confidence,
                })
                .collect();
            metrics.record_success(format!("batch.clean.{key}"));
            Ok(cleaned)
        }
        Err(e) => {
            fabric
                .observe(task_class, Outcome::failure(elapsed, e.to_string()))
                .await;
            metrics.record_error(format!("batch.clean.{key}"), e.to_string());
            Err(e)
        }
    }
}

/// Dedup to at most one `CleanedItem` per code; later duplicates discarded.
fn dedup_by_code(items: Vec<CleanedItem>) -> Vec<CleanedItem> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.code.clone()))
        .collect()
}

/// `CleanPdfRecords`: one `tokio::spawn` per group gated by a fixed fan-out
/// ceiling, results concatenated in group-key order. Partial group failures
/// are absorbed; the call fails only when every group failed.
pub async fn clean_pdf_records(
    records: Vec<ExtractedOccupationCode>,
    llm: Arc<dyn LLMClient>,
    fabric: Arc<ConcurrencyFabric>,
    metrics: Arc<Metrics>,
    task_class: TaskClass,
    cancel: CancellationToken,
) -> Result<Vec<CleanedItem>> {
    let groups = group_records(records);
    if groups.is_empty() {
        return Ok(Vec::new());
    }

    let fanout = Arc::new(Semaphore::new(DEFAULT_FANOUT_CEILING));
    let group_count = groups.len();

    let handles: Vec<_> = groups
        .into_iter()
        .map(|(key, items)| {
            let llm = llm.clone();
            let fabric = fabric.clone();
            let metrics = metrics.clone();
            let fanout = fanout.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = fanout.acquire_owned().await.expect("fanout semaphore closed");
                let result = clean_group(key.clone(), items, llm, fabric, metrics, task_class, cancel).await;
                (key, result)
            })
        })
        .collect();

    let results = join_all(handles).await;

    let mut cleaned = Vec::new();
    let mut succeeded = 0usize;
    for result in results {
        match result {
            Ok((key, Ok(items))) => {
                succeeded += 1;
                cleaned.extend(items);
            }
            Ok((key, Err(e))) => {
                warn!(group = %key, error = %e, "pdf cleanup group failed, continuing with remaining groups");
            }
            Err(join_err) => {
                warn!(error = %join_err, "pdf cleanup group task panicked");
            }
        }
    }

    if succeeded == 0 {
        return Err(Error::permanent_remote(
            "batch processor",
            format!("all {group_count} pdf cleanup groups failed"),
        ));
    }

    Ok(dedup_by_code(cleaned))
}

/// `CleanRuleRecords`: the alternate fixed-size-chunk worker-pool path.
/// Chunks are dispatched to a pool bounded by `worker_count` rather than
/// grouped by code prefix.
pub async fn clean_rule_records(
    records: Vec<ExtractedOccupationCode>,
    worker_count: usize,
    llm: Arc<dyn LLMClient>,
    fabric: Arc<ConcurrencyFabric>,
    metrics: Arc<Metrics>,
    task_class: TaskClass,
    cancel: CancellationToken,
) -> Result<Vec<CleanedItem>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }
    let worker_count = worker_count.max(1);
    let pool = Arc::new(Semaphore::new(worker_count));

    let chunks: Vec<Vec<ExtractedOccupationCode>> = records
        .chunks(DEFAULT_RULE_CHUNK_SIZE)
        .map(|c| c.to_vec())
        .collect();
    let chunk_count = chunks.len();

    let handles: Vec<_> = chunks
        .into_iter()
        .enumerate()
        .map(|(idx, chunk)| {
            let llm = llm.clone();
            let fabric = fabric.clone();
            let metrics = metrics.clone();
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = pool.acquire_owned().await.expect("worker pool semaphore closed");
                clean_group(format!("chunk-{idx}"), chunk, llm, fabric, metrics, task_class, cancel).await
            })
        })
        .collect();

    let results = join_all(handles).await;
    let mut cleaned = Vec::new();
    let mut succeeded = 0usize;
    for result in results {
        match result {
            Ok(Ok(items)) => {
                succeeded += 1;
                cleaned.extend(items);
            }
            Ok(Err(e)) => warn!(error = %e, "rule record chunk failed, continuing"),
            Err(join_err) => warn!(error = %join_err, "rule record chunk task panicked"),
        }
    }

    if succeeded == 0 {
        return Err(Error::permanent_remote(
            "batch processor",
            format!("all {chunk_count} rule record chunks failed"),
        ));
    }

    Ok(dedup_by_code(cleaned))
}

/// Shared state for the explicit `{group, clean, validate, merge}`
/// pipeline-mode path, mutated by each stage under one lock the way the
/// Store's transaction helper and the Fabric's class map are each guarded by
/// a single lock rather than scattered across fields.
#[derive(Debug, Default)]
struct PipelineRunState {
    grouped: usize,
    validated: usize,
    cleaned: usize,
}

pub struct BatchRunContext {
    state: Mutex<PipelineRunState>,
}

impl BatchRunContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipelineRunState::default()),
        }
    }

    pub async fn progress(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        (state.grouped, state.validated, state.cleaned)
    }
}

impl Default for BatchRunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the explicit pipeline-mode path: group -> validate -> clean ->
/// merge, recording stage counts into `ctx` as each handoff completes.
pub async fn run_pipeline_mode(
    records: Vec<ExtractedOccupationCode>,
    ctx: &BatchRunContext,
    llm: Arc<dyn LLMClient>,
    fabric: Arc<ConcurrencyFabric>,
    metrics: Arc<Metrics>,
    task_class: TaskClass,
    cancel: CancellationToken,
) -> Result<Vec<CleanedItem>> {
    let validated = validate_records(records);
    {
        let mut state = ctx.state.lock().await;
        state.validated = validated.len();
    }

    let groups = group_records(validated);
    {
        let mut state = ctx.state.lock().await;
        state.grouped = groups.len();
    }

    let flattened: Vec<ExtractedOccupationCode> = groups.into_values().flatten().collect();
    let cleaned = clean_pdf_records(flattened, llm, fabric, metrics, task_class, cancel).await?;
    {
        let mut state = ctx.state.lock().await;
        state.cleaned = cleaned.len();
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::MockLlmClient;

    fn occupation(code: &str, name: &str) -> ExtractedOccupationCode {
        ExtractedOccupationCode {
            code: code.to_string(),
            name: name.to_string(),
            confidence: None,
            font: None,
        }
    }

    #[test]
    fn group_key_uses_leading_segment() {
        assert_eq!(group_key("1-01-02"), "1");
        assert_eq!(group_key(""), "unknown");
    }

    #[test]
    fn validate_drops_rows_missing_code_or_name() {
        let records = vec![occupation("1", "A"), occupation("", "B"), occupation("2", "")];
        let validated = validate_records(records);
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].code, "1");
    }

    #[test]
    fn grouping_preserves_ascending_key_order() {
        let records = vec![occupation("2-01", "B"), occupation("1-01", "A")];
        let groups = group_records(records);
        let keys: Vec<&String> = groups.keys().collect();
        assert_eq!(keys, vec!["1", "2"]);
    }

    #[test]
    fn dedup_keeps_first_occurrence_per_code() {
        let items = vec![
            CleanedItem { code: "1".into(), name: "first".into(), confidence: None },
            CleanedItem { code: "1".into(), name: "second".into(), confidence: None },
        ];
        let deduped = dedup_by_code(items);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].name, "first");
    }

    #[tokio::test]
    async fn clean_pdf_records_continues_past_a_failed_group() {
        let records = vec![occupation("1-01", "A"), occupation("2-01", "B")];
        let llm = Arc::new(MockLlmClient::new(r#"{"items": [{"code": "1-01", "name": "A-clean"}]}"#));
        llm.push_response(Err(Error::permanent_remote("mock", "group 2 fails")));
        llm.push_response(Ok(r#"{"items": [{"code": "1-01", "name": "A-clean"}]}"#.to_string()));

        let fabric = ConcurrencyFabric::new(Config::default());
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let result = clean_pdf_records(
            records,
            llm,
            fabric.clone(),
            metrics,
            TaskClass::DataCleaning,
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].code, "1-01");
        fabric.close().await;
    }

    #[tokio::test]
    async fn clean_pdf_records_fails_when_every_group_fails() {
        let records = vec![occupation("1-01", "A")];
        let llm = Arc::new(MockLlmClient::new("unused"));
        llm.push_response(Err(Error::permanent_remote("mock", "always fails")));

        let fabric = ConcurrencyFabric::new(Config::default());
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let result = clean_pdf_records(
            records,
            llm,
            fabric.clone(),
            metrics,
            TaskClass::DataCleaning,
            cancel,
        )
        .await;

        assert!(result.is_err());
        fabric.close().await;
    }

    #[tokio::test]
    async fn run_pipeline_mode_records_stage_counts() {
        let records = vec![occupation("1-01", "A"), occupation("", "dropped")];
        let llm = Arc::new(MockLlmClient::new(r#"{"items": [{"code": "1-01", "name": "A-clean"}]}"#));
        let fabric = ConcurrencyFabric::new(Config::default());
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let ctx = BatchRunContext::new();

        let cleaned = run_pipeline_mode(
            records,
            &ctx,
            llm,
            fabric.clone(),
            metrics,
            TaskClass::DataCleaning,
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(cleaned.len(), 1);
        let (grouped, validated, cleaned_count) = ctx.progress().await;
        assert_eq!(validated, 1);
        assert_eq!(grouped, 1);
        assert_eq!(cleaned_count, 1);
        fabric.close().await;
    }
}
