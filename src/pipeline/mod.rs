//! Reconciliation Pipeline: the five-stage state machine that drives a
//! task from an uploaded spreadsheet through a final persisted, LLM-enhanced
//! taxonomy.
//!
//! `run`'s re-entry guard, per-run tracing span, and Stage 4's
//! `tokio::spawn` + `AtomicI32` processed/failed fan-out are grounded in
//! `other_examples/a786eb03` (`gjovanov-harvex`)'s `Pipeline::process_batch`;
//! Stage 2's "continue past a failed group, only fail on total failure"
//! degradation mirrors the same file's `process_document` fallback. Stage
//! errors are wrapped into this crate's own `Error::Stage` per the
//! propagation policy, not into the teacher's `anyhow::Error`.

mod types;

pub use types::{Choice, Enhancement, FlatRecord};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::batch::{clean_pdf_records, CleanedItem};
use crate::error::{Error, Result};
use crate::fabric::{ConcurrencyFabric, Outcome, TaskClass};
use crate::llm::{extract_json_items, LLMClient};
use crate::metrics::Metrics;
use crate::pdf::PdfExtractClient;
use crate::store::{CategoryRow, CategoryStore, CodePatch, DataSource, RowFilter, RowPatch, RowStatus};

const STAGE4_BATCH_SIZE: usize = 10;
const STAGE4_BATCH_PAUSE: Duration = Duration::from_secs(1);

/// The five-stage state machine. Holds every collaborator as an owned
/// `Arc`, threaded in explicitly at construction time — no ambient/static
/// access to Store, Fabric, or Metrics state (spec §9).
pub struct ReconciliationPipeline {
    store: Arc<dyn CategoryStore>,
    llm: Arc<dyn LLMClient>,
    pdf: Arc<dyn PdfExtractClient>,
    fabric: Arc<ConcurrencyFabric>,
    metrics: Arc<Metrics>,
    in_flight: StdMutex<HashSet<Uuid>>,
}

impl ReconciliationPipeline {
    pub fn new(
        store: Arc<dyn CategoryStore>,
        llm: Arc<dyn LLMClient>,
        pdf: Arc<dyn PdfExtractClient>,
        fabric: Arc<ConcurrencyFabric>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            llm,
            pdf,
            fabric,
            metrics,
            in_flight: StdMutex::new(HashSet::new()),
        })
    }

    /// Drive `task_id` through all five stages. Guards against concurrent
    /// re-entry on the same task; Stages 2-5 inherit `cancel` directly (the
    /// resolved pipeline-context-lifetime question, spec §5).
    pub async fn run(&self, task_id: Uuid, flat_records: Vec<FlatRecord>, cancel: CancellationToken) -> Result<()> {
        {
            let mut guard = self.in_flight.lock().expect("in_flight mutex poisoned");
            if !guard.insert(task_id) {
                return Err(Error::validation(format!("task {task_id} is already running")));
            }
        }
        let result = self.run_inner(task_id, flat_records, cancel).await;
        self.in_flight.lock().expect("in_flight mutex poisoned").remove(&task_id);
        result
    }

    async fn run_inner(&self, task_id: Uuid, flat_records: Vec<FlatRecord>, cancel: CancellationToken) -> Result<()> {
        let span = info_span!("pipeline_run", %task_id);
        let _enter = span.enter();

        self.store.set_task_status(task_id, "processing", None).await?;

        let outcome: Result<()> = async {
            self.stage1_ingest(task_id, flat_records)
                .await
                .map_err(|e| wrap_stage("ingest_spreadsheet", e))?;

            let cleaned = self
                .stage2_pdf_extract(task_id, &cancel)
                .await
                .map_err(|e| wrap_stage("pdf_extract_and_cleanup", e))?;

            self.stage3_merge(task_id, &cleaned)
                .await
                .map_err(|e| wrap_stage("merge", e))?;

            self.stage4_disambiguate(task_id, &cancel)
                .await
                .map_err(|e| wrap_stage("semantic_disambiguation", e))?;

            self.stage5_reconcile(task_id)
                .await
                .map_err(|e| wrap_stage("reconciliation_check", e))?;

            Ok(())
        }
        .await;

        match &outcome {
            Ok(()) => {
                self.store.set_task_status(task_id, "completed", None).await?;
            }
            Err(e) => {
                warn!(%task_id, error = %e, "pipeline run failed");
                let _ = self.store.set_task_status(task_id, "failed", Some(&e.to_string())).await;
            }
        }
        outcome
    }

    /// Stage 1 — Ingest Spreadsheet.
    async fn stage1_ingest(&self, task_id: Uuid, flat_records: Vec<FlatRecord>) -> Result<()> {
        let batch_id = Uuid::new_v4();
        let rows: Vec<CategoryRow> = flat_records
            .into_iter()
            .map(|r| CategoryRow::new_excel(task_id, r.code, r.name, batch_id))
            .collect();
        let count = rows.len();
        self.store.ingest_batch(task_id, batch_id, rows).await?;
        info!(%task_id, %batch_id, count, "stage1 ingested spreadsheet");
        Ok(())
    }

    /// Stage 2 — PDF extract & first-round cleanup.
    async fn stage2_pdf_extract(&self, task_id: Uuid, cancel: &CancellationToken) -> Result<Vec<CleanedItem>> {
        let extracted = self.pdf.extract(task_id).await?;
        let cleaned = clean_pdf_records(
            extracted,
            self.llm.clone(),
            self.fabric.clone(),
            self.metrics.clone(),
            TaskClass::DataCleaning,
            cancel.clone(),
        )
        .await?;
        info!(%task_id, cleaned = cleaned.len(), "stage2 cleaned pdf records");
        Ok(cleaned)
    }

    /// Stage 3 — Merge. Matches current excel-status rows by code, then by
    /// name, against Stage 2's cleaned items; unmatched rows stay
    /// `excel_parsed`. Zero matches is a success, reported only via logs.
    async fn stage3_merge(&self, task_id: Uuid, cleaned: &[CleanedItem]) -> Result<()> {
        let by_code: HashMap<&str, &CleanedItem> = cleaned.iter().map(|c| (c.code.as_str(), c)).collect();
        let by_name: HashMap<&str, &CleanedItem> = cleaned.iter().map(|c| (c.name.as_str(), c)).collect();

        let rows = self
            .store
            .get_current(task_id, RowFilter::with_status(RowStatus::ExcelParsed))
            .await?;

        let mut patches = Vec::new();
        for row in &rows {
            let matched = by_code
                .get(row.code.as_str())
                .or_else(|| by_name.get(row.name.as_str()));
            if let Some(item) = matched {
                let pdf_info = serde_json::to_string(item)?;
                patches.push(CodePatch {
                    code: row.code.clone(),
                    patch: RowPatch {
                        status: Some(RowStatus::PdfMerged),
                        data_source: Some(DataSource::Merged),
                        pdf_info: Some(pdf_info),
                        ..Default::default()
                    },
                });
            }
        }

        let matched = patches.len();
        if !patches.is_empty() {
            self.store.batch_update_by_code(task_id, patches).await?;
        }
        info!(%task_id, matched, total = rows.len(), "stage3 merged cleaned items into rows");
        Ok(())
    }

    /// Stage 4 — Semantic disambiguation, batched. Rotates the task class
    /// across the fixed rotation pool to spread load; a batch aborts the
    /// stage only when more than half its rows fail their LLM call.
    async fn stage4_disambiguate(&self, task_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let mut rows = self
            .store
            .get_current(task_id, RowFilter::with_status(RowStatus::PdfMerged))
            .await?;
        if rows.is_empty() {
            rows = self
                .store
                .get_current(task_id, RowFilter::with_status(RowStatus::ExcelParsed))
                .await?;
        }
        if rows.is_empty() {
            return Ok(());
        }

        let choices: Vec<Choice> = rows
            .iter()
            .map(|row| Choice {
                code: row.code.clone(),
                rule_name: row.name.clone(),
                pdf_name: row.pdf_info.as_deref().and_then(extract_pdf_name),
                parent_hierarchy: row.parent_code.clone(),
            })
            .collect();

        let batches: Vec<&[Choice]> = choices.chunks(STAGE4_BATCH_SIZE).collect();
        let batch_count = batches.len();

        for (batch_index, batch) in batches.into_iter().enumerate() {
            let processed = Arc::new(AtomicI32::new(0));
            let failed = Arc::new(AtomicI32::new(0));

            let handles: Vec<_> = batch
                .iter()
                .cloned()
                .enumerate()
                .map(|(row_index, choice)| {
                    let llm = self.llm.clone();
                    let fabric = self.fabric.clone();
                    let metrics = self.metrics.clone();
                    let cancel = cancel.clone();
                    let processed = processed.clone();
                    let failed = failed.clone();
                    let task_class = TaskClass::rotate(batch_index * STAGE4_BATCH_SIZE + row_index);

                    tokio::spawn(async move {
                        let outcome =
                            disambiguate_choice(&choice, llm, fabric, metrics, task_class, cancel).await;
                        match &outcome {
                            Ok(_) => {
                                processed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        (choice, outcome)
                    })
                })
                .collect();

            let joined = join_all(handles).await;
            let total = joined.len();
            let failed_count = failed.load(Ordering::Relaxed) as usize;

            if total > 0 && failed_count * 2 > total {
                return Err(Error::permanent_remote(
                    "stage4_disambiguate",
                    format!("{failed_count}/{total} choices failed in batch {batch_index}"),
                ));
            }

            let mut patches = Vec::with_capacity(total);
            for handle_result in joined {
                let (choice, outcome) =
                    handle_result.map_err(|e| Error::Internal(format!("stage4 task panicked: {e}")))?;
                let enhancement = match outcome {
                    Ok(name) => Enhancement { name, source: "llm".to_string() },
                    Err(e) => {
                        warn!(code = %choice.code, error = %e, "stage4 choice failed, substituting rule name");
                        Enhancement { name: choice.rule_name.clone(), source: "default".to_string() }
                    }
                };
                let serialized = serde_json::to_string(&enhancement)?;
                patches.push(CodePatch {
                    code: choice.code.clone(),
                    patch: RowPatch {
                        status: Some(RowStatus::Completed),
                        llm_enhancements: Some(serialized),
                        name: Some(enhancement.name),
                        ..Default::default()
                    },
                });
            }
            self.store.batch_update_by_code(task_id, patches).await?;

            if batch_index + 1 < batch_count {
                tokio::select! {
                    _ = tokio::time::sleep(STAGE4_BATCH_PAUSE) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
        }

        Ok(())
    }

    /// Stage 5 — Reconciliation check. `expected` is the Stage 4 working set
    /// (rows Stage 4 actually touched, now `completed`) — rows Stage 4 never
    /// saw stay at whatever status they had and are never topped up. Tops up
    /// any of those completed rows still lacking `llmEnhancements`; always
    /// succeeds unless the Store faults.
    async fn stage5_reconcile(&self, task_id: Uuid) -> Result<()> {
        let rows = self
            .store
            .get_current(task_id, RowFilter::with_status(RowStatus::Completed))
            .await?;
        let expected = rows.len();
        let enhanced = rows
            .iter()
            .filter(|r| r.llm_enhancements.as_deref().is_some_and(|s| !s.is_empty()))
            .count();

        if enhanced >= expected {
            return Ok(());
        }

        let patches: Vec<CodePatch> = rows
            .iter()
            .filter(|r| !r.llm_enhancements.as_deref().is_some_and(|s| !s.is_empty()))
            .map(|r| {
                let enhancement = Enhancement { name: r.name.clone(), source: "topup".to_string() };
                let serialized = serde_json::to_string(&enhancement).unwrap_or_default();
                CodePatch {
                    code: r.code.clone(),
                    patch: RowPatch {
                        status: Some(RowStatus::Completed),
                        llm_enhancements: Some(serialized),
                        ..Default::default()
                    },
                }
            })
            .collect();

        info!(%task_id, topped_up = patches.len(), "stage5 reconciliation top-up");
        if !patches.is_empty() {
            self.store.batch_update_by_code(task_id, patches).await?;
        }
        Ok(())
    }
}

fn wrap_stage(stage: &str, err: Error) -> Error {
    if err.is_cancelled() {
        return err;
    }
    let retryable = err.is_retryable();
    Error::stage(stage, err, retryable)
}

fn extract_pdf_name(pdf_info: &str) -> Option<String> {
    let item: CleanedItem = serde_json::from_str(pdf_info).ok()?;
    Some(item.name)
}

fn build_choice_prompt(choice: &Choice) -> String {
    format!(
        "Given ruleName={:?}, pdfName={:?}, parentHierarchy={:?}, pick name = ruleName or name = pdfName \
         (never invent a new name). Respond with JSON {{\"items\": [{{\"name\": \"<chosen>\"}}]}}.",
        choice.rule_name, choice.pdf_name, choice.parent_hierarchy,
    )
}

async fn disambiguate_choice(
    choice: &Choice,
    llm: Arc<dyn LLMClient>,
    fabric: Arc<ConcurrencyFabric>,
    metrics: Arc<Metrics>,
    task_class: TaskClass,
    cancel: CancellationToken,
) -> Result<String> {
    let permit = fabric.acquire(task_class, &cancel).await?;
    let prompt = build_choice_prompt(choice);
    let started = Instant::now();
    let response = llm.call(task_class, &prompt, &cancel).await;
    let elapsed = started.elapsed();
    drop(permit);

    match response {
        Ok(raw) => {
            fabric.observe(task_class, Outcome::success(elapsed)).await;
            metrics.record_duration(format!("stage4.{task_class}"), elapsed);
            let items = extract_json_items(&raw)?;
            let name = items
                .first()
                .and_then(value_name)
                .ok_or_else(|| Error::permanent_remote("stage4 llm response", "missing name field"))?;
            metrics.record_success(format!("stage4.{task_class}"));
            Ok(name)
        }
        Err(e) => {
            fabric
                .observe(task_class, Outcome::failure(elapsed, e.to_string()))
                .await;
            metrics.record_error(format!("stage4.{task_class}"), e.to_string());
            Err(e)
        }
    }
}

fn value_name(value: &Value) -> Option<String> {
    value.get("name")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::MockLlmClient;
    use crate::pdf::{ExtractedOccupationCode, MockPdfExtractClient};
    use crate::store::SqliteCategoryStore;

    fn pipeline_with(
        llm: MockLlmClient,
        pdf: MockPdfExtractClient,
    ) -> (Arc<ReconciliationPipeline>, Arc<SqliteCategoryStore>) {
        let store = Arc::new(SqliteCategoryStore::open_in_memory().unwrap());
        let fabric = ConcurrencyFabric::new(Config::default());
        let metrics = Arc::new(Metrics::new());
        let pipeline = ReconciliationPipeline::new(
            store.clone(),
            Arc::new(llm),
            Arc::new(pdf),
            fabric,
            metrics,
        );
        (pipeline, store)
    }

    #[tokio::test]
    async fn concurrent_reentry_on_the_same_task_is_rejected() {
        let (pipeline, _store) = pipeline_with(
            MockLlmClient::new(r#"{"items": [{"name": "X"}]}"#),
            MockPdfExtractClient::new(vec![]),
        );
        let task_id = Uuid::new_v4();

        {
            let mut guard = pipeline.in_flight.lock().unwrap();
            guard.insert(task_id);
        }

        let result = pipeline.run(task_id, vec![], CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_flat_records_succeeds_through_every_stage() {
        let (pipeline, store) = pipeline_with(
            MockLlmClient::new(r#"{"items": [{"name": "X"}]}"#),
            MockPdfExtractClient::new(vec![]),
        );
        let task_id = Uuid::new_v4();

        pipeline.run(task_id, vec![], CancellationToken::new()).await.unwrap();

        let status = store.task_status(task_id).await.unwrap();
        assert_eq!(status.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn stage2_total_failure_fails_the_pipeline_but_keeps_stage1_rows() {
        let llm = MockLlmClient::new("unused");
        llm.push_response(Err(Error::permanent_remote("mock", "group fails")));
        let (pipeline, store) = pipeline_with(
            llm,
            MockPdfExtractClient::new(vec![ExtractedOccupationCode {
                code: "1-01".to_string(),
                name: "B".to_string(),
                confidence: None,
                font: None,
            }]),
        );
        let task_id = Uuid::new_v4();

        let result = pipeline
            .run(task_id, vec![FlatRecord::new("1-01", "B")], CancellationToken::new())
            .await;
        assert!(result.is_err());

        let rows = store.get_current(task_id, RowFilter::none()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, RowStatus::ExcelParsed);

        let status = store.task_status(task_id).await.unwrap();
        assert_eq!(status.as_deref(), Some("failed"));
    }
}
