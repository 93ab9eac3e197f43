//! End-to-end scenarios driving a full `ReconciliationPipeline` against an
//! in-memory `SqliteCategoryStore` with scripted `MockLlmClient` /
//! `MockPdfExtractClient` collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use reconcile_core::{
    ConcurrencyFabric, Config, Error, ExtractedOccupationCode, FlatRecord, LLMClient, Metrics,
    MockLlmClient, MockPdfExtractClient, ReconciliationPipeline, Result, RowFilter, RowStatus,
    SqliteCategoryStore, TaskClass,
};

fn build_pipeline(
    llm: impl LLMClient + 'static,
    pdf: MockPdfExtractClient,
) -> (Arc<ReconciliationPipeline>, Arc<SqliteCategoryStore>) {
    let store = Arc::new(SqliteCategoryStore::open_in_memory().unwrap());
    let fabric = ConcurrencyFabric::new(Config::default());
    let metrics = Arc::new(Metrics::new());
    let pipeline = ReconciliationPipeline::new(store.clone(), Arc::new(llm), Arc::new(pdf), fabric, metrics);
    (pipeline, store)
}

fn occupation(code: &str, name: &str) -> ExtractedOccupationCode {
    ExtractedOccupationCode {
        code: code.to_string(),
        name: name.to_string(),
        confidence: None,
        font: None,
    }
}

/// First-occurrence-wins dedup, standing in for the upstream tree-builder's
/// job (the core never re-deduplicates at ingest, spec §9).
fn dedupe_first_occurrence(records: Vec<FlatRecord>) -> Vec<FlatRecord> {
    let mut seen = std::collections::HashSet::new();
    records.into_iter().filter(|r| seen.insert(r.code.clone())).collect()
}

// --- Scenario 1: single major, single detail, perfect match ------------

#[tokio::test]
async fn single_major_single_detail_perfect_match() {
    let llm = MockLlmClient::new(r#"{"items": [{"code": "1-01-01-01", "name": "X-alt"}]}"#);
    let pdf = MockPdfExtractClient::new(vec![occupation("1-01-01-01", "X-alt")]);
    let (pipeline, store) = build_pipeline(llm, pdf);
    let task_id = Uuid::new_v4();

    let records = vec![
        FlatRecord::new("1", "A"),
        FlatRecord::new("1-01", "B"),
        FlatRecord::new("1-01-01", "C"),
        FlatRecord::new("1-01-01-01", "X"),
    ];

    pipeline.run(task_id, records, CancellationToken::new()).await.unwrap();

    let rows = store.get_current(task_id, RowFilter::none()).await.unwrap();
    assert_eq!(rows.len(), 4);

    let detail = rows.iter().find(|r| r.code == "1-01-01-01").unwrap();
    assert_eq!(detail.status, RowStatus::Completed);
    assert!(matches!(detail.name.as_str(), "X" | "X-alt"));
    assert!(detail.llm_enhancements.as_deref().is_some_and(|s| !s.is_empty()));

    for other in rows.iter().filter(|r| r.code != "1-01-01-01") {
        assert!(matches!(other.status, RowStatus::ExcelParsed | RowStatus::PdfMerged));
    }
}

// --- Scenario 2: orphan detail, no middle -------------------------------

#[tokio::test]
async fn orphan_detail_with_no_middle_ancestor() {
    let llm = MockLlmClient::new(r#"{"items": [{"name": "Orphan"}]}"#);
    let pdf = MockPdfExtractClient::new(vec![]);
    let (pipeline, store) = build_pipeline(llm, pdf);
    let task_id = Uuid::new_v4();

    let records = vec![FlatRecord::new("1", ""), FlatRecord::new("1-01-01", "Orphan")];

    pipeline.run(task_id, records, CancellationToken::new()).await.unwrap();

    let rows = store.get_current(task_id, RowFilter::none()).await.unwrap();
    assert_eq!(rows.len(), 2);
    let orphan = rows.iter().find(|r| r.code == "1-01-01").unwrap();
    assert_eq!(orphan.parent_code, "1-01");
}

// --- Scenario 3: duplicate code -----------------------------------------

#[tokio::test]
async fn duplicate_code_first_occurrence_wins_upstream() {
    let llm = MockLlmClient::new(r#"{"items": [{"name": "First"}]}"#);
    let pdf = MockPdfExtractClient::new(vec![]);
    let (pipeline, store) = build_pipeline(llm, pdf);
    let task_id = Uuid::new_v4();

    let raw = vec![FlatRecord::new("2", "First"), FlatRecord::new("2", "Second")];
    let deduped = dedupe_first_occurrence(raw);
    assert_eq!(deduped.len(), 1);

    pipeline.run(task_id, deduped, CancellationToken::new()).await.unwrap();

    let rows = store.get_current(task_id, RowFilter::none()).await.unwrap();
    let matching: Vec<_> = rows.iter().filter(|r| r.code == "2").collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].name, "First");
}

// --- Scenario 4: stage-2 LLM total failure ------------------------------

#[tokio::test]
async fn stage2_total_failure_fails_pipeline_but_keeps_stage1_rows() {
    let llm = MockLlmClient::new("unused");
    llm.push_response(Err(Error::transient_remote("mock", "group 1 fails")));
    llm.push_response(Err(Error::transient_remote("mock", "group 2 fails")));
    llm.push_response(Err(Error::transient_remote("mock", "group 3 fails")));

    let pdf = MockPdfExtractClient::new(vec![
        occupation("1-01", "A"),
        occupation("2-01", "B"),
        occupation("3-01", "C"),
    ]);
    let (pipeline, store) = build_pipeline(llm, pdf);
    let task_id = Uuid::new_v4();

    let records = vec![
        FlatRecord::new("1-01", "A"),
        FlatRecord::new("2-01", "B"),
        FlatRecord::new("3-01", "C"),
    ];

    let result = pipeline.run(task_id, records, CancellationToken::new()).await;
    assert!(result.is_err());

    let rows = store.get_current(task_id, RowFilter::none()).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.status == RowStatus::ExcelParsed));

    let status = store.task_status(task_id).await.unwrap();
    assert_eq!(status.as_deref(), Some("failed"));
}

// --- Scenario 5: stage-4 mixed failure ----------------------------------

struct FlakyLlmClient {
    fail_marker: String,
}

fn rule_name_from_prompt(prompt: &str) -> String {
    let needle = "ruleName=\"";
    let start = prompt.find(needle).expect("prompt carries ruleName") + needle.len();
    let rest = &prompt[start..];
    let end = rest.find('"').expect("ruleName is quoted");
    rest[..end].to_string()
}

#[async_trait]
impl LLMClient for FlakyLlmClient {
    async fn call(&self, _task_class: TaskClass, prompt: &str, _cancel: &CancellationToken) -> Result<String> {
        if prompt.contains(&self.fail_marker) {
            return Err(Error::permanent_remote("test", "scripted failure"));
        }
        let name = rule_name_from_prompt(prompt);
        Ok(format!(r#"{{"items": [{{"name": "{name}"}}]}}"#))
    }
}

#[tokio::test]
async fn stage4_batch_with_four_of_ten_failures_still_commits_all_ten() {
    let llm = FlakyLlmClient {
        fail_marker: "FAIL_MARKER".to_string(),
    };
    let pdf = MockPdfExtractClient::new(vec![]);
    let (pipeline, store) = build_pipeline(llm, pdf);
    let task_id = Uuid::new_v4();

    // 50 rows in 5 batches of 10 (stage4's fixed batch size); batch 2
    // (codes "1-11".."1-20") has exactly 4 rows named with the fail marker.
    let fail_codes = ["1-11", "1-12", "1-13", "1-14"];
    let records: Vec<FlatRecord> = (1..=50)
        .map(|n| {
            let code = format!("1-{n:02}");
            if fail_codes.contains(&code.as_str()) {
                FlatRecord::new(code, "FAIL_MARKER")
            } else {
                FlatRecord::new(code.clone(), format!("Row-{code}"))
            }
        })
        .collect();

    pipeline.run(task_id, records, CancellationToken::new()).await.unwrap();

    let rows = store.get_current(task_id, RowFilter::none()).await.unwrap();
    assert_eq!(rows.len(), 50);
    assert!(rows.iter().all(|r| r.status == RowStatus::Completed));

    for code in fail_codes {
        let row = rows.iter().find(|r| r.code == code).unwrap();
        assert_eq!(row.name, "FAIL_MARKER", "defaulted row keeps the rule name");
        assert!(row.llm_enhancements.as_deref().is_some_and(|s| s.contains("default")));
    }

    let status = store.task_status(task_id).await.unwrap();
    assert_eq!(status.as_deref(), Some("completed"));
}

// --- Scenario 6: re-ingest with version bump ----------------------------

#[tokio::test]
async fn reingest_bumps_version_and_lists_both_batches() {
    let llm = MockLlmClient::new(r#"{"items": [{"name": "generic"}]}"#);
    let pdf = MockPdfExtractClient::new(vec![]);
    let (pipeline, store) = build_pipeline(llm, pdf);
    let task_id = Uuid::new_v4();

    pipeline
        .run(task_id, vec![FlatRecord::new("1", "A")], CancellationToken::new())
        .await
        .unwrap();

    pipeline
        .run(task_id, vec![FlatRecord::new("1", "A-v2")], CancellationToken::new())
        .await
        .unwrap();

    let history = store.version_history(task_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_current);
    assert!(!history[1].is_current);

    let current = store.get_current(task_id, RowFilter::none()).await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].name, "generic");
}
