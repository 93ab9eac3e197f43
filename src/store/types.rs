//! Category Store entity types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Categorical depth derived from a code's dash count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Major,
    Middle,
    Small,
    Detail,
}

impl Level {
    /// `0 -> major, 1 -> middle, 2 -> small, 3 -> detail` dash counts, per
    /// spec §3's invariant. Codes with more than three dashes are treated
    /// as `Detail` (the deepest level the taxonomy names).
    pub fn from_code(code: &str) -> Self {
        match code.matches('-').count() {
            0 => Level::Major,
            1 => Level::Middle,
            2 => Level::Small,
            _ => Level::Detail,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Major => "major",
            Level::Middle => "middle",
            Level::Small => "small",
            Level::Detail => "detail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "major" => Some(Level::Major),
            "middle" => Some(Level::Middle),
            "small" => Some(Level::Small),
            "detail" => Some(Level::Detail),
            _ => None,
        }
    }
}

/// Row processing status, advancing monotonically through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    ExcelParsed,
    PdfMerged,
    LlmEnhanced,
    Completed,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::ExcelParsed => "excel_parsed",
            RowStatus::PdfMerged => "pdf_merged",
            RowStatus::LlmEnhanced => "llm_enhanced",
            RowStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "excel_parsed" => Some(RowStatus::ExcelParsed),
            "pdf_merged" => Some(RowStatus::PdfMerged),
            "llm_enhanced" => Some(RowStatus::LlmEnhanced),
            "completed" => Some(RowStatus::Completed),
            _ => None,
        }
    }
}

/// Where a row's current content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Excel,
    Pdf,
    Merged,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Excel => "excel",
            DataSource::Pdf => "pdf",
            DataSource::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "excel" => Some(DataSource::Excel),
            "pdf" => Some(DataSource::Pdf),
            "merged" => Some(DataSource::Merged),
            _ => None,
        }
    }
}

/// Derive a row's parent code by truncating at the last dash; the root
/// (no dash) has an empty parent code.
pub fn parent_code_of(code: &str) -> String {
    match code.rfind('-') {
        Some(idx) => code[..idx].to_string(),
        None => String::new(),
    }
}

/// A versioned hierarchical classification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRow {
    pub task_id: Uuid,
    pub code: String,
    pub name: String,
    pub level: Level,
    pub parent_code: String,
    pub status: RowStatus,
    pub data_source: DataSource,
    pub pdf_info: Option<String>,
    pub llm_enhancements: Option<String>,
    pub upload_batch_id: Uuid,
    pub upload_timestamp: DateTime<Utc>,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CategoryRow {
    /// Build a freshly-ingested row for Stage 1: `status=excel_parsed`,
    /// `dataSource=excel`, `isCurrent=true`, `parentCode` derived from `code`.
    pub fn new_excel(
        task_id: Uuid,
        code: impl Into<String>,
        name: impl Into<String>,
        upload_batch_id: Uuid,
    ) -> Self {
        let code = code.into();
        let parent_code = parent_code_of(&code);
        let level = Level::from_code(&code);
        let now = Utc::now();
        Self {
            task_id,
            parent_code,
            level,
            code,
            name: name.into(),
            status: RowStatus::ExcelParsed,
            data_source: DataSource::Excel,
            pdf_info: None,
            llm_enhancements: None,
            upload_batch_id,
            upload_timestamp: now,
            is_current: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A sparse field patch applied by `UpdateByCode`/`BatchUpdateByCode`. Only
/// `Some` fields are written; the row is otherwise untouched.
#[derive(Debug, Clone, Default)]
pub struct RowPatch {
    pub name: Option<String>,
    pub status: Option<RowStatus>,
    pub data_source: Option<DataSource>,
    pub pdf_info: Option<String>,
    pub llm_enhancements: Option<String>,
}

/// One `(code, patch)` entry in a `BatchUpdateByCode` call.
#[derive(Debug, Clone)]
pub struct CodePatch {
    pub code: String,
    pub patch: RowPatch,
}

/// Optional status filter for `GetCurrent`.
#[derive(Debug, Clone, Copy)]
pub struct RowFilter {
    pub status: Option<RowStatus>,
}

impl RowFilter {
    pub fn none() -> Self {
        Self { status: None }
    }

    pub fn with_status(status: RowStatus) -> Self {
        Self { status: Some(status) }
    }
}

/// One entry in `VersionHistory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionHistoryEntry {
    pub batch_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub row_count: usize,
    pub is_current: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_from_code_matches_dash_count() {
        assert_eq!(Level::from_code("1"), Level::Major);
        assert_eq!(Level::from_code("1-01"), Level::Middle);
        assert_eq!(Level::from_code("1-01-01"), Level::Small);
        assert_eq!(Level::from_code("1-01-01-01"), Level::Detail);
        assert_eq!(Level::from_code("1-01-01-01-01"), Level::Detail);
    }

    #[test]
    fn parent_code_strips_last_dash_segment() {
        assert_eq!(parent_code_of("1-01-01-01"), "1-01-01");
        assert_eq!(parent_code_of("1"), "");
    }

    #[test]
    fn orphan_detail_parent_need_not_exist() {
        // Stage 1 does not validate that the parent row exists (scenario 2).
        assert_eq!(parent_code_of("1-01-01"), "1-01");
    }
}
