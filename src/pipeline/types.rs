//! Pipeline-facing entity types: the upstream input shape and the
//! per-row disambiguation object Stage 4 builds.

use serde::{Deserialize, Serialize};

/// One row of the upstream-parsed spreadsheet, already hierarchy-built
/// before it reaches the Pipeline. `level`, when present, is informational
/// only — the Store derives its own from the code's dash count.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlatRecord {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub level: Option<String>,
}

impl FlatRecord {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            level: None,
        }
    }
}

/// Stage 4's row-level disambiguation object: the rule name, the
/// PDF-extracted name if one matched during Stage 3, and the row's parent
/// hierarchy for context.
#[derive(Debug, Clone)]
pub struct Choice {
    pub code: String,
    pub rule_name: String,
    pub pdf_name: Option<String>,
    pub parent_hierarchy: String,
}

/// The JSON payload persisted as a row's `llmEnhancements`: which name won
/// and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enhancement {
    pub name: String,
    pub source: String,
}
