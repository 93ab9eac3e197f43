//! Wire types for the LLM subservice's submit/poll/result RPC triad.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /api/v1/tasks` request body.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// `POST /api/v1/tasks` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
}

/// `GET /api/v1/tasks/{id}` response body. `result` may arrive as a raw
/// string or any JSON-serializable value; the Client normalizes it to a
/// string before returning it to callers.
#[derive(Debug, Clone, Deserialize)]
pub struct PollResponse {
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
}

/// Normalized poll outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Completed,
    Failed(String),
    Cancelled,
}

impl PollResponse {
    pub fn outcome(&self) -> PollOutcome {
        match self.status.as_str() {
            "completed" | "success" => PollOutcome::Completed,
            "failed" | "error" => {
                PollOutcome::Failed(self.error.clone().unwrap_or_else(|| "unknown error".to_string()))
            }
            "cancelled" => PollOutcome::Cancelled,
            // "pending" | "queued" | "processing" | anything else unrecognized
            _ => PollOutcome::Pending,
        }
    }

    /// Normalize `result` (raw string or JSON value) to a plain string.
    pub fn result_as_string(&self) -> Option<String> {
        match &self.result {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        }
    }
}
