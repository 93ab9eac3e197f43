//! PDF-extract collaborator: an out-of-scope subservice represented as a
//! single awaitable `extract(task_id)` call, the same "synchronous-looking
//! facade over async RPC" shape the LLM Client uses for its own triad.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

/// One `(code, name)` tuple reported by the PDF extractor, with optional
/// OCR-confidence/font metadata the Batch Processor drops before prompting
/// the LLM.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedOccupationCode {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub font: Option<String>,
}

#[async_trait]
pub trait PdfExtractClient: Send + Sync {
    async fn extract(&self, task_id: Uuid) -> Result<Vec<ExtractedOccupationCode>>;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    #[allow(dead_code)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlocksResponse {
    occupation_codes: Vec<ExtractedOccupationCode>,
}

pub struct HttpPdfExtractClient {
    http: HttpClient,
    base_url: String,
    poll_interval: Duration,
    overall_timeout: Duration,
}

impl HttpPdfExtractClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::config(format!("failed to build PDF extract HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            poll_interval: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(180),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    async fn poll_status(&self, task_id: Uuid) -> StatusResponse {
        let url = format!("{}/status/{}", self.base_url, task_id);
        match self.http.get(&url).send().await {
            // 5xx is treated as "still processing" per the collaborator contract.
            Ok(response) if response.status().is_server_error() => StatusResponse {
                status: "processing".to_string(),
                error: None,
            },
            Ok(response) => response.json::<StatusResponse>().await.unwrap_or(StatusResponse {
                status: "processing".to_string(),
                error: None,
            }),
            Err(_) => StatusResponse {
                status: "processing".to_string(),
                error: None,
            },
        }
    }

    async fn fetch_blocks(&self, task_id: Uuid) -> Result<Vec<ExtractedOccupationCode>> {
        let url = format!("{}/blocks/{}/occupation-codes", self.base_url, task_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::transient_remote("GET /blocks/{task_id}/occupation-codes", e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::permanent_remote(
                "GET /blocks/{task_id}/occupation-codes",
                format!("HTTP {}", response.status()),
            ));
        }

        let parsed: BlocksResponse = response
            .json()
            .await
            .map_err(|e| Error::permanent_remote("GET /blocks/{task_id}/occupation-codes", e.to_string()))?;
        Ok(parsed.occupation_codes)
    }
}

#[async_trait]
impl PdfExtractClient for HttpPdfExtractClient {
    async fn extract(&self, task_id: Uuid) -> Result<Vec<ExtractedOccupationCode>> {
        let deadline = tokio::time::Instant::now() + self.overall_timeout;
        loop {
            let status = self.poll_status(task_id).await;
            match status.status.as_str() {
                "completed" => return self.fetch_blocks(task_id).await,
                "failed" => {
                    return Err(Error::permanent_remote(
                        "GET /status/{task_id}",
                        status.error.unwrap_or_else(|| "pdf extraction failed".to_string()),
                    ))
                }
                _ => {
                    if tokio::time::Instant::now() >= deadline {
                        // Overall timeout elapsed: proceed opportunistically per spec §5.
                        warn!(%task_id, "pdf extract poll timed out, fetching blocks opportunistically");
                        return self.fetch_blocks(task_id).await;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

/// A scripted in-memory `PdfExtractClient` for Pipeline/Batch Processor tests.
pub struct MockPdfExtractClient {
    codes: std::sync::Mutex<Vec<ExtractedOccupationCode>>,
    fail: bool,
}

impl MockPdfExtractClient {
    pub fn new(codes: Vec<ExtractedOccupationCode>) -> Self {
        Self {
            codes: std::sync::Mutex::new(codes),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            codes: std::sync::Mutex::new(Vec::new()),
            fail: true,
        }
    }
}

#[async_trait]
impl PdfExtractClient for MockPdfExtractClient {
    async fn extract(&self, _task_id: Uuid) -> Result<Vec<ExtractedOccupationCode>> {
        if self.fail {
            return Err(Error::transient_remote("mock pdf extract", "scripted failure"));
        }
        Ok(self.codes.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_client_returns_scripted_codes() {
        let client = MockPdfExtractClient::new(vec![ExtractedOccupationCode {
            code: "1-01".to_string(),
            name: "B-alt".to_string(),
            confidence: Some(0.9),
            font: None,
        }]);
        let result = client.extract(Uuid::new_v4()).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].code, "1-01");
    }

    #[tokio::test]
    async fn mock_client_reports_scripted_failure() {
        let client = MockPdfExtractClient::failing();
        let result = client.extract(Uuid::new_v4()).await;
        assert!(result.is_err());
    }
}
