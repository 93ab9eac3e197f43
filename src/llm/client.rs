//! LLM Client: a synchronous-looking `call(taskClass, prompt) -> String`
//! facade over the subservice's submit/poll/result RPC triad.
//!
//! The HTTP shape and retry/backoff idiom are grounded in the teacher's
//! `build_http_client` (proxy-misconfiguration fallback) and its per-provider
//! retry handling; the JSON extraction cascade generalizes the idea of a
//! markdown-fence strip into the spec's full five-step recovery policy.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client as HttpClient;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::fabric::TaskClass;

use super::types::{PollOutcome, PollResponse, SubmitRequest, SubmitResponse};

/// Exponential backoff with a 30s cap and a bounded retry count.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Polling cadence and per-attempt timeout.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub poll_interval: Duration,
    pub attempt_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

/// Synchronous-looking facade over the subservice's three endpoints.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn call(&self, task_class: TaskClass, prompt: &str, cancel: &CancellationToken) -> Result<String>;
}

pub struct HttpLlmClient {
    http: HttpClient,
    base_url: String,
    retry: RetryConfig,
    poll: PollConfig,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = build_http_client()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    async fn call_once(&self, task_class: TaskClass, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let submit: SubmitResponse = tokio::select! {
            res = self.submit(task_class, prompt) => res?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let deadline = tokio::time::Instant::now() + self.poll.attempt_timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::transient_remote(
                    "GET /api/v1/tasks/{id}",
                    "polling timed out",
                ));
            }

            let poll: PollResponse = tokio::select! {
                res = self.poll_once(&submit.task_id) => res?,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };

            match poll.outcome() {
                PollOutcome::Completed => {
                    return poll.result_as_string().ok_or_else(|| {
                        Error::permanent_remote("GET /api/v1/tasks/{id}", "completed with no result")
                    });
                }
                PollOutcome::Failed(message) => {
                    return Err(Error::transient_remote("GET /api/v1/tasks/{id}", message));
                }
                PollOutcome::Cancelled => return Err(Error::Cancelled),
                PollOutcome::Pending => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll.poll_interval) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
            }
        }
    }

    async fn submit(&self, task_class: TaskClass, prompt: &str) -> Result<SubmitResponse> {
        let body = SubmitRequest {
            task_type: task_class.to_string(),
            prompt: prompt.to_string(),
            model: None,
            priority: None,
        };

        let response = self
            .http
            .post(format!("{}/api/v1/tasks", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("POST /api/v1/tasks", &e))?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<SubmitResponse>()
                .await
                .map_err(|e| Error::permanent_remote("POST /api/v1/tasks", e.to_string()))
        } else {
            Err(classify_http_status("POST /api/v1/tasks", status.as_u16()))
        }
    }

    async fn poll_once(&self, task_id: &str) -> Result<PollResponse> {
        let response = self
            .http
            .get(format!("{}/api/v1/tasks/{}", self.base_url, task_id))
            .send()
            .await
            .map_err(|e| classify_transport_error("GET /api/v1/tasks/{id}", &e))?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<PollResponse>()
                .await
                .map_err(|e| Error::permanent_remote("GET /api/v1/tasks/{id}", e.to_string()))
        } else {
            Err(classify_http_status("GET /api/v1/tasks/{id}", status.as_u16()))
        }
    }
}

#[async_trait]
impl LLMClient for HttpLlmClient {
    async fn call(&self, task_class: TaskClass, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(task_class, prompt, cancel).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(%task_class, attempt, ?delay, error = %e, "retrying transient LLM error");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn classify_transport_error(endpoint: &str, e: &reqwest::Error) -> Error {
    let _ = e.is_timeout() || e.is_connect();
    Error::transient_remote(endpoint, e.to_string())
}

fn classify_http_status(endpoint: &str, status: u16) -> Error {
    if status == 429 || (500..600).contains(&status) {
        Error::transient_remote(endpoint, format!("HTTP {status}"))
    } else {
        Error::permanent_remote(endpoint, format!("HTTP {status}"))
    }
}

/// Build the reqwest client, falling back past any ambient proxy
/// misconfiguration rather than panicking on it.
fn build_http_client() -> Result<HttpClient> {
    match HttpClient::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(305))
        .build()
    {
        Ok(client) => Ok(client),
        Err(_) => HttpClient::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(305))
            .no_proxy()
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}"))),
    }
}

// --- JSON extraction policy -------------------------------------------

static FENCE_RE_SRC: &str = r"```(?:json)?\s*([\s\S]*?)```";

/// Apply the five-step JSON extraction policy to a raw LLM response,
/// returning the extracted item objects. The client never invents data: if
/// every step fails this returns `PermanentRemoteError`.
pub fn extract_json_items(raw: &str) -> Result<Vec<Value>> {
    extract_json_items_inner(raw, true)
}

fn extract_json_items_inner(raw: &str, allow_fence_strip: bool) -> Result<Vec<Value>> {
    let trimmed = raw.trim();

    // Step 1: object with an "items" array.
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        if let Some(Value::Array(items)) = map.get("items") {
            return Ok(items.clone());
        }
    }

    // Step 2: raw array of objects.
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(items);
    }

    // Step 3: JSON-encoded string containing either of the above (double encoding).
    if let Ok(Value::String(inner)) = serde_json::from_str::<Value>(trimmed) {
        if let Ok(items) = extract_json_items_inner(&inner, allow_fence_strip) {
            return Ok(items);
        }
    }

    // Step 4: strip Markdown code fences, retry steps 1-3.
    if allow_fence_strip {
        if let Some(stripped) = strip_markdown_fence(trimmed) {
            if let Ok(items) = extract_json_items_inner(&stripped, false) {
                return Ok(items);
            }
        }
    }

    // Step 5: line-wise partial parse.
    let partial: Vec<Value> = trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .collect();
    if !partial.is_empty() {
        return Ok(partial);
    }

    Err(Error::permanent_remote(
        "LLM response",
        "no extractable JSON content after all five recovery steps",
    ))
}

fn strip_markdown_fence(text: &str) -> Option<String> {
    let re = Regex::new(FENCE_RE_SRC).ok()?;
    re.captures(text).map(|c| c[1].trim().to_string())
}

/// A scripted in-memory `LLMClient` for Batch Processor / Pipeline unit
/// tests.
pub struct MockLlmClient {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String>>>,
    default_response: String,
}

impl MockLlmClient {
    pub fn new(default_response: impl Into<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            default_response: default_response.into(),
        }
    }

    pub fn push_response(&self, response: Result<String>) {
        self.responses.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl LLMClient for MockLlmClient {
    async fn call(&self, _task_class: TaskClass, _prompt: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => Ok(self.default_response.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step1_parses_object_with_items() {
        let raw = r#"{"items": [{"code": "1", "name": "A"}]}"#;
        let items = extract_json_items(raw).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn step2_parses_raw_array() {
        let raw = r#"[{"code": "1"}, {"code": "2"}]"#;
        let items = extract_json_items(raw).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn step3_parses_double_encoded_string() {
        let inner = r#"{"items": [{"code": "1"}]}"#;
        let raw = serde_json::to_string(&Value::String(inner.to_string())).unwrap();
        let items = extract_json_items(&raw).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn step4_strips_markdown_fence() {
        let raw = "```json\n{\"items\": [{\"code\": \"1\"}]}\n```";
        let items = extract_json_items(raw).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn step5_line_wise_partial_parse() {
        let raw = "{\"code\": \"1\"}\n{\"code\": \"2\"}\nnot json at all\n";
        let items = extract_json_items(raw).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn all_steps_failing_is_permanent_error() {
        let raw = "the model apologized instead of answering";
        let result = extract_json_items(raw);
        assert!(matches!(result, Err(Error::PermanentRemote { .. })));
    }

    #[test]
    fn retry_backoff_is_capped() {
        let retry = RetryConfig::default();
        assert!(retry.delay_for_attempt(10) <= retry.max_delay);
    }

    #[tokio::test]
    async fn mock_client_returns_scripted_responses_in_order() {
        let mock = MockLlmClient::new("default");
        mock.push_response(Ok("first".to_string()));
        mock.push_response(Err(Error::transient_remote("test", "boom")));

        let cancel = CancellationToken::new();
        assert_eq!(
            mock.call(TaskClass::DataCleaning, "p", &cancel).await.unwrap(),
            "first"
        );
        assert!(mock.call(TaskClass::DataCleaning, "p", &cancel).await.is_err());
        assert_eq!(
            mock.call(TaskClass::DataCleaning, "p", &cancel).await.unwrap(),
            "default"
        );
    }
}
