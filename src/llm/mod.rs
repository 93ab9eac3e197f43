//! LLM subservice client: submit/poll/result RPC triad, JSON extraction
//! policy, and the retry/backoff wrapper the Batch Processor calls through.

mod client;
mod types;

pub use client::{
    extract_json_items, HttpLlmClient, LLMClient, MockLlmClient, PollConfig, RetryConfig,
};
pub use types::{PollOutcome, PollResponse, SubmitRequest, SubmitResponse};
