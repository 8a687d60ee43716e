//! Per-call usage records.
//!
//! The gateway reports every provider call, failed ones included, to a
//! [`UsageSink`]. The binary logs them through [`TracingUsageSink`]; tests
//! collect them with [`CollectingUsageSink`].

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// One provider call as seen by the gateway.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// "openai" or "azure".
    pub provider: &'static str,
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub reasoning_tokens: u32,
    pub cost_picos: i64,
    pub run_id: Option<Uuid>,
    pub latency_ms: u64,
    pub status: CallStatus,
    /// Short error code, set when `status` is `Error`.
    pub error_code: Option<String>,
    /// Code path that issued the call.
    pub caller: &'static str,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            reasoning_tokens: 0,
            cost_picos: 0,
            run_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32, reasoning: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self.reasoning_tokens = reasoning;
        self
    }

    pub fn cost(mut self, picos: i64) -> Self {
        self.cost_picos = picos;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    /// Mark the call failed with a short code such as `rate_limited`.
    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }

    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }
}

/// Receiver of usage records. Recording never fails the call it describes.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits one `info` event per call under the `rai_draft::usage` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::info!(
            target: "rai_draft::usage",
            provider = record.provider,
            endpoint = record.endpoint,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            reasoning_tokens = record.reasoning_tokens,
            cost_picos = record.cost_picos,
            latency_ms = record.latency_ms,
            status = record.status.as_str(),
            error_code = record.error_code.as_deref().unwrap_or(""),
            request_id = record.request_id.as_deref().unwrap_or(""),
            caller = record.caller,
            "provider call"
        );
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct CollectingUsageSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

impl CollectingUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProviderCallRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Summed cost of successful calls.
    pub fn total_cost_picos(&self) -> i64 {
        self.records()
            .iter()
            .filter(|r| r.status == CallStatus::Success)
            .map(|r| r.cost_picos)
            .sum()
    }
}

#[async_trait]
impl UsageSink for CollectingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
