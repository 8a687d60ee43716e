//! Provider gateway for chat completions.

pub mod error;
pub mod openai;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use openai::ChatProvider;
use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ErrorKind, ProviderError};
pub use openai::{AdapterConfig, AuthStyle, OpenAiAdapter};
pub use pricing::*;
pub use types::*;
pub use usage::{CollectingUsageSink, NoopUsageSink, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Caller-level retry policy for transient provider errors.
///
/// The default performs no retries: transient failures surface to the
/// caller, which decides whether to rerun.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait, P: ChatProvider = OpenAiAdapter> {
    provider: P,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait, P: ChatProvider> ChatGateway for ProviderGateway<U, P> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U, OpenAiAdapter> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let provider = OpenAiAdapter::from_env()?;
        Ok(Self {
            provider,
            usage_sink,
            config: GatewayConfig::default(),
        })
    }
}

impl<U: UsageSinkTrait, P: ChatProvider> ProviderGateway<U, P> {
    pub fn with_config(provider: P, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, &resp, CallStatus::Success, None, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    let request_id = err.request_id().map(str::to_string);
                    self.record_usage(
                        &req,
                        &ChatResponse::empty(),
                        CallStatus::Error,
                        Some(code),
                        request_id,
                    )
                    .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = match &err {
                        ProviderError::RateLimited { retry_after, .. } => {
                            (*retry_after).max(backoff_delay(self.config.retry_base_delay, attempt))
                        }
                        _ => backoff_delay(self.config.retry_base_delay, attempt),
                    };
                    tracing::debug!(
                        model = %req.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying transient provider error"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider(self.provider.name(), "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        status: CallStatus,
        error_code: Option<String>,
        request_id: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            self.provider.name(),
            "chat/completions",
            req.model.clone(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens, resp.reasoning_tokens)
        .cost(resp.cost_picos())
        .run(req.attribution.run_id)
        .latency(resp.latency.as_millis() as u64)
        .request_id(request_id);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait::async_trait]
    impl ChatProvider for FlakyProvider {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ProviderError::provider("test", "overloaded", true));
            }
            let mut resp = ChatResponse::empty();
            resp.content = "ok".into();
            resp.finish_reason = FinishReason::Stop;
            Ok(resp)
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("gpt-4o", vec![Message::user("hi")], Attribution::new("test"))
    }

    #[test]
    fn test_backoff_delay_caps_exponent() {
        let base = Duration::from_millis(10);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(10));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(80));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(320));
    }

    #[tokio::test]
    async fn test_default_policy_does_not_retry() {
        let provider = FlakyProvider {
            calls: AtomicUsize::new(0),
            failures: 1,
        };
        let gateway =
            ProviderGateway::with_config(provider, Arc::new(NoopUsageSink), GatewayConfig::default());
        let err = gateway.chat(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(gateway.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configured_retries_recover() {
        let provider = FlakyProvider {
            calls: AtomicUsize::new(0),
            failures: 2,
        };
        let config = GatewayConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        };
        let sink = Arc::new(CollectingUsageSink::new());
        let gateway = ProviderGateway::with_config(provider, sink.clone(), config);
        let resp = gateway.chat(request()).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(gateway.provider.calls.load(Ordering::SeqCst), 3);

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().filter(|r| r.status == CallStatus::Error).count(),
            2
        );
        assert_eq!(records[0].error_code.as_deref(), Some("provider_error"));
        assert_eq!(records[2].caller, "test");
    }
}
