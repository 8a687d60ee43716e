//! Adapter for OpenAI-compatible chat completion endpoints.
//!
//! Works against api.openai.com, Azure OpenAI deployments and any proxy that
//! speaks the same `/chat/completions` wire format.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::{chat_cost, TokenParam};
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for chat completion providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Short provider name used in usage records.
    fn name(&self) -> &'static str {
        "openai"
    }
}

// =============================================================================
// OPENAI-COMPATIBLE ADAPTER
// =============================================================================

/// Maximum allowed response content length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// How the API key is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`.
    #[default]
    Bearer,
    /// `api-key: <key>`, as Azure OpenAI expects.
    ApiKeyHeader,
}

/// Connection settings for [`OpenAiAdapter`].
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    pub auth_style: AuthStyle,
    /// Appended as `?api-version=` when set.
    pub api_version: Option<String>,
}

impl AdapterConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
            auth_style: AuthStyle::Bearer,
            api_version: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn azure(mut self, api_version: impl Into<String>) -> Self {
        self.auth_style = AuthStyle::ApiKeyHeader;
        self.api_version = Some(api_version.into());
        self
    }
}

/// OpenAI-compatible API adapter for chat completions.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    chat_url: String,
    provider: &'static str,
}

impl OpenAiAdapter {
    /// Create from API key against the public endpoint.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(AdapterConfig::new(api_key))
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("RAIDRAFT_API_KEY")
            .map_err(|_| ProviderError::config("RAIDRAFT_API_KEY not set"))?;

        let base_url =
            std::env::var("RAIDRAFT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("RAIDRAFT_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        let mut config = AdapterConfig::new(api_key)
            .base_url(base_url)
            .timeout(timeout);
        if let Ok(version) = std::env::var("RAIDRAFT_AZURE_API_VERSION") {
            config = config.azure(version);
        }

        Self::with_config(config)
    }

    /// Create with custom configuration.
    pub fn with_config(config: AdapterConfig) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        match config.auth_style {
            AuthStyle::Bearer => {
                let auth_value = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                    .map_err(|_| ProviderError::config("Invalid API key format"))?;
                headers.insert(AUTHORIZATION, auth_value);
            }
            AuthStyle::ApiKeyHeader => {
                let key_value = HeaderValue::from_str(&config.api_key)
                    .map_err(|_| ProviderError::config("Invalid API key format"))?;
                headers.insert("api-key", key_value);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        let base = config.base_url.trim_end_matches('/');
        let chat_url = match &config.api_version {
            Some(version) => format!("{base}/chat/completions?api-version={version}"),
            None => format!("{base}/chat/completions"),
        };
        let provider = match config.auth_style {
            AuthStyle::Bearer => "openai",
            AuthStyle::ApiKeyHeader => "azure",
        };

        Ok(Self {
            client,
            chat_url,
            provider,
        })
    }

    /// Extract request ID from response headers.
    fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .or_else(|| headers.get("apim-request-id"))
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// Check if message indicates a refusal.
    fn is_refusal(msg: &str) -> bool {
        let l = msg.trim_start().to_lowercase();
        let first_line = l.lines().next().unwrap_or("");

        const PREFIXES: &[&str] = &[
            "i cannot",
            "i can't",
            "i won't",
            "i will not",
            "i am unable to",
            "i'm unable to",
            "unable to comply",
            "unable to assist",
        ];

        PREFIXES.iter().any(|p| first_line.starts_with(p)) || l.contains("request was refused")
    }

    fn classify_error(
        &self,
        status: u16,
        error: Option<ApiError>,
        ctx: ErrorContext,
    ) -> ProviderError {
        let (message, code, param) = match error {
            Some(e) => (
                e.message.unwrap_or_default(),
                e.code.and_then(value_as_code),
                e.param,
            ),
            None => (format!("HTTP {status}"), None, None),
        };
        let ctx = match &code {
            Some(c) => ctx.with_code(c),
            None => ctx,
        };

        if matches!(code.as_deref(), Some("insufficient_quota" | "invalid_api_key"))
            || status == 401
            || status == 403
        {
            return ProviderError::auth(message, ctx);
        }

        if (status == 400 || status == 422) && is_unsupported_parameter(code.as_deref(), &message)
        {
            let param = param.or_else(|| param_from_message(&message));
            return ProviderError::ParameterUnsupported {
                param,
                message,
                context: Some(ctx),
            };
        }

        match status {
            429 => ProviderError::rate_limited(Duration::from_secs(60), ctx),
            s if s >= 500 => ProviderError::provider_with_context(self.provider, message, true, ctx),
            _ => ProviderError::InvalidRequest {
                message,
                context: Some(ctx),
            },
        }
    }
}

static QUOTED_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'([A-Za-z_][A-Za-z0-9_.]*)'").expect("Invalid quoted param regex"));

fn is_unsupported_parameter(code: Option<&str>, message: &str) -> bool {
    if matches!(code, Some("unsupported_parameter" | "unsupported_value")) {
        return true;
    }
    let l = message.to_lowercase();
    l.contains("unsupported parameter")
        || l.contains("unsupported value")
        || l.contains("not supported with this model")
        || l.contains("does not support")
}

/// Pull the first quoted parameter name out of a provider message, e.g.
/// `Unsupported parameter: 'max_tokens' is not supported with this model.`
fn param_from_message(message: &str) -> Option<String> {
    QUOTED_PARAM
        .captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn value_as_code(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl From<&Message> for ApiMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content.clone(),
        }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: Option<ToolFunction>,
}

#[derive(Deserialize)]
struct ToolFunction {
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Deserialize)]
struct CompletionTokensDetails {
    reasoning_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
    param: Option<String>,
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for OpenAiAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        // Validate input size
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();

        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();

        let messages: Vec<ApiMessage> = req.messages.iter().map(ApiMessage::from).collect();

        let (max_tokens, max_completion_tokens) = match req.token_param {
            TokenParam::MaxTokens => (req.max_tokens, None),
            TokenParam::MaxCompletionTokens => (None, req.max_tokens),
        };

        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &messages,
            temperature: req.temperature,
            top_p: req.top_p,
            presence_penalty: req.presence_penalty,
            frequency_penalty: req.frequency_penalty,
            max_tokens,
            max_completion_tokens,
            response_format: if req.json_mode {
                Some(ResponseFormat {
                    format_type: "json_object",
                })
            } else {
                None
            },
            reasoning_effort: req.reasoning_effort.map(|e| e.as_str()),
        };

        let mut response = self
            .client
            .post(&self.chat_url)
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    self.provider,
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let error = serde_json::from_str::<ChatApiResponse>(&body)
                .ok()
                .and_then(|parsed| parsed.error);
            return Err(self.classify_error(status.as_u16(), error, ctx));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider(self.provider, format!("Invalid JSON: {e}"), false)
        })?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            if Self::is_refusal(&message) {
                return Err(ProviderError::refused(message));
            }
            return Err(ProviderError::provider(self.provider, message, false));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                ProviderError::provider(self.provider, "No choices in response", false)
            })?;

        let mut content = match choice.message {
            Some(m) => {
                if let Some(refusal) = m.refusal.filter(|r| !r.trim().is_empty()) {
                    return Err(ProviderError::refused(refusal));
                }
                let content = m.content.unwrap_or_default();
                if !content.trim().is_empty() {
                    content
                } else {
                    // Some deployments return structured output as tool call
                    // arguments even when json_object was requested.
                    m.tool_calls
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|tc| tc.function.and_then(|f| f.arguments))
                        .find(|s| !s.trim().is_empty())
                        .unwrap_or_default()
                }
            }
            None => String::new(),
        };

        if content.len() > MAX_RESPONSE_LEN {
            let mut cut = MAX_RESPONSE_LEN;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
        }

        if Self::is_refusal(&content) {
            return Err(ProviderError::refused(content));
        }

        let usage = parsed.usage.ok_or_else(|| {
            ProviderError::provider(self.provider, "Missing usage in response", false)
        })?;

        let input_tokens = usage.prompt_tokens.unwrap_or(0);
        let completion_tokens = usage.completion_tokens.unwrap_or(0);
        let reasoning_tokens = usage
            .completion_tokens_details
            .and_then(|d| d.reasoning_tokens)
            .unwrap_or(0)
            .min(completion_tokens);
        // completion_tokens already includes hidden reasoning; split it so
        // visible + reasoning is the billed output.
        let output_tokens = completion_tokens - reasoning_tokens;

        let cost = chat_cost(&req.model, input_tokens, output_tokens, reasoning_tokens);

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            reasoning_tokens,
            input_cost_picos: cost.input_picos,
            output_cost_picos: cost.output_picos,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }

    fn name(&self) -> &'static str {
        self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_from_message() {
        assert_eq!(
            param_from_message(
                "Unsupported parameter: 'max_tokens' is not supported with this model."
            )
            .as_deref(),
            Some("max_tokens")
        );
        assert_eq!(
            param_from_message("Unsupported value: 'temperature' does not support 0.1").as_deref(),
            Some("temperature")
        );
        assert!(param_from_message("no quotes here").is_none());
    }

    #[test]
    fn test_unsupported_detection() {
        assert!(is_unsupported_parameter(Some("unsupported_value"), ""));
        assert!(is_unsupported_parameter(
            None,
            "Invalid parameter: 'response_format' is not supported with this model."
        ));
        assert!(!is_unsupported_parameter(None, "messages must not be empty"));
    }

    #[test]
    fn test_refusal_detection() {
        assert!(OpenAiAdapter::is_refusal("I can't help with that."));
        assert!(!OpenAiAdapter::is_refusal("{\"intendeduses\": []}"));
    }
}
