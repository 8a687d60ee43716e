//! Capability-aware model invocation with progressive parameter fallback.
//!
//! The invoker decides which request parameters a model may receive, checks
//! the completion cache, and on a provider rejection retries with strictly
//! fewer parameters. Transient and fatal provider errors are surfaced as-is:
//! retry policy belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::{
    CacheError, CachedCompletion, CompletionCache, CompletionSignature, SingleFlight,
};
use crate::compression::{compress_prompt, strip_markup, CompressionError};
use crate::gateway::{
    capabilities, Attribution, Capabilities, ChatGateway, ChatRequest, ChatResponse, ErrorKind,
    FinishReason, Message, ModelClass, ProviderError, ReasoningEffort,
};

/// Total tries per invocation, fallbacks included.
pub const MAX_ATTEMPTS: u32 = 3;

/// Shape of answer a step asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub system: String,
    /// User prompt; may carry compression markup.
    pub prompt: String,
    pub model: String,
    pub language: String,
    pub temperature: Option<f32>,
    pub output_mode: OutputMode,
    pub compress: bool,
    pub compression_rate: f32,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Output cap for standard models. Never sent to reasoning models.
    pub max_output_tokens: Option<u32>,
}

impl InvocationRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            model: model.into(),
            language: "English".into(),
            temperature: None,
            output_mode: OutputMode::Text,
            compress: false,
            compression_rate: crate::compression::DEFAULT_RATE,
            reasoning_effort: None,
            max_output_tokens: None,
        }
    }

    pub fn json(mut self) -> Self {
        self.output_mode = OutputMode::Json;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }
}

/// Run-wide invocation policy.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Skip cache lookups and overwrite existing entries.
    pub rebuild_cache: bool,
    /// Random pause on cache hits, drawn from `min..=max`.
    pub hit_delay: Option<(Duration, Duration)>,
    /// Model to re-issue on when an answer stops at the length limit.
    pub length_fallback_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationResult {
    pub answer: String,
    /// Model that produced the answer.
    pub model: String,
    pub prompt_tokens: u32,
    /// Visible completion tokens.
    pub completion_tokens: u32,
    pub reasoning_tokens: u32,
    pub input_cost_picos: i64,
    pub output_cost_picos: i64,
    /// Served from cache; costs are historical, not billed again.
    pub cached: bool,
    /// Provider calls made, fallbacks included. Zero on a cache hit.
    pub attempts: u32,
    /// Cache keys holding this answer.
    pub signatures: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("model {model} rejected request parameters after {attempts} attempts: {source}")]
    ParameterUnsupported {
        model: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },
    #[error("transient provider error: {0}")]
    Transient(#[source] ProviderError),
    #[error("provider error: {0}")]
    Fatal(#[source] ProviderError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),
}

impl InvokeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InvokeError::ParameterUnsupported { .. } => ErrorKind::ParameterUnsupported,
            InvokeError::Transient(_) => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }
}

// =============================================================================
// PARAMETER SET
// =============================================================================

/// Parameters actually sent on one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSet {
    pub temperature: Option<f32>,
    pub json_mode: bool,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl ParamSet {
    /// Full parameter set appropriate to the model's class.
    pub fn initial(req: &InvocationRequest, caps: &Capabilities) -> Self {
        let json_mode = req.output_mode == OutputMode::Json && caps.supports_json_mode;
        match caps.class {
            ModelClass::Standard => Self {
                temperature: req.temperature.filter(|_| caps.supports_sampling),
                json_mode,
                max_tokens: req.max_output_tokens.filter(|_| caps.supports_output_cap),
                reasoning_effort: None,
            },
            ModelClass::Reasoning => Self {
                temperature: None,
                json_mode,
                max_tokens: None,
                reasoning_effort: req.reasoning_effort.or(Some(ReasoningEffort::default())),
            },
        }
    }

    /// Stable rendering for cache signatures.
    pub fn canonical(&self) -> String {
        format!(
            "temperature={};json={};max_tokens={}",
            self.temperature
                .map(|t| format!("{t:.3}"))
                .unwrap_or_else(|| "-".into()),
            self.json_mode,
            self.max_tokens
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".into()),
        )
    }

    /// Drop one feature after a rejection. A rejection naming a parameter we
    /// sent removes that one; otherwise the ladder order applies: JSON mode,
    /// then the output cap, then reasoning effort, then sampling. Returns
    /// false when nothing is left to drop.
    pub fn strip(&mut self, rejected: Option<&str>) -> bool {
        if let Some(param) = rejected {
            let param = param.to_ascii_lowercase();
            match param.as_str() {
                "temperature" | "top_p" | "presence_penalty" | "frequency_penalty"
                    if self.temperature.is_some() =>
                {
                    self.temperature = None;
                    return true;
                }
                "response_format" | "json_mode" if self.json_mode => {
                    self.json_mode = false;
                    return true;
                }
                "max_tokens" | "max_completion_tokens" if self.max_tokens.is_some() => {
                    self.max_tokens = None;
                    return true;
                }
                "reasoning_effort" | "reasoning" if self.reasoning_effort.is_some() => {
                    self.reasoning_effort = None;
                    return true;
                }
                _ => {}
            }
        }

        if self.json_mode {
            self.json_mode = false;
        } else if self.max_tokens.is_some() {
            self.max_tokens = None;
        } else if self.reasoning_effort.is_some() {
            self.reasoning_effort = None;
        } else if self.temperature.is_some() {
            self.temperature = None;
        } else {
            return false;
        }
        true
    }

    fn to_request(
        &self,
        model: &str,
        system: &str,
        user: &str,
        caps: &Capabilities,
        attribution: Attribution,
    ) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if !system.trim().is_empty() {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(user));

        let mut req = ChatRequest::new(model, messages, attribution);
        req.temperature = self.temperature;
        req.json_mode = self.json_mode;
        req.reasoning_effort = self.reasoning_effort;
        if let Some(max) = self.max_tokens {
            req = req.max_tokens(max, caps.token_param);
        }
        req
    }
}

// =============================================================================
// INVOKER
// =============================================================================

#[derive(Clone)]
pub struct AdaptiveInvoker {
    gateway: Arc<dyn ChatGateway>,
    cache: Arc<dyn CompletionCache>,
    flights: Arc<SingleFlight>,
    options: InvokeOptions,
    run_id: Option<Uuid>,
}

impl AdaptiveInvoker {
    pub fn new(gateway: Arc<dyn ChatGateway>, cache: Arc<dyn CompletionCache>) -> Self {
        Self {
            gateway,
            cache,
            flights: SingleFlight::new(),
            options: InvokeOptions::default(),
            run_id: None,
        }
    }

    pub fn with_options(mut self, options: InvokeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Share a single-flight registry with other invokers over the same cache.
    pub fn with_flights(mut self, flights: Arc<SingleFlight>) -> Self {
        self.flights = flights;
        self
    }

    pub fn options(&self) -> &InvokeOptions {
        &self.options
    }

    /// Signature a request will be cached under.
    pub fn signature(&self, req: &InvocationRequest) -> CompletionSignature {
        let caps = capabilities(&req.model);
        let params = ParamSet::initial(req, &caps);
        signature_for(req, &req.model, &params)
    }

    pub async fn invoke(&self, req: &InvocationRequest) -> Result<InvocationResult, InvokeError> {
        let caps = capabilities(&req.model);
        let params = ParamSet::initial(req, &caps);
        let signature = signature_for(req, &req.model, &params);

        if !self.options.rebuild_cache {
            if let Some(hit) = self.cache.get(&signature).await? {
                return Ok(self.from_hit(hit, &signature).await);
            }
        }

        let _flight = self.flights.acquire(&signature.key_hash).await?;

        // Another task may have filled the entry while we waited.
        if !self.options.rebuild_cache {
            if let Some(hit) = self.cache.get(&signature).await? {
                return Ok(self.from_hit(hit, &signature).await);
            }
        }

        let system_prompt = prepare_prompt(req, &req.system)?;
        let user_prompt = prepare_prompt(req, &req.prompt)?;

        let (mut resp, mut attempts) = self
            .call_with_fallback(&req.model, &system_prompt, &user_prompt, params)
            .await?;
        let mut model = req.model.clone();
        let mut signatures = vec![signature.key_hash.clone()];
        let mut extra_signature = None;

        if resp.finish_reason == FinishReason::Length {
            if let Some(fallback) = self
                .options
                .length_fallback_model
                .as_deref()
                .filter(|m| *m != req.model)
            {
                tracing::warn!(
                    model = %req.model,
                    fallback = %fallback,
                    "answer hit the length limit; re-issuing on fallback model"
                );
                let fb_caps = capabilities(fallback);
                let fb_params = ParamSet::initial(req, &fb_caps);
                let fb_signature = signature_for(req, fallback, &fb_params);
                let (fb_resp, fb_attempts) = self
                    .call_with_fallback(fallback, &system_prompt, &user_prompt, fb_params)
                    .await?;
                resp = fb_resp;
                attempts += fb_attempts;
                model = fallback.to_string();
                signatures.push(fb_signature.key_hash.clone());
                extra_signature = Some(fb_signature);
            }
        }

        if resp.content.trim().is_empty() {
            return Err(InvokeError::Transient(ProviderError::provider(
                "invoker",
                format!("{model} returned an empty answer"),
                true,
            )));
        }

        let entry = CachedCompletion {
            model: model.clone(),
            language: req.language.clone(),
            input_cost_picos: resp.input_cost_picos,
            output_cost_picos: resp.output_cost_picos,
            prompt_tokens: resp.input_tokens,
            completion_tokens: resp.output_tokens,
            reasoning_tokens: resp.reasoning_tokens,
            answer: resp.content.clone(),
        };
        self.cache.put(&signature, &entry).await?;
        if let Some(extra) = &extra_signature {
            self.cache.put(extra, &entry).await?;
        }

        Ok(InvocationResult {
            answer: resp.content,
            model,
            prompt_tokens: resp.input_tokens,
            completion_tokens: resp.output_tokens,
            reasoning_tokens: resp.reasoning_tokens,
            input_cost_picos: resp.input_cost_picos,
            output_cost_picos: resp.output_cost_picos,
            cached: false,
            attempts,
            signatures,
        })
    }

    /// Drop cache entries, e.g. after their answer could not be used.
    pub async fn evict(&self, key_hashes: &[String]) -> Result<usize, InvokeError> {
        let mut removed = 0;
        for key in key_hashes {
            if self.cache.delete(key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "evicted cache entries");
        }
        Ok(removed)
    }

    async fn from_hit(&self, hit: CachedCompletion, signature: &CompletionSignature) -> InvocationResult {
        tracing::debug!(
            model = %hit.model,
            key = %signature.key_hash,
            "completion cache hit"
        );
        if let Some(delay) = self.hit_delay() {
            tokio::time::sleep(delay).await;
        }
        InvocationResult {
            answer: hit.answer,
            model: hit.model,
            prompt_tokens: hit.prompt_tokens,
            completion_tokens: hit.completion_tokens,
            reasoning_tokens: hit.reasoning_tokens,
            input_cost_picos: hit.input_cost_picos,
            output_cost_picos: hit.output_cost_picos,
            cached: true,
            attempts: 0,
            signatures: vec![signature.key_hash.clone()],
        }
    }

    fn hit_delay(&self) -> Option<Duration> {
        let (min, max) = self.options.hit_delay?;
        if max.is_zero() {
            return None;
        }
        let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
        let ms = if lo >= hi {
            hi
        } else {
            rand::thread_rng().gen_range(lo..=hi)
        };
        Some(Duration::from_millis(ms))
    }

    async fn call_with_fallback(
        &self,
        model: &str,
        system: &str,
        user: &str,
        mut params: ParamSet,
    ) -> Result<(ChatResponse, u32), InvokeError> {
        let caps = capabilities(model);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let attribution = match self.run_id {
                Some(id) => Attribution::new("invoker").with_run(id),
                None => Attribution::new("invoker"),
            };
            let chat = params.to_request(model, system, user, &caps, attribution);

            let err = match self.gateway.chat(chat).await {
                Ok(resp) => return Ok((resp, attempts)),
                Err(err) => err,
            };

            match err.kind() {
                ErrorKind::ParameterUnsupported => {
                    let rejected = err.rejected_param().map(str::to_string);
                    if attempts >= MAX_ATTEMPTS || !params.strip(rejected.as_deref()) {
                        return Err(InvokeError::ParameterUnsupported {
                            model: model.to_string(),
                            attempts,
                            source: err,
                        });
                    }
                    tracing::debug!(
                        model = %model,
                        attempt = attempts,
                        rejected = rejected.as_deref().unwrap_or("?"),
                        params = %params.canonical(),
                        "parameter rejected; retrying with fewer parameters"
                    );
                }
                ErrorKind::Transient => return Err(InvokeError::Transient(err)),
                ErrorKind::Fatal => return Err(InvokeError::Fatal(err)),
            }
        }
    }
}

/// Compress a prompt, or strip its compression markup when compression is off.
fn prepare_prompt(req: &InvocationRequest, text: &str) -> Result<String, InvokeError> {
    if !req.compress {
        return Ok(strip_markup(text));
    }
    let compressed = compress_prompt(text, req.compression_rate)?;
    tracing::debug!(
        model = %req.model,
        ratio = compressed.ratio(),
        "prompt compressed"
    );
    Ok(compressed.text)
}

fn signature_for(req: &InvocationRequest, model: &str, params: &ParamSet) -> CompletionSignature {
    let prompt = format!("{}\n\n{}", req.system, strip_markup(&req.prompt));
    let mut rendered = params.canonical();
    if req.compress {
        rendered.push_str(&format!(";rate={:.3}", req.compression_rate));
    }
    CompletionSignature::new(
        model,
        &req.language,
        &prompt,
        &rendered,
        req.compress,
        params.reasoning_effort.map(|e| e.as_str()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn std_caps() -> Capabilities {
        capabilities("gpt-4o")
    }

    #[test]
    fn test_initial_params_standard() {
        let req = InvocationRequest::new("gpt-4o", "sys", "p")
            .json()
            .temperature(0.1)
            .max_output_tokens(800);
        let params = ParamSet::initial(&req, &std_caps());
        assert_eq!(params.temperature, Some(0.1));
        assert!(params.json_mode);
        assert_eq!(params.max_tokens, Some(800));
        assert!(params.reasoning_effort.is_none());
    }

    #[test]
    fn test_initial_params_reasoning_drop_sampling_and_cap() {
        let req = InvocationRequest::new("gpt-5", "sys", "p")
            .json()
            .temperature(0.4)
            .max_output_tokens(800);
        let params = ParamSet::initial(&req, &capabilities("gpt-5"));
        assert!(params.temperature.is_none());
        assert!(params.max_tokens.is_none());
        assert_eq!(params.reasoning_effort, Some(ReasoningEffort::Medium));
    }

    #[test]
    fn test_json_mode_off_for_models_without_it() {
        let req = InvocationRequest::new("gpt-4-32k", "sys", "p").json();
        let params = ParamSet::initial(&req, &capabilities("gpt-4-32k"));
        assert!(!params.json_mode);
    }

    #[test]
    fn test_strip_ladder_order() {
        let mut params = ParamSet {
            temperature: Some(0.2),
            json_mode: true,
            max_tokens: Some(100),
            reasoning_effort: None,
        };
        assert!(params.strip(None));
        assert!(!params.json_mode);
        assert!(params.strip(None));
        assert!(params.max_tokens.is_none());
        assert!(params.strip(None));
        assert!(params.temperature.is_none());
        assert!(!params.strip(None));
    }

    #[test]
    fn test_strip_named_param_first() {
        let mut params = ParamSet {
            temperature: Some(0.2),
            json_mode: true,
            max_tokens: None,
            reasoning_effort: None,
        };
        assert!(params.strip(Some("temperature")));
        assert!(params.temperature.is_none());
        assert!(params.json_mode);
    }

    #[test]
    fn test_signature_tracks_params() {
        let invoker_req = InvocationRequest::new("gpt-4o", "sys", "p").temperature(0.1);
        let params = ParamSet::initial(&invoker_req, &std_caps());
        let a = signature_for(&invoker_req, "gpt-4o", &params);
        let b = signature_for(&invoker_req.clone().temperature(0.4), "gpt-4o", &params);
        // Same params rendered, same key.
        assert_eq!(a.key_hash, b.key_hash);

        let warmer = invoker_req.clone().temperature(0.4);
        let c = signature_for(&warmer, "gpt-4o", &ParamSet::initial(&warmer, &std_caps()));
        assert_ne!(a.key_hash, c.key_hash);

        let other_lang = invoker_req.clone().language("French");
        let d = signature_for(&other_lang, "gpt-4o", &params);
        assert_ne!(a.key_hash, d.key_hash);
    }

    #[test]
    fn test_signature_ignores_markup() {
        let plain = InvocationRequest::new("gpt-4o", "sys", "describe it");
        let marked = InvocationRequest::new("gpt-4o", "sys", "<llmlingua>describe it</llmlingua>");
        let params = ParamSet::initial(&plain, &std_caps());
        assert_eq!(
            signature_for(&plain, "gpt-4o", &params).key_hash,
            signature_for(&marked, "gpt-4o", &params).key_hash
        );
    }
}
