use std::sync::{Arc, Mutex};
use std::time::Duration;

use rai_draft::gateway::{
    ChatGateway, ChatRequest, ChatResponse, ErrorKind, FinishReason, ProviderError,
};
use rai_draft::invoker::{InvokeOptions, MAX_ATTEMPTS};
use rai_draft::prompts::system_prompt;
use rai_draft::{AdaptiveInvoker, InvocationRequest, InvokeError, MemoryCompletionCache};

type Script = dyn Fn(&ChatRequest, usize) -> Result<ChatResponse, ProviderError> + Send + Sync;

/// Gateway that answers from a script and keeps every request it saw.
struct ScriptedGateway {
    script: Box<Script>,
    delay: Duration,
    seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedGateway {
    fn new(
        script: impl Fn(&ChatRequest, usize) -> Result<ChatResponse, ProviderError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn slow(
        delay: Duration,
        script: impl Fn(&ChatRequest, usize) -> Result<ChatResponse, ProviderError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let n = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(req.clone());
            seen.len() - 1
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(&req, n)
    }
}

fn answer(content: &str, finish_reason: FinishReason) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        input_tokens: 400,
        output_tokens: 60,
        reasoning_tokens: 0,
        input_cost_picos: 1_000_000,
        output_cost_picos: 600_000,
        latency: Duration::from_millis(5),
        finish_reason,
    }
}

fn ok(content: &str) -> Result<ChatResponse, ProviderError> {
    Ok(answer(content, FinishReason::Stop))
}

fn step_request(model: &str) -> InvocationRequest {
    InvocationRequest::new(
        model,
        "You are a Responsible AI assistant.",
        "List the intended uses of a claims triage assistant.",
    )
    .json()
    .temperature(0.1)
    .max_output_tokens(1_000)
}

#[tokio::test]
async fn repeated_invocation_is_served_from_cache() {
    let gateway = ScriptedGateway::new(|_, _| ok(r#"{"intendeduses": []}"#));
    let cache = MemoryCompletionCache::new();
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(cache.clone()));
    let req = step_request("gpt-4o");

    let first = invoker.invoke(&req).await.unwrap();
    let second = invoker.invoke(&req).await.unwrap();

    assert_eq!(gateway.calls(), 1);
    assert!(!first.cached);
    assert_eq!(first.attempts, 1);
    assert!(second.cached);
    assert_eq!(second.attempts, 0);
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.input_cost_picos, first.input_cost_picos);
    assert_eq!(second.output_cost_picos, first.output_cost_picos);
    assert_eq!(second.signatures, first.signatures);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn concurrent_identical_requests_reach_provider_once() {
    let gateway = ScriptedGateway::slow(Duration::from_millis(50), |_, _| ok("shared answer"));
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(MemoryCompletionCache::new()));
    let req = step_request("gpt-4o");

    let mut handles = Vec::new();
    for _ in 0..4 {
        let invoker = invoker.clone();
        let req = req.clone();
        handles.push(tokio::spawn(async move { invoker.invoke(&req).await }));
    }

    let mut fresh = 0;
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.answer, "shared answer");
        if !result.cached {
            fresh += 1;
        }
    }

    assert_eq!(gateway.calls(), 1);
    assert_eq!(fresh, 1);
}

#[tokio::test]
async fn rebuild_cache_bypasses_lookup_and_overwrites() {
    let gateway = ScriptedGateway::new(|_, n| ok(&format!("answer {n}")));
    let cache = Arc::new(MemoryCompletionCache::new());
    let req = step_request("gpt-4o");

    let warm = AdaptiveInvoker::new(gateway.clone(), cache.clone());
    warm.invoke(&req).await.unwrap();

    let rebuild = AdaptiveInvoker::new(gateway.clone(), cache.clone()).with_options(InvokeOptions {
        rebuild_cache: true,
        ..InvokeOptions::default()
    });
    let rebuilt = rebuild.invoke(&req).await.unwrap();
    assert!(!rebuilt.cached);
    assert_eq!(rebuilt.answer, "answer 1");
    assert_eq!(gateway.calls(), 2);

    let reread = warm.invoke(&req).await.unwrap();
    assert!(reread.cached);
    assert_eq!(reread.answer, "answer 1");
}

#[tokio::test]
async fn reasoning_model_never_receives_sampling_and_falls_back_monotonically() {
    let gateway = ScriptedGateway::new(|req, _| {
        if req.reasoning_effort.is_some() {
            return Err(ProviderError::parameter_unsupported(
                Some("reasoning_effort".into()),
                "reasoning_effort is not supported with this model",
            ));
        }
        ok(r#"{"intendeduses": []}"#)
    });
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(MemoryCompletionCache::new()));
    let req = step_request("gpt-5").temperature(0.4);

    let result = invoker.invoke(&req).await.unwrap();
    assert_eq!(result.attempts, 2);

    let sent = gateway.requests();
    assert_eq!(sent.len(), 2);
    for chat in &sent {
        assert!(!chat.has_sampling_params());
        assert!(chat.max_tokens.is_none());
    }
    assert!(sent[0].reasoning_effort.is_some());
    assert!(sent[1].reasoning_effort.is_none());
    assert!(sent[0].json_mode && sent[1].json_mode);

    // Cached under the signature of the first attempt.
    let again = invoker.invoke(&req).await.unwrap();
    assert!(again.cached);
    assert_eq!(gateway.calls(), 2);
}

#[tokio::test]
async fn unnamed_rejection_drops_json_mode_first_and_keeps_signature() {
    let gateway = ScriptedGateway::new(|req, _| {
        if req.json_mode {
            return Err(ProviderError::parameter_unsupported(
                None,
                "response_format is not supported",
            ));
        }
        ok(r#"{"intendeduses": []}"#)
    });
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(MemoryCompletionCache::new()));
    let req = step_request("gpt-4o");

    let result = invoker.invoke(&req).await.unwrap();

    let sent = gateway.requests();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].json_mode);
    assert!(!sent[1].json_mode);
    assert_eq!(sent[1].temperature, Some(0.1));
    assert_eq!(sent[1].max_tokens, Some(1_000));

    assert_eq!(result.signatures[0], invoker.signature(&req).key_hash);
}

#[tokio::test]
async fn exhausted_fallbacks_surface_parameter_error_and_cache_nothing() {
    let gateway = ScriptedGateway::new(|_, _| {
        Err(ProviderError::parameter_unsupported(None, "unsupported value"))
    });
    let cache = MemoryCompletionCache::new();
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(cache.clone()));

    let err = invoker.invoke(&step_request("gpt-4o")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParameterUnsupported);
    match err {
        InvokeError::ParameterUnsupported { attempts, .. } => assert_eq!(attempts, MAX_ATTEMPTS),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(gateway.calls(), MAX_ATTEMPTS as usize);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn transient_error_is_not_retried_by_invoker() {
    let gateway =
        ScriptedGateway::new(|_, _| Err(ProviderError::provider("openai", "overloaded", true)));
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(MemoryCompletionCache::new()));

    let err = invoker.invoke(&step_request("gpt-4o")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test]
async fn empty_answer_is_an_error_and_not_cached() {
    let gateway = ScriptedGateway::new(|_, _| ok("   "));
    let cache = MemoryCompletionCache::new();
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(cache.clone()));

    let err = invoker.invoke(&step_request("gpt-4o")).await.unwrap_err();
    assert!(matches!(err, InvokeError::Transient(_)));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn length_limited_answer_is_reissued_on_fallback_model() {
    let gateway = ScriptedGateway::new(|req, _| {
        if req.model == "gpt-4o" {
            Ok(answer(r#"{"intendeduses": [{"#, FinishReason::Length))
        } else {
            ok(r#"{"intendeduses": []}"#)
        }
    });
    let cache = MemoryCompletionCache::new();
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(cache.clone())).with_options(
        InvokeOptions {
            length_fallback_model: Some("gpt-4o-mini".into()),
            ..InvokeOptions::default()
        },
    );

    let result = invoker.invoke(&step_request("gpt-4o")).await.unwrap();
    assert_eq!(result.model, "gpt-4o-mini");
    assert_eq!(result.answer, r#"{"intendeduses": []}"#);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.signatures.len(), 2);
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn evict_forces_a_fresh_call() {
    let gateway = ScriptedGateway::new(|_, n| ok(&format!("answer {n}")));
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(MemoryCompletionCache::new()));
    let req = step_request("gpt-4o");

    let first = invoker.invoke(&req).await.unwrap();
    assert_eq!(invoker.evict(&first.signatures).await.unwrap(), 1);

    let second = invoker.invoke(&req).await.unwrap();
    assert!(!second.cached);
    assert_eq!(second.answer, "answer 1");
}

#[tokio::test(start_paused = true)]
async fn cache_hits_wait_for_configured_delay() {
    let gateway = ScriptedGateway::new(|_, _| ok("answer"));
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(MemoryCompletionCache::new()))
        .with_options(InvokeOptions {
            hit_delay: Some((Duration::from_secs(2), Duration::from_secs(2))),
            ..InvokeOptions::default()
        });
    let req = step_request("gpt-4o");
    invoker.invoke(&req).await.unwrap();

    let started = tokio::time::Instant::now();
    let hit = invoker.invoke(&req).await.unwrap();
    assert!(hit.cached);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

fn marked_up_request(compress: bool) -> InvocationRequest {
    let mut req = InvocationRequest::new(
        "gpt-4o",
        system_prompt("English"),
        "<llmlingua, rate=0.5>List the intended uses of a claims triage assistant \
         that reads incoming insurance claims and routes them to adjusters.</llmlingua>\
         <llmlingua, compress=False>Answer in JSON.</llmlingua>",
    );
    req.compress = compress;
    req
}

#[tokio::test]
async fn compression_markup_never_reaches_the_provider() {
    for compress in [false, true] {
        let gateway = ScriptedGateway::new(|_, _| ok("answer"));
        let invoker =
            AdaptiveInvoker::new(gateway.clone(), Arc::new(MemoryCompletionCache::new()));
        invoker.invoke(&marked_up_request(compress)).await.unwrap();

        let sent = gateway.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].messages.len(), 2);
        for message in &sent[0].messages {
            assert!(!message.content.contains("<llmlingua"), "compress={compress}");
            assert!(!message.content.contains("</llmlingua>"), "compress={compress}");
        }
        assert!(sent[0].messages[0]
            .content
            .ends_with("write the assessment in English."));
        assert!(sent[0].messages[1].content.ends_with("Answer in JSON."));
    }
}

#[tokio::test]
async fn compression_also_shortens_the_system_prompt() {
    let gateway = ScriptedGateway::new(|_, _| ok("answer"));
    let invoker = AdaptiveInvoker::new(gateway.clone(), Arc::new(MemoryCompletionCache::new()));
    invoker.invoke(&marked_up_request(true)).await.unwrap();

    let stripped = rai_draft::compression::strip_markup(&system_prompt("English"));
    let sent = gateway.requests();
    assert!(sent[0].messages[0].content.len() < stripped.len());
}
