//! Single-step review modes run on a description before drafting.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::RunConfig;
use crate::cost::{summarize, CostReport, StepCost};
use crate::invoker::{AdaptiveInvoker, InvocationRequest, InvocationResult, InvokeError};
use crate::normalize::{normalize, Expected, Normalized};
use crate::prompts::{self, fence_solution, render_prompt, PromptVars};
use crate::steps::{SecurityFindings, ANALYSIS_TEMPERATURE, AUDIT_TEMPERATURE};

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub feedback: String,
    pub cost_report: CostReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub findings: SecurityFindings,
    /// Rewritten description, or the original when the audit produced none.
    pub rewritten_description: String,
    pub markdown: String,
    pub cost_report: CostReport,
}

fn request(config: &RunConfig, template: &str, description: &str, temperature: f32) -> InvocationRequest {
    let vars = PromptVars {
        solution_description: description,
        language: &config.language,
        ..PromptVars::default()
    };
    let prompt = render_prompt(template, &vars, &BTreeMap::new());
    let mut req = InvocationRequest::new(&config.model, "", prompt)
        .language(&config.language)
        .temperature(temperature)
        .reasoning_effort(config.reasoning_effort);
    if let Some(max) = config.max_output_tokens {
        req = req.max_output_tokens(max);
    }
    req
}

fn report(name: &str, result: &InvocationResult) -> CostReport {
    summarize(&[StepCost::from_result(name, result)])
}

/// Feedback on gaps and sensitive-use triggers in a description.
pub async fn analyze(
    invoker: &AdaptiveInvoker,
    description: &str,
    config: &RunConfig,
) -> Result<AnalysisReport, InvokeError> {
    let req = request(config, prompts::ANALYSIS_PROMPT, description, ANALYSIS_TEMPERATURE);
    let result = invoker.invoke(&req).await?;
    tracing::info!(cached = result.cached, "analysis complete");
    let feedback = match normalize(&result.answer, Expected::Text) {
        Normalized::Text(text) => text,
        _ => String::new(),
    };
    Ok(AnalysisReport {
        feedback,
        cost_report: report("Analysis", &result),
    })
}

/// Screen a description for bias and embedded prompt commands.
pub async fn audit(
    invoker: &AdaptiveInvoker,
    description: &str,
    config: &RunConfig,
) -> Result<AuditReport, InvokeError> {
    let fenced = fence_solution(description);
    let req = request(config, prompts::SECURITY_AUDIT_PROMPT, &fenced, AUDIT_TEMPERATURE).json();
    let result = invoker.invoke(&req).await?;

    let normalized = normalize(&result.answer, Expected::Json { main_key: "solutionassessment" });
    let findings = match SecurityFindings::from_answer(&normalized) {
        Ok(findings) => findings,
        Err(err) => {
            tracing::warn!(error = %err, "audit answer unusable; keeping the original description");
            if let Err(err) = invoker.evict(&result.signatures).await {
                tracing::warn!(error = %err, "cache eviction failed");
            }
            SecurityFindings::default()
        }
    };
    let rewritten_description = if findings.rewritten_solution_description.trim().is_empty() {
        description.to_string()
    } else {
        findings.rewritten_solution_description.clone()
    };
    tracing::info!(
        bias = findings.identified_bias.len(),
        prompt_commands = findings.identified_prompt_commands.len(),
        "audit complete"
    );

    Ok(AuditReport {
        markdown: findings.to_markdown(),
        rewritten_description,
        findings,
        cost_report: report("Security audit", &result),
    })
}
