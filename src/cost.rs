//! Per-run cost accounting.
//!
//! Amounts are pico-euros throughout. Cached steps carry the historical cost
//! of the call that produced them; they count toward `total_cost_picos` but
//! not toward `billed_cost_picos`.

use std::fmt;

use serde::Serialize;

use crate::gateway::format_eur;
use crate::invoker::InvocationResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepCost {
    pub name: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub reasoning_tokens: u32,
    pub input_cost_picos: i64,
    pub output_cost_picos: i64,
    pub cached: bool,
}

impl StepCost {
    pub fn from_result(name: impl Into<String>, result: &InvocationResult) -> Self {
        Self {
            name: name.into(),
            model: result.model.clone(),
            prompt_tokens: result.prompt_tokens,
            completion_tokens: result.completion_tokens,
            reasoning_tokens: result.reasoning_tokens,
            input_cost_picos: result.input_cost_picos,
            output_cost_picos: result.output_cost_picos,
            cached: result.cached,
        }
    }

    pub fn tokens(&self) -> u64 {
        u64::from(self.prompt_tokens)
            + u64::from(self.completion_tokens)
            + u64::from(self.reasoning_tokens)
    }

    pub fn cost_picos(&self) -> i64 {
        self.input_cost_picos.saturating_add(self.output_cost_picos)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CostReport {
    pub per_step: Vec<StepCost>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
    pub input_cost_picos: i64,
    pub output_cost_picos: i64,
    pub total_cost_picos: i64,
    /// Cost of provider calls made in this run, cache hits excluded.
    pub billed_cost_picos: i64,
}

impl CostReport {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens + self.reasoning_tokens
    }

    pub fn cached_steps(&self) -> usize {
        self.per_step.iter().filter(|s| s.cached).count()
    }
}

/// Aggregate per-step costs. Pure; order of `per_step` is preserved.
pub fn summarize(steps: &[StepCost]) -> CostReport {
    let mut report = CostReport {
        per_step: steps.to_vec(),
        ..CostReport::default()
    };
    for step in steps {
        report.prompt_tokens += u64::from(step.prompt_tokens);
        report.completion_tokens += u64::from(step.completion_tokens);
        report.reasoning_tokens += u64::from(step.reasoning_tokens);
        report.input_cost_picos = report.input_cost_picos.saturating_add(step.input_cost_picos);
        report.output_cost_picos = report.output_cost_picos.saturating_add(step.output_cost_picos);
        if !step.cached {
            report.billed_cost_picos = report.billed_cost_picos.saturating_add(step.cost_picos());
        }
    }
    report.total_cost_picos = report
        .input_cost_picos
        .saturating_add(report.output_cost_picos);
    report
}

impl fmt::Display for CostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<34} {:>8} {:>8} {:>8} {:>12} {:>12}",
            "step", "prompt", "compl", "reason", "input", "output"
        )?;
        for step in &self.per_step {
            writeln!(
                f,
                "{:<34} {:>8} {:>8} {:>8} {:>12} {:>12}{}",
                step.name,
                step.prompt_tokens,
                step.completion_tokens,
                step.reasoning_tokens,
                format_eur(step.input_cost_picos),
                format_eur(step.output_cost_picos),
                if step.cached { "  (cached)" } else { "" }
            )?;
        }
        writeln!(
            f,
            "total: {} tokens, {} ({} billed this run)",
            self.total_tokens(),
            format_eur(self.total_cost_picos),
            format_eur(self.billed_cost_picos)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::chat_cost;

    fn step(name: &str, model: &str, p: u32, c: u32, r: u32, cached: bool) -> StepCost {
        let cost = chat_cost(model, p, c, r);
        StepCost {
            name: name.into(),
            model: model.into(),
            prompt_tokens: p,
            completion_tokens: c,
            reasoning_tokens: r,
            input_cost_picos: cost.input_picos,
            output_cost_picos: cost.output_picos,
            cached,
        }
    }

    #[test]
    fn test_total_is_exact_sum() {
        // gpt-5: input 1_080_000 nanos/1K, output 8_630_000 nanos/1K
        let steps = vec![
            step("one", "gpt-5", 100, 50, 0, false),
            step("two", "gpt-5", 80, 30, 20, false),
        ];
        let report = summarize(&steps);
        let expected = 100 * 1_080_000 + 50 * 8_630_000 + 80 * 1_080_000 + (30 + 20) * 8_630_000;
        assert_eq!(report.total_cost_picos, expected);
        assert_eq!(report.billed_cost_picos, expected);
        assert_eq!(report.total_tokens(), 280);
    }

    #[test]
    fn test_cached_steps_not_billed() {
        let steps = vec![
            step("one", "gpt-4o", 1000, 100, 0, true),
            step("two", "gpt-4o", 1000, 100, 0, false),
        ];
        let report = summarize(&steps);
        assert_eq!(report.billed_cost_picos, steps[1].cost_picos());
        assert_eq!(report.total_cost_picos, steps[0].cost_picos() * 2);
        assert_eq!(report.cached_steps(), 1);
    }

    #[test]
    fn test_empty_report() {
        let report = summarize(&[]);
        assert_eq!(report.total_cost_picos, 0);
        assert!(report.per_step.is_empty());
        assert!(report.to_string().contains("total: 0 tokens"));
    }
}
