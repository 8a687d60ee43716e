//! Sequential step pipeline.
//!
//! A run walks the step list in declaration order:
//! 1. **Render** the step prompt from the input and earlier outputs
//! 2. **Invoke** the model through the cache-aware invoker
//! 3. **Normalize** the answer and hand it to the step processor
//! 4. **Merge** the resulting fragment into the run's replacement map
//!
//! A step whose answer cannot be used contributes nothing and the run goes on.
//! A step whose model call fails ends the run; everything merged so far is
//! returned with the failure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::RunConfig;
use crate::cost::{summarize, CostReport, StepCost};
use crate::invoker::{AdaptiveInvoker, InvocationRequest, InvokeError, OutputMode};
use crate::normalize::{normalize, Expected, Normalized};
use crate::prompts::{self, render_prompt, PromptVars};
use crate::steps::{RunState, StepDataError};

/// Token replacements produced by one step.
pub type Fragment = BTreeMap<String, String>;

/// Turns a normalized answer into a fragment. May read and extend the run
/// state published by earlier steps.
pub trait StepProcessor: Send + Sync {
    fn process(&self, answer: &Normalized, state: &mut RunState) -> Result<Fragment, StepDataError>;
}

// =============================================================================
// Types
// =============================================================================

#[derive(Clone)]
pub struct GenerationStep {
    pub name: String,
    pub prompt_template: String,
    /// Earlier steps whose outputs the prompt reads.
    pub depends_on: Vec<String>,
    pub output_mode: OutputMode,
    /// Top-level key a JSON answer must carry.
    pub main_key: Option<String>,
    pub temperature: Option<f32>,
    /// Skipped when the units step produced no units.
    pub requires_units: bool,
    /// This step's processor sets the populated unit count.
    pub publishes_units: bool,
    pub processor: Arc<dyn StepProcessor>,
}

impl std::fmt::Debug for GenerationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStep")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("output_mode", &self.output_mode)
            .field("main_key", &self.main_key)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

impl GenerationStep {
    pub fn json(
        name: impl Into<String>,
        prompt_template: impl Into<String>,
        main_key: impl Into<String>,
        temperature: f32,
        processor: Arc<dyn StepProcessor>,
    ) -> Self {
        Self {
            name: name.into(),
            prompt_template: prompt_template.into(),
            depends_on: Vec::new(),
            output_mode: OutputMode::Json,
            main_key: Some(main_key.into()),
            temperature: Some(temperature),
            requires_units: false,
            publishes_units: false,
            processor,
        }
    }

    pub fn text(
        name: impl Into<String>,
        prompt_template: impl Into<String>,
        temperature: f32,
        processor: Arc<dyn StepProcessor>,
    ) -> Self {
        Self {
            output_mode: OutputMode::Text,
            main_key: None,
            ..Self::json(name, prompt_template, "", temperature, processor)
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn requires_units(mut self) -> Self {
        self.requires_units = true;
        self
    }

    pub fn publishes_units(mut self) -> Self {
        self.publishes_units = true;
        self
    }

    fn expected(&self) -> Expected<'_> {
        match (self.output_mode, self.main_key.as_deref()) {
            (OutputMode::Json, Some(main_key)) => Expected::Json { main_key },
            _ => Expected::Text,
        }
    }
}

/// Accumulated token map of one run. Later steps win; every overwrite is
/// logged with both step names.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ReplacementMap {
    entries: BTreeMap<String, String>,
    #[serde(skip)]
    origin: HashMap<String, String>,
}

impl ReplacementMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries.get(token).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Step that last wrote `token`.
    pub fn origin(&self, token: &str) -> Option<&str> {
        self.origin.get(token).map(String::as_str)
    }

    pub fn insert(&mut self, step: &str, token: impl Into<String>, value: impl Into<String>) {
        let token = token.into();
        if let Some(previous) = self.origin.get(&token) {
            tracing::info!(
                overwritten = %token,
                previous_step = %previous,
                step = %step,
                "token overwritten"
            );
        }
        self.origin.insert(token.clone(), step.to_string());
        self.entries.insert(token, value.into());
    }

    /// Merge a fragment; returns how many existing tokens it replaced.
    pub fn merge(&mut self, step: &str, fragment: Fragment) -> usize {
        let mut overwrites = 0;
        for (token, value) in fragment {
            if self.entries.contains_key(&token) {
                overwrites += 1;
            }
            self.insert(step, token, value);
        }
        overwrites
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Cancelled { next_step: String },
    Failed { step_name: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub replacement_map: ReplacementMap,
    pub cost_report: CostReport,
    /// Normalized answers merged by main key.
    pub sections: Value,
    pub populated_units: usize,
    pub stop_reason: StopReason,
    /// Steps that contributed nothing, with the reason.
    pub degraded: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),
    #[error("step '{step}' depends on '{dependency}', which does not run before it")]
    ForwardDependency { step: String, dependency: String },
    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

/// A step's model call failed. `partial` holds everything merged before it.
#[derive(Debug, Error)]
#[error("step {step_index} ({step_name}) failed: {error}")]
pub struct PipelineFailure {
    pub step_index: usize,
    pub step_name: String,
    #[source]
    pub error: PipelineError,
    pub partial: PipelineRun,
}

// =============================================================================
// Hooks
// =============================================================================

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Completed { cached: bool },
    Degraded { reason: String },
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepProgress {
    pub step_name: String,
    pub index: usize,
    pub total: usize,
    pub tokens_used: u64,
    pub cost_so_far_picos: i64,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunTerminal {
    Completed { total_cost_picos: i64 },
    Cancelled { next_step: String, total_cost_picos: i64 },
    Failed { step_name: String, error: String },
}

#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_step(&self, event: &StepProgress) -> Result<(), HookError>;
    async fn on_finish(&self, terminal: &RunTerminal) -> Result<(), HookError>;
}

/// Receives each step's output when incremental updates are on.
#[async_trait::async_trait]
pub trait StepPersistence: Send + Sync {
    async fn persist(
        &self,
        step_name: &str,
        fragment: &Fragment,
        map: &ReplacementMap,
        populated_units: usize,
    ) -> Result<(), HookError>;
}

#[derive(Default, Clone, Copy)]
pub struct RunHooks<'a> {
    /// Checked before each step.
    pub cancel: Option<&'a AtomicBool>,
    pub progress: Option<&'a dyn ProgressSink>,
    pub persistence: Option<&'a dyn StepPersistence>,
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Vec<GenerationStep>,
    /// Overrides the assessment system prompt.
    system_template: Option<String>,
}

struct RunAccumulator {
    map: ReplacementMap,
    costs: Vec<StepCost>,
    sections: Map<String, Value>,
    state: RunState,
    units_published: bool,
    degraded: Vec<(String, String)>,
}

impl RunAccumulator {
    fn new() -> Self {
        Self {
            map: ReplacementMap::new(),
            costs: Vec::new(),
            sections: Map::new(),
            state: RunState::default(),
            units_published: false,
            degraded: Vec::new(),
        }
    }

    fn finish(self, stop_reason: StopReason) -> PipelineRun {
        PipelineRun {
            replacement_map: self.map,
            cost_report: summarize(&self.costs),
            sections: Value::Object(self.sections),
            populated_units: self.state.populated_units,
            stop_reason,
            degraded: self.degraded,
        }
    }

    fn tokens_used(&self) -> u64 {
        self.costs.iter().map(StepCost::tokens).sum()
    }

    fn cost_so_far(&self) -> i64 {
        self.costs.iter().map(StepCost::cost_picos).sum()
    }
}

impl Pipeline {
    /// Validate and freeze a step list.
    pub fn new(steps: Vec<GenerationStep>) -> Result<Self, PipelineError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &steps {
            for dependency in &step.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(PipelineError::ForwardDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            if !seen.insert(step.name.as_str()) {
                return Err(PipelineError::DuplicateStep(step.name.clone()));
            }
        }
        Ok(Self {
            steps,
            system_template: None,
        })
    }

    pub fn with_system_prompt(mut self, template: impl Into<String>) -> Self {
        self.system_template = Some(template.into());
        self
    }

    pub fn steps(&self) -> &[GenerationStep] {
        &self.steps
    }

    pub async fn run(
        &self,
        invoker: &AdaptiveInvoker,
        input: &str,
        config: &RunConfig,
        hooks: RunHooks<'_>,
    ) -> Result<PipelineRun, Box<PipelineFailure>> {
        let input = input.trim();
        let mut acc = RunAccumulator::new();
        acc.map.insert("input", "##SOLUTION_DESCRIPTION", input);
        let total = self.steps.len();

        for (index, step) in self.steps.iter().enumerate() {
            if hooks.cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
                tracing::info!(next_step = %step.name, "run cancelled");
                let terminal = RunTerminal::Cancelled {
                    next_step: step.name.clone(),
                    total_cost_picos: acc.cost_so_far(),
                };
                notify_finish(hooks, &terminal).await;
                return Ok(acc.finish(StopReason::Cancelled {
                    next_step: step.name.clone(),
                }));
            }

            if step.requires_units && acc.units_published && acc.state.populated_units == 0 {
                tracing::info!(step = %step.name, "no intended uses; step skipped");
                notify_step(hooks, &acc, step, index, total, StepStatus::Skipped).await;
                continue;
            }

            let request = self.request_for(step, input, config, &acc);
            let result = match invoker.invoke(&request).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(step = %step.name, error = %err, "step failed");
                    let status = StepStatus::Failed {
                        error: err.to_string(),
                    };
                    notify_step(hooks, &acc, step, index, total, status).await;
                    let terminal = RunTerminal::Failed {
                        step_name: step.name.clone(),
                        error: err.to_string(),
                    };
                    notify_finish(hooks, &terminal).await;
                    return Err(Box::new(PipelineFailure {
                        step_index: index,
                        step_name: step.name.clone(),
                        error: err.into(),
                        partial: acc.finish(StopReason::Failed {
                            step_name: step.name.clone(),
                        }),
                    }));
                }
            };

            acc.costs.push(StepCost::from_result(&step.name, &result));
            let normalized = normalize(&result.answer, step.expected());
            let outcome = match &normalized {
                Normalized::Empty { reason } => Err(reason.clone()),
                answer => step
                    .processor
                    .process(answer, &mut acc.state)
                    .map_err(|e| e.to_string()),
            };
            if step.publishes_units {
                acc.units_published = true;
            }

            let status = match outcome {
                Ok(fragment) => {
                    if let Normalized::Json(value) = normalized {
                        merge_section(&mut acc.sections, value);
                    }
                    let overwrites = acc.map.merge(&step.name, fragment.clone());
                    tracing::info!(
                        step = %step.name,
                        tokens = fragment.len(),
                        overwrites,
                        cached = result.cached,
                        cost_picos = result.input_cost_picos + result.output_cost_picos,
                        "step complete"
                    );
                    if config.update_after_each_step {
                        if let Some(persistence) = hooks.persistence {
                            if let Err(err) = persistence
                                .persist(&step.name, &fragment, &acc.map, acc.state.populated_units)
                                .await
                            {
                                tracing::warn!(step = %step.name, error = %err, "step persistence failed");
                            }
                        }
                    }
                    StepStatus::Completed {
                        cached: result.cached,
                    }
                }
                Err(reason) => {
                    tracing::warn!(step = %step.name, reason = %reason, "step output unusable; no tokens set");
                    // A cached unusable answer would repeat on every rerun.
                    if let Err(err) = invoker.evict(&result.signatures).await {
                        tracing::warn!(step = %step.name, error = %err, "cache eviction failed");
                    }
                    acc.degraded.push((step.name.clone(), reason.clone()));
                    StepStatus::Degraded { reason }
                }
            };
            notify_step(hooks, &acc, step, index, total, status).await;
        }

        let terminal = RunTerminal::Completed {
            total_cost_picos: acc.cost_so_far(),
        };
        notify_finish(hooks, &terminal).await;
        Ok(acc.finish(StopReason::Completed))
    }

    fn request_for(
        &self,
        step: &GenerationStep,
        input: &str,
        config: &RunConfig,
        acc: &RunAccumulator,
    ) -> InvocationRequest {
        let intended_uses = if acc.state.intended_uses.is_empty() {
            String::new()
        } else {
            acc.state.intended_uses_json()
        };
        let stakeholders = if acc.state.stakeholders.is_empty() {
            String::new()
        } else {
            acc.state.stakeholders_json()
        };
        let vars = PromptVars {
            solution_description: input,
            language: &config.language,
            intended_uses: &intended_uses,
            stakeholders: &stakeholders,
        };
        let prompt = render_prompt(&step.prompt_template, &vars, acc.map.as_map());
        let system = match &self.system_template {
            Some(template) => template.replace(prompts::LANGUAGE, &config.language),
            None => prompts::system_prompt(&config.language),
        };

        let mut request = InvocationRequest::new(&config.model, system, prompt).language(&config.language);
        if step.output_mode == OutputMode::Json {
            request = request.json();
        }
        if let Some(t) = step.temperature {
            request = request.temperature(t);
        }
        // Dropped by the invoker for standard models.
        request = request.reasoning_effort(config.reasoning_effort);
        if let Some(max) = config.max_output_tokens {
            request = request.max_output_tokens(max);
        }
        request.compress = config.compress;
        request.compression_rate = config.compression_rate;
        request
    }
}

/// Merge a normalized answer into the run's sections. A repeated main key
/// merges object fields; anything else is replaced.
fn merge_section(sections: &mut Map<String, Value>, value: Value) {
    let Value::Object(incoming) = value else {
        return;
    };
    for (key, value) in incoming {
        match (sections.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(fields)) => {
                existing.extend(fields);
            }
            (_, value) => {
                sections.insert(key, value);
            }
        }
    }
}

async fn notify_step(
    hooks: RunHooks<'_>,
    acc: &RunAccumulator,
    step: &GenerationStep,
    index: usize,
    total: usize,
    status: StepStatus,
) {
    let Some(sink) = hooks.progress else {
        return;
    };
    let event = StepProgress {
        step_name: step.name.clone(),
        index,
        total,
        tokens_used: acc.tokens_used(),
        cost_so_far_picos: acc.cost_so_far(),
        status,
    };
    if let Err(err) = sink.on_step(&event).await {
        tracing::warn!(step = %step.name, error = %err, "progress sink failed");
    }
}

async fn notify_finish(hooks: RunHooks<'_>, terminal: &RunTerminal) {
    if let Some(sink) = hooks.progress {
        if let Err(err) = sink.on_finish(terminal).await {
            tracing::warn!(error = %err, "progress sink failed");
        }
    }
}
