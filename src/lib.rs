#![forbid(unsafe_code)]

//! # rai-draft
//!
//! Drafts Responsible AI impact assessments from a free-text solution
//! description.
//!
//! A fixed sequence of model steps (intended uses, stakeholders, goals,
//! risks, harms...) turns the description into `##TOKEN` replacements. Each
//! call goes through a capability-aware invoker that picks the parameters a
//! model accepts, falls back when the provider rejects one, and serves
//! repeats from a content-addressed completion cache. The accumulated map is
//! then rendered into one DOCX per template variant, pruning the per-unit
//! sections the description did not fill.

pub mod cache;
pub mod compression;
pub mod config;
pub mod cost;
pub mod gateway;
pub mod invoker;
pub mod normalize;
pub mod pipeline;
pub mod prompts;
pub mod review;
pub mod steps;
pub mod telemetry;
pub mod template;

pub use cache::{
    CachedCompletion, CompletionCache, CompletionSignature, MemoryCompletionCache, SingleFlight,
    SqliteCompletionCache,
};
pub use config::{ConfigError, RunConfig, TemplateVariant};
pub use cost::{summarize, CostReport, StepCost};
pub use gateway::{ChatGateway, ProviderGateway, UsageSink};
pub use invoker::{AdaptiveInvoker, InvocationRequest, InvocationResult, InvokeError, OutputMode};
pub use normalize::{normalize, Expected, Normalized};
pub use pipeline::{
    Fragment, GenerationStep, Pipeline, PipelineError, PipelineFailure, PipelineRun,
    ProgressSink, ReplacementMap, RunHooks, StepPersistence, StepProcessor, StopReason,
};
pub use steps::rai_steps;
pub use template::{TemplateDocument, TemplateError, UnitLayout};
