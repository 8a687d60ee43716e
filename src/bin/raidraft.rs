#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use rai_draft::cache::{CompletionCache, SqliteCompletionCache};
use rai_draft::gateway::{format_eur, registered_models, OpenAiAdapter, ProviderGateway, TracingUsageSink};
use rai_draft::pipeline::{
    Fragment, HookError, Pipeline, ProgressSink, ReplacementMap, RunHooks, RunTerminal,
    StepPersistence, StepProgress, StepStatus,
};
use rai_draft::template::{extract_input_text, output_path, TemplateDocument, UnitLayout};
use rai_draft::{rai_steps, review, telemetry, AdaptiveInvoker, RunConfig};

#[derive(Parser)]
#[command(name = "raidraft", version, about = "Draft Responsible AI impact assessments")]
struct Cli {
    /// Debug logging (overrides RAIDRAFT_LOG / RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Solution description (.docx or text)
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    language: Option<String>,
    /// Compress prompts before sending them
    #[arg(long)]
    compress: bool,
    /// Ignore cached answers and overwrite them
    #[arg(long)]
    rebuild_cache: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full assessment pipeline and render every template variant
    Draft {
        #[command(flatten)]
        run: RunArgs,
        /// Re-render the documents after every step
        #[arg(long)]
        steps: bool,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        run_id: Option<String>,
        /// Where to write the merged JSON sections
        #[arg(long)]
        json_out: Option<PathBuf>,
        /// Cancel between steps once this many seconds have passed
        #[arg(long)]
        run_timeout_secs: Option<u64>,
    },
    /// Feedback on gaps in a solution description
    Analyze {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Screen a solution description for bias and embedded prompt commands
    Audit {
        #[command(flatten)]
        run: RunArgs,
        /// Write the rewritten description here
        #[arg(long)]
        rewritten_out: Option<PathBuf>,
    },
    /// Export SQLite cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune SQLite cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
    /// Delete cache entries by key hash
    CacheDelete {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
    },
    /// List known models with prices and class
    Pricing,
}

fn load_config(args: &RunArgs) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let mut config = RunConfig::load(args.config.as_deref())?;
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(language) = &args.language {
        config.language = language.clone();
    }
    config.compress |= args.compress;
    config.rebuild_cache |= args.rebuild_cache;
    Ok(config)
}

fn build_invoker(config: &RunConfig) -> Result<AdaptiveInvoker, Box<dyn std::error::Error>> {
    let adapter = OpenAiAdapter::with_config(config.adapter_config()?)?;
    let gateway = ProviderGateway::with_config(adapter, Arc::new(TracingUsageSink), config.gateway_config());
    let cache = SqliteCompletionCache::new(&config.cache_path)?;
    Ok(AdaptiveInvoker::new(Arc::new(gateway), Arc::new(cache))
        .with_options(config.invoke_options())
        .with_run_id(Uuid::new_v4()))
}

/// Render every configured variant. A variant that fails is logged and
/// skipped; the others are still written.
fn render_variants(
    config: &RunConfig,
    out_dir: &Path,
    run_id: &str,
    map: &ReplacementMap,
    populated: usize,
) -> Vec<PathBuf> {
    let mut written = Vec::new();
    for variant in &config.variants {
        let layout = UnitLayout {
            marker_prefix: variant.unit_marker.clone(),
            stop_marker: variant.stop_marker.clone(),
        };
        let path = output_path(out_dir, run_id, &variant.name);
        let result = TemplateDocument::load(&variant.template).and_then(|mut doc| {
            let report = doc.render(map.as_map(), populated, Some(&layout))?;
            doc.save(&path)?;
            Ok(report)
        });
        match result {
            Ok(report) => {
                if !report.unresolved().is_empty() {
                    tracing::warn!(
                        variant = %variant.name,
                        unresolved = report.unresolved().len(),
                        "placeholders left without content"
                    );
                }
                written.push(path);
            }
            Err(err) => {
                tracing::error!(variant = %variant.name, error = %err, "template rendering failed");
            }
        }
    }
    written
}

struct ConsoleProgress;

#[async_trait::async_trait]
impl ProgressSink for ConsoleProgress {
    async fn on_step(&self, event: &StepProgress) -> Result<(), HookError> {
        let status = match &event.status {
            StepStatus::Completed { cached: true } => "done (cached)".to_string(),
            StepStatus::Completed { cached: false } => "done".to_string(),
            StepStatus::Degraded { reason } => format!("no usable output: {reason}"),
            StepStatus::Skipped => "skipped".to_string(),
            StepStatus::Failed { error } => format!("failed: {error}"),
        };
        println!(
            "[{}/{}] {}: {status} ({} tokens, {} so far)",
            event.index + 1,
            event.total,
            event.step_name,
            event.tokens_used,
            format_eur(event.cost_so_far_picos)
        );
        Ok(())
    }

    async fn on_finish(&self, terminal: &RunTerminal) -> Result<(), HookError> {
        match terminal {
            RunTerminal::Completed { total_cost_picos } => {
                println!("run complete: {}", format_eur(*total_cost_picos));
            }
            RunTerminal::Cancelled { next_step, .. } => println!("run cancelled before {next_step}"),
            RunTerminal::Failed { step_name, error } => println!("run failed at {step_name}: {error}"),
        }
        Ok(())
    }
}

/// Re-renders the documents after each step.
struct IncrementalRender<'a> {
    config: &'a RunConfig,
    out_dir: &'a Path,
    run_id: &'a str,
}

#[async_trait::async_trait]
impl StepPersistence for IncrementalRender<'_> {
    async fn persist(
        &self,
        step_name: &str,
        _fragment: &Fragment,
        map: &ReplacementMap,
        populated_units: usize,
    ) -> Result<(), HookError> {
        let written = render_variants(self.config, self.out_dir, self.run_id, map, populated_units);
        if written.len() < self.config.variants.len() {
            return Err(HookError::Message(format!(
                "only {} of {} documents rendered after {step_name}",
                written.len(),
                self.config.variants.len()
            )));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);

    match cli.command {
        Commands::Draft {
            run,
            steps,
            out_dir,
            run_id,
            json_out,
            run_timeout_secs,
        } => {
            let mut config = load_config(&run)?;
            if let Some(dir) = out_dir {
                config.output_dir = dir;
            }
            config.update_after_each_step |= steps;
            config.validate()?;

            let input = extract_input_text(&run.input)?;
            let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            let invoker = build_invoker(&config)?;
            let pipeline = Pipeline::new(rai_steps())?;

            let cancel = Arc::new(AtomicBool::new(false));
            if let Some(secs) = run_timeout_secs {
                let flag = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    flag.store(true, Ordering::SeqCst);
                });
            }
            let renderer = IncrementalRender {
                config: &config,
                out_dir: &config.output_dir,
                run_id: &run_id,
            };
            let hooks = RunHooks {
                cancel: Some(cancel.as_ref()),
                progress: Some(&ConsoleProgress),
                persistence: steps.then_some(&renderer as &dyn StepPersistence),
            };

            let (outcome, failure) = match pipeline.run(&invoker, &input, &config, hooks).await {
                Ok(outcome) => (outcome, None),
                Err(failure) => {
                    let message = failure.to_string();
                    (failure.partial, Some(message))
                }
            };

            let written = render_variants(
                &config,
                &config.output_dir,
                &run_id,
                &outcome.replacement_map,
                outcome.populated_units,
            );
            for path in &written {
                println!("wrote {}", path.display());
            }
            let json_path = json_out.unwrap_or_else(|| config.output_dir.join(format!("{run_id}_sections.json")));
            if let Some(parent) = json_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&json_path, serde_json::to_string_pretty(&outcome.sections)?)?;
            println!("wrote {}", json_path.display());
            print!("{}", outcome.cost_report);

            if let Some(message) = failure {
                return Err(message.into());
            }
        }
        Commands::Analyze { run } => {
            let config = load_config(&run)?;
            config.validate()?;
            let input = extract_input_text(&run.input)?;
            let invoker = build_invoker(&config)?;
            let report = review::analyze(&invoker, &input, &config).await?;
            println!("{}", report.feedback);
            print!("{}", report.cost_report);
        }
        Commands::Audit { run, rewritten_out } => {
            let config = load_config(&run)?;
            config.validate()?;
            let input = extract_input_text(&run.input)?;
            let invoker = build_invoker(&config)?;
            let report = review::audit(&invoker, &input, &config).await?;
            if report.markdown.is_empty() {
                println!("No bias or prompt commands found.");
            } else {
                print!("{}", report.markdown);
            }
            if let Some(path) = rewritten_out {
                fs::write(&path, &report.rewritten_description)?;
                println!("wrote {}", path.display());
            }
            print!("{}", report.cost_report);
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteCompletionCache::default_path);
            let cache = SqliteCompletionCache::new(path)?;
            let rows = cache.export_jsonl(out).await?;
            println!("exported {rows} rows");
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteCompletionCache::default_path);
            let cache = SqliteCompletionCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
        Commands::CacheDelete { db, keys } => {
            let path = db.unwrap_or_else(SqliteCompletionCache::default_path);
            let cache = SqliteCompletionCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let mut deleted = 0;
            for key in &keys {
                if cache.delete(key).await? {
                    deleted += 1;
                } else {
                    eprintln!("no entry for {key}");
                }
            }
            println!("deleted {deleted} of {} entries", keys.len());
        }
        Commands::Pricing => {
            println!(
                "{:<28} {:<10} {:>14} {:>14} {:>10}",
                "model", "class", "input/1K", "output/1K", "context"
            );
            for (name, spec) in registered_models() {
                println!(
                    "{:<28} {:<10} {:>14} {:>14} {:>10}",
                    name,
                    spec.class.as_str(),
                    format_eur(spec.input_nanos_per_1k * 1_000),
                    format_eur(spec.output_nanos_per_1k * 1_000),
                    spec.context_window
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".into())
                );
            }
        }
    }

    Ok(())
}
