//! Run configuration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML
//! file, `RAIDRAFT_*` environment variables, then CLI flags applied by the
//! binary. Call [`RunConfig::validate`] after the last layer.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::SqliteCompletionCache;
use crate::compression::DEFAULT_RATE;
use crate::gateway::{AdapterConfig, GatewayConfig, ReasoningEffort};
use crate::invoker::InvokeOptions;

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
    #[error("{0} not set")]
    MissingEnv(&'static str),
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

/// One output document family rendered from the same replacement map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariant {
    pub name: String,
    pub template: PathBuf,
    /// Heading prefix of a repeated unit, e.g. `Intended use #`.
    #[serde(default = "default_unit_marker")]
    pub unit_marker: String,
    /// First heading after the unit area.
    pub stop_marker: String,
}

fn default_unit_marker() -> String {
    "Intended use #".into()
}

fn default_variants() -> Vec<TemplateVariant> {
    vec![
        TemplateVariant {
            name: "internal".into(),
            template: PathBuf::from("templates/internal.docx"),
            unit_marker: default_unit_marker(),
            stop_marker: "Section 3: Adverse Impact".into(),
        },
        TemplateVariant {
            name: "public".into(),
            template: PathBuf::from("templates/public.docx"),
            unit_marker: default_unit_marker(),
            stop_marker: "Section 3: Adverse impact".into(),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: String,
    pub language: String,
    /// Sent to reasoning-class models only.
    pub reasoning_effort: ReasoningEffort,
    pub compress: bool,
    pub compression_rate: f32,
    /// Output cap for standard models.
    pub max_output_tokens: Option<u32>,
    /// Hand every step's fragment to the persistence hook.
    pub update_after_each_step: bool,
    pub rebuild_cache: bool,
    pub cache_hit_delay_min_secs: f64,
    pub cache_hit_delay_max_secs: f64,
    pub length_fallback_model: Option<String>,
    /// Retries for transient provider errors, with exponential backoff.
    pub transient_retries: u32,
    pub cache_path: PathBuf,
    pub api_base_url: String,
    pub api_timeout_secs: u64,
    pub output_dir: PathBuf,
    pub variants: Vec<TemplateVariant>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            language: "English".into(),
            reasoning_effort: ReasoningEffort::Medium,
            compress: false,
            compression_rate: DEFAULT_RATE,
            max_output_tokens: None,
            update_after_each_step: false,
            rebuild_cache: false,
            cache_hit_delay_min_secs: 0.0,
            cache_hit_delay_max_secs: 0.0,
            length_fallback_model: None,
            transient_retries: 0,
            cache_path: SqliteCompletionCache::default_path(),
            api_base_url: DEFAULT_BASE_URL.into(),
            api_timeout_secs: 120,
            output_dir: PathBuf::from("output"),
            variants: default_variants(),
        }
    }
}

impl RunConfig {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Override fields from `RAIDRAFT_*` variables. `lookup` is injected so
    /// tests don't touch the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(model) = lookup("RAIDRAFT_MODEL") {
            self.model = model;
        }
        if let Some(url) = lookup("RAIDRAFT_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(path) = lookup("RAIDRAFT_CACHE_PATH") {
            self.cache_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("RAIDRAFT_TIMEOUT_SECONDS") {
            self.api_timeout_secs = raw
                .trim()
                .parse()
                .map_err(|_| invalid("RAIDRAFT_TIMEOUT_SECONDS", format!("not a number: {raw}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(invalid("model", "must not be empty"));
        }
        if !(self.compression_rate > 0.0 && self.compression_rate <= 1.0) {
            return Err(invalid(
                "compression_rate",
                format!("{} is outside (0, 1]", self.compression_rate),
            ));
        }
        if self.cache_hit_delay_min_secs < 0.0
            || self.cache_hit_delay_min_secs > self.cache_hit_delay_max_secs
        {
            return Err(invalid(
                "cache_hit_delay_min_secs",
                format!(
                    "{} must be between 0 and cache_hit_delay_max_secs ({})",
                    self.cache_hit_delay_min_secs, self.cache_hit_delay_max_secs
                ),
            ));
        }
        if self.api_timeout_secs == 0 {
            return Err(invalid("api_timeout_secs", "must be greater than 0"));
        }
        let mut seen = HashSet::new();
        for variant in &self.variants {
            if !seen.insert(variant.name.as_str()) {
                return Err(invalid("variants", format!("duplicate variant name '{}'", variant.name)));
            }
        }
        Ok(())
    }

    pub fn invoke_options(&self) -> InvokeOptions {
        let hit_delay = (self.cache_hit_delay_max_secs > 0.0).then(|| {
            (
                Duration::from_secs_f64(self.cache_hit_delay_min_secs),
                Duration::from_secs_f64(self.cache_hit_delay_max_secs),
            )
        });
        InvokeOptions {
            rebuild_cache: self.rebuild_cache,
            hit_delay,
            length_fallback_model: self.length_fallback_model.clone(),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.transient_retries,
            ..GatewayConfig::default()
        }
    }

    /// Adapter settings; the API key always comes from the environment.
    pub fn adapter_config(&self) -> Result<AdapterConfig, ConfigError> {
        let api_key = std::env::var("RAIDRAFT_API_KEY")
            .map_err(|_| ConfigError::MissingEnv("RAIDRAFT_API_KEY"))?;
        let mut adapter = AdapterConfig::new(api_key)
            .base_url(self.api_base_url.clone())
            .timeout(Duration::from_secs(self.api_timeout_secs));
        if let Ok(version) = std::env::var("RAIDRAFT_AZURE_API_VERSION") {
            adapter = adapter.azure(version);
        }
        Ok(adapter)
    }
}
