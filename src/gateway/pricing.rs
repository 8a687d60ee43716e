//! Model pricing and capability registry.
//!
//! Prices are stored as nano-euros per 1000 tokens, which keeps every
//! published rate an exact integer. Multiplying a token count by a rate
//! yields a cost in pico-euros (1e-12 EUR), so aggregation never rounds.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Serialize;

/// Pico-euros per euro.
pub const PICOS_PER_EUR: i64 = 1_000_000_000_000;

/// Capability class of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelClass {
    /// Accepts sampling parameters and a hard output cap.
    Standard,
    /// Rejects sampling parameters, takes a reasoning effort instead, bills
    /// hidden reasoning tokens.
    Reasoning,
}

impl ModelClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Standard => "standard",
            ModelClass::Reasoning => "reasoning",
        }
    }
}

/// Which request field carries the output-length cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenParam {
    MaxTokens,
    MaxCompletionTokens,
}

impl TokenParam {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenParam::MaxTokens => "max_tokens",
            TokenParam::MaxCompletionTokens => "max_completion_tokens",
        }
    }
}

/// Pricing and capability metadata for a model.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelSpec {
    /// Cost per 1000 input tokens in nano-euros.
    pub input_nanos_per_1k: i64,
    /// Cost per 1000 output tokens in nano-euros.
    pub output_nanos_per_1k: i64,
    /// Cost per 1000 cached input tokens, when the provider discounts them.
    pub cached_input_nanos_per_1k: Option<i64>,
    pub context_window: Option<u32>,
    pub class: ModelClass,
}

impl ModelSpec {
    const fn standard(input: i64, output: i64, context_window: Option<u32>) -> Self {
        Self {
            input_nanos_per_1k: input,
            output_nanos_per_1k: output,
            cached_input_nanos_per_1k: None,
            context_window,
            class: ModelClass::Standard,
        }
    }

    const fn reasoning(input: i64, output: i64, context_window: Option<u32>) -> Self {
        Self {
            input_nanos_per_1k: input,
            output_nanos_per_1k: output,
            cached_input_nanos_per_1k: None,
            context_window,
            class: ModelClass::Reasoning,
        }
    }

    const fn cached_input(mut self, nanos_per_1k: i64) -> Self {
        self.cached_input_nanos_per_1k = Some(nanos_per_1k);
        self
    }

    /// Input cost in pico-euros.
    pub fn input_cost(&self, tokens: u32) -> i64 {
        (tokens as i64) * self.input_nanos_per_1k
    }

    /// Output cost in pico-euros. Callers pass visible plus reasoning tokens.
    pub fn output_cost(&self, tokens: u32) -> i64 {
        (tokens as i64) * self.output_nanos_per_1k
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::for_class(self.class)
    }
}

/// Request parameters a model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub class: ModelClass,
    pub supports_sampling: bool,
    pub supports_output_cap: bool,
    pub supports_reasoning_effort: bool,
    pub supports_json_mode: bool,
    pub token_param: TokenParam,
}

impl Capabilities {
    fn for_class(class: ModelClass) -> Self {
        match class {
            ModelClass::Standard => Self {
                class,
                supports_sampling: true,
                supports_output_cap: true,
                supports_reasoning_effort: false,
                supports_json_mode: true,
                token_param: TokenParam::MaxTokens,
            },
            ModelClass::Reasoning => Self {
                class,
                supports_sampling: false,
                supports_output_cap: false,
                supports_reasoning_effort: true,
                supports_json_mode: true,
                token_param: TokenParam::MaxCompletionTokens,
            },
        }
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// Rates in EUR per 1K tokens, input / output. Verify against the provider
// price sheet when adding models.
//
// gpt-3.5-turbo-0125: 0.0005 / 0.0014
// gpt-4-turbo:        0.010 / 0.028
// gpt-4:              0.028 / 0.056
// gpt-4-32k:          0.056 / 0.112
// gpt-4o:             0.0047 / 0.0139
// gpt-4o-mini:        0.00014277 / 0.0005711
// gpt-4.1:            0.00173 / 0.00691
// o1-mini, o3-mini:   0.001047 / 0.004187884
// gpt-5:              0.00108 / 0.00863
// azureai (Mistral Large): 0.0074088 / 0.0222264

const GPT_35_TURBO: ModelSpec = ModelSpec::standard(500_000, 1_400_000, Some(16_000));
const GPT_4_TURBO: ModelSpec = ModelSpec::standard(10_000_000, 28_000_000, Some(128_000));
const GPT_4: ModelSpec = ModelSpec::standard(28_000_000, 56_000_000, Some(8_000));
const GPT_4_32K: ModelSpec = ModelSpec::standard(56_000_000, 112_000_000, Some(32_000));
const GPT_4O: ModelSpec =
    ModelSpec::standard(4_700_000, 13_900_000, Some(128_000)).cached_input(2_350_000);
const GPT_4O_MINI: ModelSpec = ModelSpec::standard(142_770, 571_100, Some(128_000));
const GPT_41: ModelSpec = ModelSpec::standard(1_730_000, 6_910_000, Some(1_000_000));
const GPT_41_MINI: ModelSpec = ModelSpec::standard(350_000, 1_390_000, Some(1_000_000));
const GPT_41_NANO: ModelSpec = ModelSpec::standard(90_000, 350_000, Some(1_000_000));
const O1_MINI: ModelSpec = ModelSpec::reasoning(1_047_000, 4_187_884, Some(128_000));
const O3_MINI: ModelSpec = ModelSpec::reasoning(1_047_000, 4_187_884, Some(200_000));
const O4_MINI: ModelSpec = ModelSpec::reasoning(950_000, 3_800_000, Some(200_000));
const GPT_5: ModelSpec =
    ModelSpec::reasoning(1_080_000, 8_630_000, Some(400_000)).cached_input(108_000);
const GPT_5_MINI: ModelSpec = ModelSpec::reasoning(220_000, 1_730_000, Some(400_000));
const MISTRAL_LARGE: ModelSpec = ModelSpec::standard(7_408_800, 22_226_400, Some(32_000));

/// Id prefixes that mark a reasoning-class model when it is not listed.
const REASONING_PREFIXES: &[&str] = &["gpt-5", "o1", "o3", "o4"];

static REGISTRY: OnceLock<HashMap<&'static str, ModelSpec>> = OnceLock::new();

fn init_registry() -> HashMap<&'static str, ModelSpec> {
    let mut map = HashMap::new();

    map.insert("gpt-3.5-turbo-0125", GPT_35_TURBO);
    map.insert("gpt-4-turbo", GPT_4_TURBO);
    map.insert("gpt-4", GPT_4);
    map.insert("gpt-4-32k", GPT_4_32K);
    map.insert("gpt-4o", GPT_4O);
    map.insert("gpt-4o-mini", GPT_4O_MINI);
    map.insert("gpt-4.1", GPT_41);
    map.insert("gpt-4.1-mini", GPT_41_MINI);
    map.insert("gpt-4.1-nano", GPT_41_NANO);
    map.insert("o1-mini", O1_MINI);
    map.insert("o3-mini", O3_MINI);
    map.insert("o4-mini", O4_MINI);
    map.insert("gpt-5", GPT_5);
    map.insert("gpt-5-mini", GPT_5_MINI);
    map.insert("azureai", MISTRAL_LARGE);

    map
}

/// Strip a routing prefix like `openai/` from a model id.
fn bare_model_id(model_id: &str) -> &str {
    model_id.rsplit('/').next().unwrap_or(model_id)
}

/// Get the registry entry for a model.
pub fn get_spec(model_id: &str) -> Option<ModelSpec> {
    let map = REGISTRY.get_or_init(init_registry);
    map.get(bare_model_id(model_id)).copied()
}

/// All registered models, sorted by id.
pub fn registered_models() -> Vec<(&'static str, ModelSpec)> {
    let map = REGISTRY.get_or_init(init_registry);
    let mut models: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
    models.sort_by(|a, b| a.0.cmp(b.0));
    models
}

/// Whether a model is reasoning-class. Listed models use their metadata,
/// unlisted ones fall back to well-known id prefixes.
pub fn is_reasoning_model(model_id: &str) -> bool {
    if let Some(spec) = get_spec(model_id) {
        return spec.class == ModelClass::Reasoning;
    }
    let id = bare_model_id(model_id).to_ascii_lowercase();
    REASONING_PREFIXES.iter().any(|p| id.starts_with(p))
}

/// Capabilities for any model id, listed or not.
pub fn capabilities(model_id: &str) -> Capabilities {
    let class = if is_reasoning_model(model_id) {
        ModelClass::Reasoning
    } else {
        ModelClass::Standard
    };
    let mut caps = Capabilities::for_class(class);
    let id = bare_model_id(model_id).to_ascii_lowercase();
    if id.contains("32k") || id.contains("mistral") || id == "azureai" {
        caps.supports_json_mode = false;
    }
    caps
}

/// Split cost of a chat call in pico-euros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallCost {
    pub input_picos: i64,
    pub output_picos: i64,
}

impl CallCost {
    pub fn total(&self) -> i64 {
        self.input_picos.saturating_add(self.output_picos)
    }
}

/// Price a chat call. Reasoning tokens are billed at the output rate.
///
/// Unknown models price at zero so a missing registry entry never blocks a
/// run; the caller sees a warning instead.
pub fn chat_cost(
    model_id: &str,
    input_tokens: u32,
    output_tokens: u32,
    reasoning_tokens: u32,
) -> CallCost {
    match get_spec(model_id) {
        Some(spec) => CallCost {
            input_picos: spec.input_cost(input_tokens),
            output_picos: spec.output_cost(output_tokens.saturating_add(reasoning_tokens)),
        },
        None => {
            tracing::warn!(model = %model_id, "no pricing for model; cost recorded as zero");
            CallCost::default()
        }
    }
}

/// Format a pico-euro amount as euros with six decimals.
pub fn format_eur(picos: i64) -> String {
    let sign = if picos < 0 { "-" } else { "" };
    let abs = picos.unsigned_abs();
    let micros = (abs + 500_000) / 1_000_000;
    format!("{sign}€{}.{:06}", micros / 1_000_000, micros % 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_cost_standard() {
        // gpt-4o, 1000 input + 1000 output
        // Input: 1000 * 4_700_000 = 4.7e9 picos = 0.0047 EUR
        // Output: 1000 * 13_900_000 = 1.39e10 picos = 0.0139 EUR
        let cost = chat_cost("gpt-4o", 1_000, 1_000, 0);
        assert_eq!(cost.input_picos, 4_700_000_000);
        assert_eq!(cost.output_picos, 13_900_000_000);
    }

    #[test]
    fn test_reasoning_tokens_billed_as_output() {
        // gpt-5: 50 visible + 150 reasoning = 200 output tokens
        // 200 * 8_630_000 = 1_726_000_000 picos
        let cost = chat_cost("gpt-5", 0, 50, 150);
        assert_eq!(cost.output_picos, 1_726_000_000);
    }

    #[test]
    fn test_unknown_model_costs_zero() {
        let cost = chat_cost("mystery-model", 10_000, 10_000, 0);
        assert_eq!(cost.total(), 0);
    }

    #[test]
    fn test_routing_prefix_is_ignored() {
        assert!(get_spec("openai/gpt-4o-mini").is_some());
        assert!(is_reasoning_model("openai/gpt-5-mini"));
    }

    #[test]
    fn test_reasoning_prefix_fallback() {
        assert!(is_reasoning_model("o3-pro"));
        assert!(is_reasoning_model("gpt-5-nano"));
        assert!(!is_reasoning_model("gpt-4o"));
        assert!(!is_reasoning_model("omni-moderation"));
    }

    #[test]
    fn test_capabilities() {
        let std_caps = capabilities("gpt-4.1");
        assert!(std_caps.supports_sampling);
        assert!(std_caps.supports_output_cap);
        assert_eq!(std_caps.token_param, TokenParam::MaxTokens);

        let reasoning = capabilities("o4-mini");
        assert!(!reasoning.supports_sampling);
        assert!(!reasoning.supports_output_cap);
        assert!(reasoning.supports_reasoning_effort);

        assert!(!capabilities("gpt-4-32k").supports_json_mode);
    }

    #[test]
    fn test_format_eur() {
        assert_eq!(format_eur(4_700_000_000), "€0.004700");
        assert_eq!(format_eur(PICOS_PER_EUR * 3 / 2), "€1.500000");
    }
}
