//! Optional prompt compression.
//!
//! Prompts may mark regions with
//! `<llmlingua, rate=0.5, compress=False>...</llmlingua>`. Text outside any
//! tag is compressed at the global rate. When compression is off the tags are
//! stripped and the prompt is otherwise untouched.
//!
//! The reducer is deterministic: it keeps the highest-information words of
//! each segment up to the segment's rate, always keeping words that close a
//! sentence or a line, and never reorders anything.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Global rate used when a segment does not name its own.
pub const DEFAULT_RATE: f32 = 0.33;

static TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<llmlingua((?:\s*,\s*[A-Za-z_]+\s*=\s*[^,>]*)*)\s*>(.*?)</llmlingua>")
        .expect("Invalid llmlingua tag regex")
});

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+\s*").expect("Invalid word regex"));

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

const FORCE_ENDINGS: &[char] = &['!', '.', '?', ':'];

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "for", "from", "has", "have",
    "in", "into", "is", "it", "its", "of", "on", "or", "that", "the", "their", "there", "these",
    "this", "those", "to", "was", "were", "which", "will", "with", "would",
];

#[derive(Debug, Error, PartialEq)]
pub enum CompressionError {
    #[error("compression rate must be in (0, 1], got {0}")]
    InvalidRate(f32),
    #[error("invalid compression attribute `{0}`")]
    InvalidAttribute(String),
}

/// One region of a prompt with its own compression settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub text: String,
    pub rate: f32,
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressedPrompt {
    pub text: String,
    pub origin_tokens: usize,
    pub compressed_tokens: usize,
}

impl CompressedPrompt {
    /// Compressed size as a fraction of the original.
    pub fn ratio(&self) -> f64 {
        if self.origin_tokens == 0 {
            1.0
        } else {
            self.compressed_tokens as f64 / self.origin_tokens as f64
        }
    }
}

/// Count tokens with the cl100k tokenizer, or whitespace words if the
/// tokenizer tables cannot be loaded.
pub fn count_tokens(text: &str) -> usize {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.split_whitespace().count(),
    }
}

fn validate_rate(rate: f32) -> Result<f32, CompressionError> {
    if rate.is_nan() || rate <= 0.0 || rate > 1.0 {
        return Err(CompressionError::InvalidRate(rate));
    }
    Ok(rate)
}

/// Remove all compression markup, keeping the enclosed text.
pub fn strip_markup(prompt: &str) -> String {
    TAG.replace_all(prompt, "$2").into_owned()
}

/// Split a prompt into segments.
pub fn parse_segments(prompt: &str, global_rate: f32) -> Result<Vec<Segment>, CompressionError> {
    let global_rate = validate_rate(global_rate)?;
    let mut segments = Vec::new();
    let mut cursor = 0;

    for caps in TAG.captures_iter(prompt) {
        let (Some(whole), Some(attrs), Some(body)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        if whole.start() > cursor {
            segments.push(Segment {
                text: prompt[cursor..whole.start()].to_string(),
                rate: global_rate,
                compress: true,
            });
        }

        let mut rate = None;
        let mut compress = true;
        for attr in attrs.as_str().split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let (key, value) = attr
                .split_once('=')
                .ok_or_else(|| CompressionError::InvalidAttribute(attr.to_string()))?;
            match key.trim() {
                "rate" => {
                    let parsed: f32 = value
                        .trim()
                        .parse()
                        .map_err(|_| CompressionError::InvalidAttribute(attr.to_string()))?;
                    rate = Some(validate_rate(parsed)?);
                }
                "compress" => {
                    compress = match value.trim().to_ascii_lowercase().as_str() {
                        "true" => true,
                        "false" => false,
                        _ => return Err(CompressionError::InvalidAttribute(attr.to_string())),
                    };
                }
                _ => return Err(CompressionError::InvalidAttribute(attr.to_string())),
            }
        }

        let rate = match (compress, rate) {
            (_, Some(r)) => r,
            (true, None) => global_rate,
            (false, None) => 1.0,
        };
        segments.push(Segment {
            text: body.as_str().to_string(),
            rate,
            compress,
        });
        cursor = whole.end();
    }

    if cursor < prompt.len() {
        segments.push(Segment {
            text: prompt[cursor..].to_string(),
            rate: global_rate,
            compress: true,
        });
    }

    Ok(segments)
}

/// Compress a prompt according to its markup.
pub fn compress_prompt(prompt: &str, global_rate: f32) -> Result<CompressedPrompt, CompressionError> {
    let segments = parse_segments(prompt, global_rate)?;
    let text: String = segments
        .iter()
        .map(|s| {
            if s.compress && s.rate < 1.0 {
                reduce_segment(&s.text, s.rate)
            } else {
                s.text.clone()
            }
        })
        .collect();

    let origin_tokens = count_tokens(&strip_markup(prompt));
    let compressed_tokens = count_tokens(&text);
    tracing::debug!(
        origin_tokens,
        compressed_tokens,
        "compressed prompt"
    );

    Ok(CompressedPrompt {
        text,
        origin_tokens,
        compressed_tokens,
    })
}

struct Word<'a> {
    text: &'a str,
    trailing: &'a str,
    forced: bool,
    score: usize,
}

fn score_word(word: &str) -> usize {
    let bare: String = word
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if bare.is_empty() || STOPWORDS.contains(&bare.as_str()) {
        return 0;
    }
    let mut score = bare.chars().count();
    let informative = word.chars().any(|c| c.is_ascii_digit())
        || word.chars().next().is_some_and(char::is_uppercase);
    if informative {
        score += 3;
    }
    score
}

fn reduce_segment(text: &str, rate: f32) -> String {
    let leading_len = text.len() - text.trim_start().len();
    let leading = &text[..leading_len];

    let words: Vec<Word<'_>> = WORD
        .find_iter(&text[leading_len..])
        .map(|m| {
            let raw = m.as_str();
            let trimmed = raw.trim_end();
            let trailing = &raw[trimmed.len()..];
            Word {
                text: trimmed,
                trailing,
                forced: trimmed.ends_with(FORCE_ENDINGS) || trailing.contains('\n'),
                score: score_word(trimmed),
            }
        })
        .collect();

    if words.is_empty() {
        return text.to_string();
    }

    let budget = ((words.len() as f64) * f64::from(rate)).ceil() as usize;
    let mut keep: HashSet<usize> = words
        .iter()
        .enumerate()
        .filter(|(_, w)| w.forced)
        .map(|(i, _)| i)
        .collect();

    let mut candidates: Vec<usize> = (0..words.len()).filter(|i| !keep.contains(i)).collect();
    candidates.sort_by(|a, b| words[*b].score.cmp(&words[*a].score).then(a.cmp(b)));
    let remaining = budget.saturating_sub(keep.len());
    keep.extend(candidates.into_iter().take(remaining));

    let last_kept = (0..words.len()).rev().find(|i| keep.contains(i));
    let mut out = String::from(leading);
    for (idx, word) in words.iter().enumerate() {
        if !keep.contains(&idx) {
            continue;
        }
        out.push_str(word.text);
        if Some(idx) == last_kept {
            out.push_str(word.trailing);
        } else if word.trailing.contains('\n') {
            out.push_str(&word.trailing.replace([' ', '\t'], ""));
        } else {
            out.push(' ');
        }
    }
    out
}
