//! Coerce near-valid model output into well-formed JSON.
//!
//! Validate first, repair second: a strict parse is always attempted before
//! any heuristic touches the text. Heuristics run in a fixed order and the
//! first one that yields valid JSON wins. When none does, the caller gets
//! [`Normalized::Empty`] with a reason, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Known key misspellings emitted by models, mapped to canonical names.
const KEY_ALIASES: &[(&str, &str)] = &[
    ("inteduse_answers", "intendeduse_answers"),
    ("inteduse_fairness_answers", "intendeduse_fairness_answers"),
    ("inteduse_id", "intendeduse_id"),
    ("intended_use_id", "intendeduse_id"),
    ("stakeholders", "StakeHolders"),
    ("Stakeholders", "StakeHolders"),
];

/// Bound on truncation repair attempts.
const MAX_REPAIR_CUTS: usize = 8;

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("Invalid trailing comma regex"));

/// What a step expects back from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected<'a> {
    Json { main_key: &'a str },
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// A JSON object guaranteed to contain the expected main key.
    Json(Value),
    Text(String),
    /// Nothing usable; the step contributes no tokens.
    Empty { reason: String },
}

impl Normalized {
    pub fn is_empty(&self) -> bool {
        matches!(self, Normalized::Empty { .. })
    }

    fn empty(reason: impl Into<String>) -> Self {
        Normalized::Empty {
            reason: reason.into(),
        }
    }
}

pub fn normalize(raw: &str, expected: Expected<'_>) -> Normalized {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Normalized::empty("empty answer");
    }

    match expected {
        Expected::Text => Normalized::Text(trimmed.to_string()),
        Expected::Json { main_key } => match parse_lenient(trimmed) {
            Some(value) => match shape(canonicalize_keys(value), main_key) {
                Some(v) => Normalized::Json(v),
                None => Normalized::empty("answer is not a JSON object or array"),
            },
            None => {
                let preview: String = trimmed.chars().take(120).collect();
                Normalized::empty(format!("unparseable JSON answer: {preview}"))
            }
        },
    }
}

/// Strict parse, then the repair ladder.
fn parse_lenient(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return Some(v);
    }

    let unfenced = strip_code_fences(text);
    if let Ok(v) = serde_json::from_str::<Value>(unfenced) {
        return Some(v);
    }

    let span = extract_json(unfenced);
    if let Ok(v) = serde_json::from_str::<Value>(span) {
        return Some(v);
    }

    let decomma = TRAILING_COMMA.replace_all(span, "$1");
    if let Ok(v) = serde_json::from_str::<Value>(&decomma) {
        return Some(v);
    }

    repair_truncated(&decomma)
}

/// Take the body of the first fenced block, if any.
fn strip_code_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after_open = &text[open + 3..];
    // Skip the info string (e.g. "json") up to the end of the line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Extract the outermost JSON object or array from potentially noisy output.
///
/// Handles pure JSON, JSON embedded in prose and unterminated JSON (the tail
/// from the opening bracket is returned for repair).
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let start = match (trimmed.find('{'), trimmed.find('[')) {
        (Some(o), Some(a)) => o.min(a),
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return trimmed,
    };
    let remainder = &trimmed[start..];
    match find_matching_bracket(remainder) {
        Some(end) => &remainder[..end],
        None => remainder,
    }
}

/// Byte offset just past the bracket closing the first one, respecting
/// JSON strings so brackets inside `"..."` are not counted.
fn find_matching_bracket(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Close whatever a truncated answer left open. When the cut falls in an
/// awkward place (after a key, mid-literal), back off to the previous comma.
fn repair_truncated(text: &str) -> Option<Value> {
    let mut candidate = text.trim_end().to_string();
    for _ in 0..MAX_REPAIR_CUTS {
        if let Some(closed) = close_open_brackets(&candidate) {
            if let Ok(v) = serde_json::from_str::<Value>(&closed) {
                return Some(v);
            }
        }
        let cut = last_structural_comma(&candidate)?;
        candidate.truncate(cut);
    }
    None
}

fn close_open_brackets(text: &str) -> Option<String> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for c in text.chars() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return None;
    }

    let mut out = text.to_string();
    if in_string {
        out.push('"');
    }
    let body = out.trim_end();
    let body = body.strip_suffix(',').unwrap_or(body).to_string();
    let mut out = if body.ends_with(':') {
        format!("{body} null")
    } else {
        body
    };
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    Some(out)
}

fn last_structural_comma(text: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escape = false;
    let mut last = None;
    for (i, c) in text.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if !in_string && c == ',' {
            last = Some(i);
        }
    }
    last
}

fn canonicalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let key = KEY_ALIASES
                        .iter()
                        .find(|(alias, _)| *alias == k)
                        .map(|(_, canonical)| canonical.to_string())
                        .unwrap_or(k);
                    (key, canonicalize_keys(v))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize_keys).collect()),
        other => other,
    }
}

/// Guarantee the top level is an object carrying `main_key`.
fn shape(value: Value, main_key: &str) -> Option<Value> {
    let mut map = match value {
        Value::Array(_) => {
            let mut map = Map::new();
            map.insert(main_key.to_string(), value);
            return Some(Value::Object(map));
        }
        Value::Object(map) => map,
        _ => return None,
    };

    if map.contains_key(main_key) {
        return Some(Value::Object(map));
    }

    if let Some(found) = map
        .keys()
        .find(|k| k.eq_ignore_ascii_case(main_key))
        .cloned()
    {
        return Some(Value::Object(rename_key(map, &found, main_key)));
    }

    let nested = map.values().any(|v| match v {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().any(Value::is_object),
        _ => false,
    });

    if !nested {
        // A flat object is the section body itself.
        let mut wrapped = Map::new();
        wrapped.insert(main_key.to_string(), Value::Object(map));
        return Some(Value::Object(wrapped));
    }

    let first = map.keys().next().cloned()?;
    map = rename_key(map, &first, main_key);
    Some(Value::Object(map))
}

/// Rename a key in place, keeping its position.
fn rename_key(map: Map<String, Value>, from: &str, to: &str) -> Map<String, Value> {
    map.into_iter()
        .map(|(k, v)| if k == from { (to.to_string(), v) } else { (k, v) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_of(raw: &str, key: &str) -> Value {
        match normalize(raw, Expected::Json { main_key: key }) {
            Normalized::Json(v) => v,
            other => panic!("expected JSON, got {other:?}"),
        }
    }

    #[test]
    fn test_prose_is_stripped() {
        let raw = r#"Here is the JSON: {"intendedUses": ["a","b"]} Thanks!"#;
        assert_eq!(json_of(raw, "intendedUses"), json!({"intendedUses": ["a", "b"]}));
    }

    #[test]
    fn test_code_fence_is_stripped() {
        let raw = "```json\n{\"risksofuse\": {\"known_limitations\": \"x\"}}\n```";
        assert_eq!(
            json_of(raw, "risksofuse"),
            json!({"risksofuse": {"known_limitations": "x"}})
        );
    }

    #[test]
    fn test_truncated_output_is_closed() {
        let raw = r#"{"intendeduses": [{"name": "Triage", "description": "Ranks refer"#;
        let v = json_of(raw, "intendeduses");
        assert_eq!(v["intendeduses"][0]["name"], "Triage");
        assert_eq!(v["intendeduses"][0]["description"], "Ranks refer");
    }

    #[test]
    fn test_truncated_after_key_backs_off() {
        let raw = r#"{"intendeduses": [{"name": "A"}, {"name": "B", "descr"#;
        let v = json_of(raw, "intendeduses");
        assert_eq!(v["intendeduses"][0]["name"], "A");
        assert_eq!(v["intendeduses"][1]["name"], "B");
    }

    #[test]
    fn test_trailing_comma_removed() {
        let raw = r#"{"fitnessforpurpose": [{"intendeduse_id": "intended_use_01",},]}"#;
        let v = json_of(raw, "fitnessforpurpose");
        assert_eq!(v["fitnessforpurpose"][0]["intendeduse_id"], "intended_use_01");
    }

    #[test]
    fn test_top_level_array_is_wrapped() {
        let v = json_of(r#"[{"name": "a"}]"#, "intendeduses");
        assert_eq!(v, json!({"intendeduses": [{"name": "a"}]}));
    }

    #[test]
    fn test_flat_object_is_wrapped() {
        let raw = r#"{"disclosure_of_ai_interaction_applies": true, "explanation": "chat"}"#;
        let v = json_of(raw, "disclosureofaiinteraction");
        assert_eq!(v["disclosureofaiinteraction"]["explanation"], "chat");
    }

    #[test]
    fn test_misnamed_main_key_is_renamed() {
        let raw = r#"{"stakeholder_list": [{"intendeduse_id": "intended_use_01"}]}"#;
        let v = json_of(raw, "intendeduse_stakeholder");
        assert!(v.get("intendeduse_stakeholder").is_some());
        assert!(v.get("stakeholder_list").is_none());
    }

    #[test]
    fn test_aliases_are_canonicalized() {
        let raw = r#"{"inteduse_answers": [{"inteduse_id": "intended_use_01", "answers": []}]}"#;
        let v = json_of(raw, "intendeduse_answers");
        assert_eq!(v["intendeduse_answers"][0]["intendeduse_id"], "intended_use_01");
    }

    #[test]
    fn test_garbage_is_empty_not_error() {
        let out = normalize("I could not produce an answer.", Expected::Json { main_key: "x" });
        assert!(out.is_empty());
        assert!(normalize("   ", Expected::Text).is_empty());
    }

    #[test]
    fn test_text_passes_through() {
        assert_eq!(
            normalize("  Some feedback.\n", Expected::Text),
            Normalized::Text("Some feedback.".into())
        );
    }

    #[test]
    fn test_extract_json_braces_in_strings() {
        let wrapped = r#"Here is the result: {"desc": "a {b} c", "x": 2} done"#;
        assert_eq!(extract_json(wrapped), r#"{"desc": "a {b} c", "x": 2}"#);
    }
}
