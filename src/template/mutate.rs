//! Placeholder replacement and unit pruning over a document body.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::body::{
    edit_run_text, for_each_paragraph_mut, paragraph_text, runs_mut, set_paragraph_text, text_nodes,
    Element, Node,
};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"##\w+").expect("Invalid placeholder regex"));

/// Outcome of a replacement pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaceStats {
    pub replaced: usize,
    /// Paragraphs rebuilt because a placeholder spanned runs.
    pub rebuilt_paragraphs: usize,
    /// Placeholders with no value, left literal.
    pub unresolved: BTreeSet<String>,
}

/// Which template block repeats per unit and where the repeated area ends.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitLayout {
    pub marker_prefix: String,
    pub stop_marker: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneStats {
    pub units_found: usize,
    pub removed_units: Vec<usize>,
    /// Units kept because retained content still uses one of their placeholders.
    pub protected_units: Vec<usize>,
}

fn resolvable<'a>(text: &'a str, map: &BTreeMap<String, String>) -> Vec<&'a str> {
    PLACEHOLDER
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|t| map.contains_key(*t))
        .collect()
}

/// Replace known placeholders in `text`; unknown ones stay literal.
pub fn replace_tokens(
    text: &str,
    map: &BTreeMap<String, String>,
    unresolved: &mut BTreeSet<String>,
) -> (String, usize) {
    let mut count = 0;
    let out = PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
        let token = &caps[0];
        match map.get(token) {
            Some(value) => {
                count += 1;
                value.trim().to_string()
            }
            None => {
                unresolved.insert(token.to_string());
                token.to_string()
            }
        }
    });
    (out.into_owned(), count)
}

/// One pass over every paragraph, applying the whole map at once.
pub fn replace_placeholders(body: &mut Element, map: &BTreeMap<String, String>) -> ReplaceStats {
    let mut stats = ReplaceStats::default();
    for_each_paragraph_mut(body, &mut |paragraph| {
        let text = paragraph_text(paragraph);
        if !text.contains("##") {
            return;
        }
        let wanted = resolvable(&text, map);
        if wanted.is_empty() {
            for m in PLACEHOLDER.find_iter(&text) {
                stats.unresolved.insert(m.as_str().to_string());
            }
            return;
        }

        // Placeholders wholly inside single text nodes can be edited in place.
        let mut in_nodes = Vec::new();
        for run in runs_mut(paragraph) {
            for node_text in text_nodes(run) {
                in_nodes.extend(resolvable(&node_text, map).into_iter().map(str::to_string));
            }
        }
        let mut wanted_sorted: Vec<String> = wanted.iter().map(|s| s.to_string()).collect();
        wanted_sorted.sort();
        in_nodes.sort();

        if wanted_sorted == in_nodes {
            for run in runs_mut(paragraph) {
                edit_run_text(run, &mut |old| {
                    let (new, n) = replace_tokens(old, map, &mut stats.unresolved);
                    stats.replaced += n;
                    (n > 0).then_some(new)
                });
            }
        } else {
            let (new, n) = replace_tokens(&text, map, &mut stats.unresolved);
            stats.replaced += n;
            stats.rebuilt_paragraphs += 1;
            set_paragraph_text(paragraph, &new);
        }
    });
    stats
}

fn element_text(el: &Element) -> String {
    if el.is("w:p") {
        return paragraph_text(el);
    }
    let mut parts = Vec::new();
    super::body::for_each_paragraph(el, &mut |p| parts.push(paragraph_text(p)));
    parts.join("\n")
}

fn placeholders(text: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Remove repeated units numbered above `populated`.
///
/// Unit `k` starts at the last `<prefix>k` paragraph before the stop marker
/// and runs to the next unit start or the stop marker. Without a stop marker
/// nothing is pruned.
pub fn prune_units(body: &mut Element, layout: &UnitLayout, populated: usize) -> PruneStats {
    let marker = match Regex::new(&format!(r"{}(\d+)", regex::escape(&layout.marker_prefix))) {
        Ok(re) => re,
        Err(err) => {
            tracing::warn!(error = %err, "invalid unit marker; pruning skipped");
            return PruneStats::default();
        }
    };
    let stop = layout.stop_marker.to_lowercase();

    let texts: Vec<(usize, bool, String)> = body
        .children
        .iter()
        .enumerate()
        .filter_map(|(i, node)| match node {
            Node::Element(el) => Some((i, el.is("w:p"), element_text(el))),
            _ => None,
        })
        .collect();

    let unit_of = |text: &str| -> Option<usize> {
        marker
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    };

    let Some(last_marker) = texts
        .iter()
        .rev()
        .find(|(_, is_p, text)| *is_p && unit_of(text).is_some())
        .map(|(i, _, _)| *i)
    else {
        return PruneStats::default();
    };
    let Some(stop_at) = texts
        .iter()
        .find(|(i, is_p, text)| *i > last_marker && *is_p && text.to_lowercase().contains(&stop))
        .map(|(i, _, _)| *i)
    else {
        tracing::warn!(stop = %layout.stop_marker, "stop marker not found; pruning skipped");
        return PruneStats::default();
    };

    let mut starts: HashMap<usize, usize> = HashMap::new();
    for (i, is_p, text) in &texts {
        if *is_p && *i < stop_at {
            if let Some(k) = unit_of(text) {
                starts.insert(k, *i);
            }
        }
    }
    let mut ordered: Vec<(usize, usize)> = starts.into_iter().map(|(k, i)| (i, k)).collect();
    ordered.sort();

    // (unit, start, end) with end exclusive
    let spans: Vec<(usize, usize, usize)> = ordered
        .iter()
        .enumerate()
        .map(|(n, (start, k))| {
            let end = ordered.get(n + 1).map(|(s, _)| *s).unwrap_or(stop_at);
            (*k, *start, end)
        })
        .collect();

    let mut stats = PruneStats {
        units_found: spans.len(),
        ..PruneStats::default()
    };
    let candidates: Vec<&(usize, usize, usize)> = spans.iter().filter(|(k, _, _)| *k > populated).collect();
    if candidates.is_empty() {
        return stats;
    }

    let in_candidate = |i: usize| candidates.iter().any(|(_, s, e)| i >= *s && i < *e);
    let retained: BTreeSet<String> = texts
        .iter()
        .filter(|(i, _, _)| !in_candidate(*i))
        .flat_map(|(_, _, text)| placeholders(text))
        .collect();

    let mut remove = vec![false; body.children.len()];
    for (k, start, end) in candidates {
        let inside: BTreeSet<String> = texts
            .iter()
            .filter(|(i, _, _)| i >= start && i < end)
            .flat_map(|(_, _, text)| placeholders(text))
            .collect();
        let shared: Vec<&String> = inside.intersection(&retained).collect();
        if shared.is_empty() {
            remove[*start..*end].iter_mut().for_each(|r| *r = true);
            stats.removed_units.push(*k);
        } else {
            tracing::warn!(
                unit = *k,
                shared = ?shared,
                "unit kept: its placeholders are still used elsewhere"
            );
            stats.protected_units.push(*k);
        }
    }

    let children = std::mem::take(&mut body.children);
    body.children = children
        .into_iter()
        .zip(remove)
        .filter_map(|(node, drop)| (!drop).then_some(node))
        .collect();
    stats.removed_units.sort_unstable();
    stats
}
