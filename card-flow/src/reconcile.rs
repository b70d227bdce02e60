//! Turns the service's free-text replies into typed records.
//!
//! The reply is untrusted: it may wrap the JSON in prose or code fences, use
//! slightly different key names, omit slides, or mention slides nobody asked for.
//! Everything is coerced into [`SlideResult`]/[`CardRecord`] here; raw JSON never
//! leaves this module.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::cloze;
use crate::error::ParseFailure;
use crate::types::{CardRecord, ClozeMode, SlideResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    Array,
    Object,
}

impl JsonShape {
    fn delimiters(self) -> (char, char) {
        match self {
            JsonShape::Array => ('[', ']'),
            JsonShape::Object => ('{', '}'),
        }
    }

    fn name(self) -> &'static str {
        match self {
            JsonShape::Array => "array",
            JsonShape::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            JsonShape::Array => value.is_array(),
            JsonShape::Object => value.is_object(),
        }
    }
}

/// Deterministic post-processing applied to every card that leaves the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub cloze_mode: ClozeMode,
    pub emphasis: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            cloze_mode: ClozeMode::MultiGroup,
            emphasis: true,
        }
    }
}

/// Locate the first well-formed JSON value of the given shape in `text`.
///
/// The greedy span from the first opener to the last closer is tried first; if
/// that does not parse, each opener is tried with a string-aware balanced scan.
pub fn extract_json(text: &str, shape: JsonShape) -> Result<Value, ParseFailure> {
    let (open, close) = shape.delimiters();
    let start = text.find(open).ok_or(ParseFailure::NoJson(shape.name()))?;

    let mut first_error = None;
    if let Some(end) = text.rfind(close).filter(|end| *end > start) {
        match serde_json::from_str::<Value>(&text[start..=end]) {
            Ok(value) if shape.matches(&value) => return Ok(value),
            Ok(_) => {}
            Err(e) => first_error = Some(e.to_string()),
        }
    }

    for (idx, _) in text.match_indices(open) {
        let Some(end) = balanced_end(text, idx, open, close) else {
            continue;
        };
        if let Ok(value) = serde_json::from_str::<Value>(&text[idx..end]) {
            if shape.matches(&value) {
                return Ok(value);
            }
        }
    }

    Err(match first_error {
        Some(e) => ParseFailure::Json(e),
        None => ParseFailure::NoJson(shape.name()),
    })
}

fn balanced_end(text: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(start + offset + ch.len_utf8());
            }
        }
    }
    None
}

/// Reconcile a generation reply against the slides that were requested.
///
/// Returns exactly one [`SlideResult`] per distinct expected id, sorted by id.
/// Slides the reply omits get an empty placeholder; slides nobody asked for are
/// dropped.
pub fn reconcile(
    raw: &str,
    expected: &[u32],
    options: &ReconcileOptions,
) -> Result<Vec<SlideResult>, ParseFailure> {
    let value = extract_json(raw, JsonShape::Array)?;
    let entries = value.as_array().map(Vec::as_slice).unwrap_or_default();
    let expected: BTreeSet<u32> = expected.iter().copied().collect();

    let mut found: BTreeMap<u32, Vec<CardRecord>> = BTreeMap::new();

    let bare_list_owner = if expected.len() == 1 && is_flat_card_list(entries) {
        expected.first().copied()
    } else {
        None
    };

    if let Some(only) = bare_list_owner {
        // A single-slide request answered with a bare card list.
        let cards = entries
            .iter()
            .filter_map(|v| card_from_value(v, Some(only)))
            .collect();
        found.insert(only, cards);
    } else {
        for entry in entries {
            let Some(page_id) = page_id_of(entry) else {
                warn!(entry = %truncate_json(entry), "Skipping response entry without a slide id");
                continue;
            };
            if !expected.contains(&page_id) {
                warn!(page_id, "Response mentions a slide that was not requested, dropping it");
                continue;
            }
            let cards = entry
                .get("cards")
                .and_then(Value::as_array)
                .map(|cards| {
                    cards
                        .iter()
                        .filter_map(|v| card_from_value(v, Some(page_id)))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            found.entry(page_id).or_default().extend(cards);
        }
    }

    let mut results = Vec::with_capacity(expected.len());
    for page_id in expected {
        match found.remove(&page_id) {
            Some(cards) => {
                let cards = cards
                    .into_iter()
                    .filter_map(|mut card| {
                        card.source_slide = page_id;
                        normalize_card(card, options)
                    })
                    .collect();
                results.push(SlideResult { page_id, cards });
            }
            None => {
                warn!(page_id, "Coverage gap: no cards returned for slide, recording it as empty");
                results.push(SlideResult::empty(page_id));
            }
        }
    }
    Ok(results)
}

/// Single-group flattening and lexical emphasis. Never changes cloze answers.
pub fn post_process(mut card: CardRecord, options: &ReconcileOptions) -> CardRecord {
    if options.cloze_mode.is_single_group() {
        card.text = cloze::flatten_to_single_group(&card.text);
    }
    if options.emphasis {
        card.text = cloze::emphasize(&card.text);
    }
    card
}

/// [`post_process`], then drop (with a warning) cards left without a cloze marker.
pub fn normalize_card(card: CardRecord, options: &ReconcileOptions) -> Option<CardRecord> {
    let card = post_process(card, options);
    if !cloze::has_cloze(&card.text) {
        warn!(
            source_slide = card.source_slide,
            text = %crate::transport::truncate(&card.text, 80),
            "Dropping card without a cloze marker"
        );
        return None;
    }
    Some(card)
}

const PAGE_KEYS: [&str; 5] = ["page_id", "slide", "page", "page_num", "slide_number"];

fn page_id_of(entry: &Value) -> Option<u32> {
    PAGE_KEYS
        .iter()
        .find_map(|key| entry.get(*key))
        .and_then(as_u32)
}

fn is_flat_card_list(entries: &[Value]) -> bool {
    !entries.is_empty()
        && entries
            .iter()
            .all(|e| e.get("text").is_some() && page_id_of(e).is_none() && e.get("cards").is_none())
}

pub(crate) fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn as_usize(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Coerce one card-shaped JSON object. `source_slide` in the object wins over
/// `fallback_slide`; a card without `text` is rejected.
pub(crate) fn card_from_value(value: &Value, fallback_slide: Option<u32>) -> Option<CardRecord> {
    let text = value.get("text").and_then(Value::as_str)?.to_string();
    let source_slide = value
        .get("source_slide")
        .and_then(as_u32)
        .or(fallback_slide)?;
    let facts = match value.get("facts") {
        Some(Value::Array(items)) => items.iter().filter_map(as_text).collect(),
        Some(other) => as_text(other).into_iter().collect(),
        None => Vec::new(),
    };
    let context = value.get("context").and_then(as_text).unwrap_or_default();
    let clinical_relevance = value
        .get("clinical_relevance")
        .and_then(as_text)
        .filter(|s| !s.trim().is_empty());

    Some(CardRecord {
        text,
        facts,
        context,
        clinical_relevance,
        source_slide,
    })
}

fn truncate_json(value: &Value) -> String {
    crate::transport::truncate(&value.to_string(), 80)
}
