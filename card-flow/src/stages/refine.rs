//! Deck-level cleanup: dedupe, merge and tighten.

use serde_json::Value;
use tracing::warn;

use crate::cloze;
use crate::error::ParseFailure;
use crate::ledger::{DecisionAction, RefinementDecision, StageKind};
use crate::reconcile::{JsonShape, as_text, as_usize, card_from_value, extract_json};
use crate::stage::{RefinementStage, StageOutput};
use crate::types::CardRecord;

/// Replies with the whole new deck plus a list of decisions. Unlike the other
/// stages its failure aborts refinement.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefineStage;

impl RefinementStage for RefineStage {
    fn kind(&self) -> StageKind {
        StageKind::Refine
    }

    fn apply(&self, raw: &str, cards: &[CardRecord]) -> Result<StageOutput, ParseFailure> {
        let value = extract_json(raw, JsonShape::Object)?;
        let new_cards = value
            .get("cards")
            .and_then(Value::as_array)
            .ok_or(ParseFailure::MissingKey("cards"))?;
        let decisions = value
            .get("decisions")
            .and_then(Value::as_array)
            .ok_or(ParseFailure::MissingKey("decisions"))?;

        let new_cards: Vec<CardRecord> = new_cards
            .iter()
            .filter_map(|entry| {
                let Some(card) = card_from_value(entry, origin_slide(entry, cards)) else {
                    warn!("Refine returned a card without text or slide, skipping it");
                    return None;
                };
                if !cloze::has_cloze(&card.text) {
                    warn!(text = %card.text, "Refine returned a card without a cloze, skipping it");
                    return None;
                }
                Some(card)
            })
            .collect();
        if new_cards.is_empty() && !cards.is_empty() {
            return Err(ParseFailure::EmptyDeck);
        }

        let decisions = decisions
            .iter()
            .filter_map(|entry| decision_from_value(entry, cards))
            .collect();

        Ok(StageOutput {
            cards: new_cards,
            decisions,
        })
    }
}

/// Slide of the first input card listed in `from`.
fn origin_slide(entry: &Value, cards: &[CardRecord]) -> Option<u32> {
    entry
        .get("from")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(as_usize)
        .find_map(|idx| cards.get(idx))
        .map(|card| card.source_slide)
}

fn decision_from_value(entry: &Value, cards: &[CardRecord]) -> Option<RefinementDecision> {
    let action = match entry.get("action").and_then(Value::as_str) {
        Some("removed") | Some("remove") => DecisionAction::Removed,
        Some("merged") | Some("merge") => DecisionAction::Merged,
        Some("modified") | Some("modify") => DecisionAction::Modified,
        Some("unchanged") => DecisionAction::Unchanged,
        other => {
            warn!(action = ?other, "Ignoring refine decision with an unknown action");
            return None;
        }
    };

    let indices: Vec<usize> = match entry.get("indices") {
        Some(Value::Array(items)) => items.iter().filter_map(as_usize).collect(),
        Some(single) => as_usize(single).into_iter().collect(),
        None => Vec::new(),
    };
    let (known, unknown): (Vec<usize>, Vec<usize>) =
        indices.into_iter().partition(|idx| *idx < cards.len());
    if !unknown.is_empty() {
        warn!(?unknown, "Refine decision mentions unknown card indices");
    }

    let before = entry.get("before").and_then(as_text).or_else(|| match known.as_slice() {
        [only] => Some(cards[*only].text.clone()),
        _ => None,
    });
    let after = entry.get("after").and_then(as_text);
    let reason = entry.get("reason").and_then(as_text).unwrap_or_default();

    Some(RefinementDecision::new(StageKind::Refine, action, known, reason).with_texts(before, after))
}
