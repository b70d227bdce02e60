use serde_json::Value;
use tracing::warn;

use crate::error::ParseFailure;
use crate::ledger::{RefinementDecision, StageKind};
use crate::reconcile::{JsonShape, as_text, as_usize, extract_json};
use crate::request::{self, GenerationRequest, RequestOptions};
use crate::types::CardRecord;

/// Result of applying one stage reply to the card set it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub cards: Vec<CardRecord>,
    pub decisions: Vec<RefinementDecision>,
}

/// Core trait that every refinement stage implements.
///
/// A stage is a pure transformation: the orchestrator sends the request and feeds
/// the reply back through [`apply`](RefinementStage::apply). A reply `apply`
/// rejects counts as a failed attempt.
pub trait RefinementStage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Request for the current card set.
    fn build_request(&self, cards: &[CardRecord], options: &RequestOptions) -> GenerationRequest {
        request::build_refinement(self.kind(), cards, options)
    }

    /// Turn the reply into the next card set plus the decisions it implies.
    fn apply(&self, raw: &str, cards: &[CardRecord]) -> Result<StageOutput, ParseFailure>;
}

/// One `{"index": .., ...}` entry of an array-shaped stage reply.
#[derive(Debug, Clone)]
pub(crate) struct IndexedPatch {
    pub index: usize,
    pub text: Option<String>,
    pub entry: Value,
}

impl IndexedPatch {
    pub fn field(&self, key: &str) -> Option<String> {
        self.entry.get(key).and_then(as_text)
    }
}

/// Parse an array reply of indexed entries. Entries without a usable index,
/// indices outside `0..card_count` and repeated indices are ignored with a warning.
pub(crate) fn indexed_patches(
    raw: &str,
    stage: StageKind,
    card_count: usize,
) -> Result<Vec<IndexedPatch>, ParseFailure> {
    let value = extract_json(raw, JsonShape::Array)?;
    let entries = value.as_array().map(Vec::as_slice).unwrap_or_default();

    let mut seen = vec![false; card_count];
    let mut patches = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(index) = entry.get("index").and_then(as_usize) else {
            warn!(%stage, "Ignoring entry without an index");
            continue;
        };
        if index >= card_count {
            warn!(%stage, index, card_count, "Ignoring entry for an unknown card index");
            continue;
        }
        if std::mem::replace(&mut seen[index], true) {
            warn!(%stage, index, "Ignoring repeated entry for card");
            continue;
        }
        patches.push(IndexedPatch {
            index,
            text: entry
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string),
            entry: entry.clone(),
        });
    }
    Ok(patches)
}
