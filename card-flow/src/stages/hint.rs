use tracing::warn;

use crate::cloze;
use crate::error::ParseFailure;
use crate::ledger::{DecisionAction, RefinementDecision, StageKind};
use crate::stage::{RefinementStage, StageOutput, indexed_patches};
use crate::types::CardRecord;

/// Adds `{{cN::answer::hint}}` cues. A patch that changes anything besides hints
/// is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct HintStage;

impl RefinementStage for HintStage {
    fn kind(&self) -> StageKind {
        StageKind::Hint
    }

    fn apply(&self, raw: &str, cards: &[CardRecord]) -> Result<StageOutput, ParseFailure> {
        let mut out = cards.to_vec();
        let mut decisions = Vec::new();

        for patch in indexed_patches(raw, StageKind::Hint, cards.len())? {
            let Some(text) = patch.text.clone() else {
                continue;
            };
            let before = &cards[patch.index].text;
            if &text == before {
                continue;
            }
            if !only_hints_changed(before, &text) {
                warn!(index = patch.index, "Hint patch changes more than hints, ignoring it");
                continue;
            }
            decisions.push(
                RefinementDecision::new(
                    StageKind::Hint,
                    DecisionAction::Hinted,
                    vec![patch.index],
                    patch.field("reason").unwrap_or_else(|| "hint added".into()),
                )
                .with_texts(Some(before.clone()), Some(text.clone())),
            );
            out[patch.index].text = text;
        }

        Ok(StageOutput {
            cards: out,
            decisions,
        })
    }
}

fn only_hints_changed(before: &str, after: &str) -> bool {
    cloze::answers(before) == cloze::answers(after)
        && cloze::group_indices(before) == cloze::group_indices(after)
        && cloze::strip_markers(before) == cloze::strip_markers(after)
}
