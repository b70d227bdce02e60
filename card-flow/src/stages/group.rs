use tracing::warn;

use crate::cloze;
use crate::error::ParseFailure;
use crate::ledger::{DecisionAction, RefinementDecision, StageKind};
use crate::stage::{RefinementStage, StageOutput, indexed_patches};
use crate::types::CardRecord;

/// Renumbers cloze groups so related blanks are revealed together. Only used in
/// multi-group mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupStage;

impl RefinementStage for GroupStage {
    fn kind(&self) -> StageKind {
        StageKind::Group
    }

    fn apply(&self, raw: &str, cards: &[CardRecord]) -> Result<StageOutput, ParseFailure> {
        let mut out = cards.to_vec();
        let mut decisions = Vec::new();

        for patch in indexed_patches(raw, StageKind::Group, cards.len())? {
            let Some(text) = patch.text.clone() else {
                continue;
            };
            let before = &cards[patch.index].text;
            let renumbered = cloze::group_indices(&text);
            if renumbered == cloze::group_indices(before) {
                continue;
            }
            if cloze::strip_markers(before) != cloze::strip_markers(&text)
                || renumbered.iter().any(|n| *n == 0)
            {
                warn!(index = patch.index, "Group patch changes more than numbering, ignoring it");
                continue;
            }
            decisions.push(
                RefinementDecision::new(
                    StageKind::Group,
                    DecisionAction::Regrouped,
                    vec![patch.index],
                    patch
                        .field("reason")
                        .unwrap_or_else(|| "cloze groups renumbered".into()),
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
