//! Final factual-accuracy pass over the deck.

use tracing::warn;

use crate::cloze;
use crate::error::ParseFailure;
use crate::ledger::{DecisionAction, RefinementDecision, StageKind};
use crate::stage::{RefinementStage, StageOutput, indexed_patches};
use crate::types::CardRecord;

#[derive(Debug, Default, Clone, Copy)]
pub struct AuditStage;

impl RefinementStage for AuditStage {
    fn kind(&self) -> StageKind {
        StageKind::Audit
    }

    fn apply(&self, raw: &str, cards: &[CardRecord]) -> Result<StageOutput, ParseFailure> {
        let mut replaced: Vec<Option<CardRecord>> = cards.iter().cloned().map(Some).collect();
        let mut decisions = Vec::new();

        for patch in indexed_patches(raw, StageKind::Audit, cards.len())? {
            let index = patch.index;
            let before = cards[index].text.clone();
            let reason = patch.field("reason").unwrap_or_default();
            let verdict = patch.field("verdict").map(|v| v.trim().to_ascii_lowercase());

            match verdict.as_deref() {
                Some("keep") => decisions.push(RefinementDecision::new(
                    StageKind::Audit,
                    DecisionAction::Unchanged,
                    vec![index],
                    reason,
                )),
                Some("fix") => match patch.text {
                    Some(text) if cloze::has_cloze(&text) => {
                        if text != before {
                            decisions.push(
                                RefinementDecision::new(
                                    StageKind::Audit,
                                    DecisionAction::Modified,
                                    vec![index],
                                    reason,
                                )
                                .with_texts(Some(before), Some(text.clone())),
                            );
                            if let Some(card) = replaced[index].as_mut() {
                                card.text = text;
                            }
                        }
                    }
                    _ => warn!(index, "Audit fix without a usable cloze text, keeping card"),
                },
                Some("remove") => {
                    decisions.push(
                        RefinementDecision::new(
                            StageKind::Audit,
                            DecisionAction::Removed,
                            vec![index],
                            reason,
                        )
                        .with_texts(Some(before), None),
                    );
                    replaced[index] = None;
                }
                other => warn!(index, verdict = ?other, "Unknown audit verdict, keeping card"),
            }
        }

        Ok(StageOutput {
            cards: replaced.into_iter().flatten().collect(),
            decisions,
        })
    }
}
