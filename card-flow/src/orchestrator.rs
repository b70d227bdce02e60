//! Runs the refinement stages in order over one document's card set.

use std::sync::Arc;
use tracing::{info, warn};

use crate::cloze;
use crate::config::{PipelineConfig, RetryPolicy};
use crate::ledger::{
    DecisionAction, DecisionLedger, RefinementDecision, StageKind, StageOutcome, StageStatus,
};
use crate::reconcile::{ReconcileOptions, post_process};
use crate::request::RequestOptions;
use crate::stage::{RefinementStage, StageOutput};
use crate::stages::{AuditStage, GroupStage, HintStage, RefineStage};
use crate::transport::RetryingTransport;
use crate::types::CardRecord;

/// One slot of the stage plan.
#[derive(Clone)]
pub enum PlannedStage {
    Run(Arc<dyn RefinementStage>),
    Skip { kind: StageKind, reason: String },
}

impl PlannedStage {
    pub fn kind(&self) -> StageKind {
        match self {
            PlannedStage::Run(stage) => stage.kind(),
            PlannedStage::Skip { kind, .. } => *kind,
        }
    }
}

/// Cards after refinement, plus the ledger that explains how they got there.
#[derive(Debug, Clone)]
pub struct RefinementRun {
    pub cards: Vec<CardRecord>,
    pub ledger: DecisionLedger,
    /// Refine failed, so `cards` are the unrefined input.
    pub aborted: bool,
}

pub struct RefinementOrchestrator {
    transport: RetryingTransport,
    plan: Vec<PlannedStage>,
    retry: RetryPolicy,
    options: ReconcileOptions,
}

impl RefinementOrchestrator {
    pub fn new(transport: RetryingTransport, config: &PipelineConfig) -> Self {
        Self {
            transport,
            plan: Self::plan_for(config),
            retry: config.refinement.retry,
            options: config.reconcile_options(),
        }
    }

    /// `[Refine, Hint?, Group?, Audit]` with toggles and cloze mode applied.
    pub fn plan_for(config: &PipelineConfig) -> Vec<PlannedStage> {
        let refinement = &config.refinement;
        let hint = if refinement.hints {
            PlannedStage::Run(Arc::new(HintStage))
        } else {
            PlannedStage::Skip {
                kind: StageKind::Hint,
                reason: "hints disabled".into(),
            }
        };
        let group = if config.cloze_mode.is_single_group() {
            PlannedStage::Skip {
                kind: StageKind::Group,
                reason: "single-group mode".into(),
            }
        } else if !refinement.grouping {
            PlannedStage::Skip {
                kind: StageKind::Group,
                reason: "grouping disabled".into(),
            }
        } else {
            PlannedStage::Run(Arc::new(GroupStage))
        };

        vec![
            PlannedStage::Run(Arc::new(RefineStage)),
            hint,
            group,
            PlannedStage::Run(Arc::new(AuditStage)),
        ]
    }

    /// Replace the plan, e.g. with custom stages.
    pub fn with_plan(mut self, plan: Vec<PlannedStage>) -> Self {
        self.plan = plan;
        self
    }

    /// Run every planned stage over `cards`. Never fails: a Refine failure
    /// returns the input unchanged, any other failure keeps the previous cards.
    pub async fn run(
        &self,
        doc_id: &str,
        cards: Vec<CardRecord>,
        request_options: &RequestOptions,
    ) -> RefinementRun {
        let mut ledger = DecisionLedger::new(doc_id);
        if cards.is_empty() {
            info!(doc_id, "No cards to refine");
            return RefinementRun {
                cards,
                ledger,
                aborted: false,
            };
        }

        let original = cards.clone();
        let mut current = cards;
        info!(doc_id, cards = current.len(), "Starting refinement");

        for (position, planned) in self.plan.iter().enumerate() {
            let stage = match planned {
                PlannedStage::Run(stage) => stage,
                PlannedStage::Skip { kind, reason } => {
                    info!(doc_id, stage = %kind, reason = %reason, "Skipping stage");
                    ledger.record_outcome(StageOutcome {
                        stage: *kind,
                        status: StageStatus::Skipped {
                            reason: reason.clone(),
                        },
                        cards_before: current.len(),
                        cards_after: current.len(),
                    });
                    continue;
                }
            };

            let kind = stage.kind();
            let cards_before = current.len();
            let request = stage.build_request(&current, request_options);
            let budget = self.retry.budget(current.len());
            let result = self
                .transport
                .execute_with(&request, budget, |text| stage.apply(text, &current))
                .await;

            match result {
                Ok(StageOutput { cards, decisions }) => {
                    ledger.record_all(decisions);
                    current = self.revalidate(kind, cards, &mut ledger);
                    info!(
                        doc_id,
                        stage = %kind,
                        cards_before,
                        cards_after = current.len(),
                        "Stage applied"
                    );
                    ledger.record_outcome(StageOutcome {
                        stage: kind,
                        status: StageStatus::Applied,
                        cards_before,
                        cards_after: current.len(),
                    });
                }
                Err(failure) => {
                    let reason = failure.to_string();
                    warn!(doc_id, stage = %kind, error = %reason, "Refinement stage failed");
                    ledger.record(RefinementDecision::new(
                        kind,
                        DecisionAction::StageFailed,
                        Vec::new(),
                        reason.clone(),
                    ));
                    ledger.record_outcome(StageOutcome {
                        stage: kind,
                        status: StageStatus::Failed { reason },
                        cards_before,
                        cards_after: cards_before,
                    });

                    if kind == StageKind::Refine {
                        warn!(doc_id, "Refine failed, keeping the unrefined cards");
                        for later in &self.plan[position + 1..] {
                            ledger.record_outcome(StageOutcome {
                                stage: later.kind(),
                                status: StageStatus::Skipped {
                                    reason: "refinement aborted".into(),
                                },
                                cards_before: original.len(),
                                cards_after: original.len(),
                            });
                        }
                        return RefinementRun {
                            cards: original,
                            ledger,
                            aborted: true,
                        };
                    }
                }
            }
        }

        info!(
            doc_id,
            cards_before = original.len(),
            cards_after = current.len(),
            "Refinement complete"
        );
        RefinementRun {
            cards: current,
            ledger,
            aborted: false,
        }
    }

    /// Reapply post-processing and drop cards a stage left without a cloze marker.
    fn revalidate(
        &self,
        kind: StageKind,
        cards: Vec<CardRecord>,
        ledger: &mut DecisionLedger,
    ) -> Vec<CardRecord> {
        let mut kept = Vec::with_capacity(cards.len());
        for (index, card) in cards.into_iter().enumerate() {
            let card = post_process(card, &self.options);
            if cloze::has_cloze(&card.text) {
                kept.push(card);
            } else {
                warn!(stage = %kind, index, "Dropping card without a cloze marker");
                ledger.record(
                    RefinementDecision::new(
                        kind,
                        DecisionAction::Removed,
                        vec![index],
                        format!("no cloze marker after {kind}"),
                    )
                    .with_texts(Some(card.text), None),
                );
            }
        }
        kept
    }
}
