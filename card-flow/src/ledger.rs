//! Append-only audit trail of refinement decisions.
//!
//! The ledger is purely observational: the orchestrator records into it, and at the
//! end of a run it is flushed as a JSON report and a Markdown narrative. Nothing in
//! the pipeline reads it back to make control-flow decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::storage::sanitize_file_stem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Refine,
    Hint,
    Group,
    Audit,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Refine => "refine",
            StageKind::Hint => "hint",
            StageKind::Group => "group",
            StageKind::Audit => "audit",
        }
    }

    fn title(self) -> &'static str {
        match self {
            StageKind::Refine => "Refine (dedupe, merge, tighten)",
            StageKind::Hint => "Hints",
            StageKind::Group => "Cloze grouping",
            StageKind::Audit => "Accuracy audit",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Removed,
    Merged,
    Modified,
    Hinted,
    Regrouped,
    Unchanged,
    StageFailed,
}

impl DecisionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionAction::Removed => "removed",
            DecisionAction::Merged => "merged",
            DecisionAction::Modified => "modified",
            DecisionAction::Hinted => "hinted",
            DecisionAction::Regrouped => "regrouped",
            DecisionAction::Unchanged => "unchanged",
            DecisionAction::StageFailed => "stage_failed",
        }
    }
}

/// One refinement decision. `indices` refer to card positions in the stage's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementDecision {
    pub stage: StageKind,
    pub action: DecisionAction,
    #[serde(default)]
    pub indices: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_text: Option<String>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl RefinementDecision {
    pub fn new(
        stage: StageKind,
        action: DecisionAction,
        indices: Vec<usize>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            action,
            indices,
            before_text: None,
            after_text: None,
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_texts(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.before_text = before;
        self.after_text = after;
        self
    }
}

/// Per-stage decision counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub removed: usize,
    pub merged: usize,
    pub modified: usize,
    pub hinted: usize,
    pub regrouped: usize,
    pub unchanged: usize,
    pub stage_failed: usize,
}

impl ActionCounts {
    fn bump(&mut self, action: DecisionAction) {
        match action {
            DecisionAction::Removed => self.removed += 1,
            DecisionAction::Merged => self.merged += 1,
            DecisionAction::Modified => self.modified += 1,
            DecisionAction::Hinted => self.hinted += 1,
            DecisionAction::Regrouped => self.regrouped += 1,
            DecisionAction::Unchanged => self.unchanged += 1,
            DecisionAction::StageFailed => self.stage_failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Applied,
    Failed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: StageKind,
    #[serde(flatten)]
    pub status: StageStatus,
    pub cards_before: usize,
    pub cards_after: usize,
}

/// Serialized form of a finished ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerReport {
    pub doc_id: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: BTreeMap<StageKind, ActionCounts>,
    pub stages: Vec<StageOutcome>,
    pub decisions: Vec<RefinementDecision>,
}

impl LedgerReport {
    pub fn total(&self, action: DecisionAction) -> usize {
        self.decisions.iter().filter(|d| d.action == action).count()
    }
}

/// Paths of the artifacts written by [`DecisionLedger::write`].
#[derive(Debug, Clone)]
pub struct LedgerArtifacts {
    pub json: PathBuf,
    pub markdown: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DecisionLedger {
    doc_id: String,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    decisions: Vec<RefinementDecision>,
    stages: Vec<StageOutcome>,
}

impl DecisionLedger {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            decisions: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn record(&mut self, decision: RefinementDecision) {
        self.decisions.push(decision);
    }

    pub fn record_all(&mut self, decisions: impl IntoIterator<Item = RefinementDecision>) {
        self.decisions.extend(decisions);
    }

    pub fn record_outcome(&mut self, outcome: StageOutcome) {
        self.stages.push(outcome);
    }

    pub fn decisions(&self) -> &[RefinementDecision] {
        &self.decisions
    }

    pub fn stages(&self) -> &[StageOutcome] {
        &self.stages
    }

    pub fn report(&self) -> LedgerReport {
        let mut counts: BTreeMap<StageKind, ActionCounts> = BTreeMap::new();
        for outcome in &self.stages {
            counts.entry(outcome.stage).or_default();
        }
        for decision in &self.decisions {
            counts.entry(decision.stage).or_default().bump(decision.action);
        }
        LedgerReport {
            doc_id: self.doc_id.clone(),
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            counts,
            stages: self.stages.clone(),
            decisions: self.decisions.clone(),
        }
    }

    /// Write `<doc>_refinement_log.json` and `<doc>_refinement_log.md` into `dir`.
    pub async fn write(&self, dir: &Path) -> Result<LedgerArtifacts, StoreError> {
        let report = self.report();
        tokio::fs::create_dir_all(dir).await?;

        let stem = sanitize_file_stem(&self.doc_id);
        let json = dir.join(format!("{stem}_refinement_log.json"));
        let markdown = dir.join(format!("{stem}_refinement_log.md"));

        tokio::fs::write(&json, serde_json::to_vec_pretty(&report)?).await?;
        tokio::fs::write(&markdown, render_markdown(&report)).await?;

        info!(
            doc_id = %self.doc_id,
            decisions = report.decisions.len(),
            path = %json.display(),
            "Refinement log written"
        );
        Ok(LedgerArtifacts { json, markdown })
    }
}

/// Human-readable narrative of a report, grouped by stage.
pub fn render_markdown(report: &LedgerReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Refinement log: {}", report.doc_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Run: `{}`", report.run_id);
    let _ = writeln!(
        out,
        "- Started: {}",
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        out,
        "- Finished: {}",
        report.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out);

    for outcome in &report.stages {
        let stage = outcome.stage;
        let _ = writeln!(out, "## {}", stage.title());
        let _ = writeln!(out);
        match &outcome.status {
            StageStatus::Applied => {
                let _ = writeln!(
                    out,
                    "Applied: {} cards in, {} cards out.",
                    outcome.cards_before, outcome.cards_after
                );
            }
            StageStatus::Failed { reason } => {
                let _ = writeln!(out, "Failed, cards left unchanged: {reason}");
            }
            StageStatus::Skipped { reason } => {
                let _ = writeln!(out, "Skipped: {reason}");
            }
        }
        if let Some(counts) = report.counts.get(&stage) {
            let _ = writeln!(
                out,
                "\nRemoved {}, merged {}, modified {}, hinted {}, regrouped {}.",
                counts.removed, counts.merged, counts.modified, counts.hinted, counts.regrouped
            );
        }
        let _ = writeln!(out);

        for decision in report.decisions.iter().filter(|d| d.stage == stage) {
            if decision.action == DecisionAction::StageFailed {
                continue;
            }
            let cards = decision
                .indices
                .iter()
                .map(|i| format!("#{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(
                out,
                "- **{}** {}: {}",
                decision.action.as_str(),
                if cards.is_empty() { "-".to_string() } else { cards },
                decision.reason
            );
            if let Some(before) = &decision.before_text {
                let _ = writeln!(out, "  - before: {before}");
            }
            if let Some(after) = &decision.after_text {
                let _ = writeln!(out, "  - after: {after}");
            }
        }
        let _ = writeln!(out);
    }
    out
}
