//! Plain-text and JSON renderings of a finished deck.

use async_trait::async_trait;
use card_flow::storage::sanitize_file_stem;
use card_flow::{DecisionAction, DocumentOutput, PackageError, Packager};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::info;

const RULE: &str = "--------------------------------------------------";

/// Writes `<doc>_cards_reference.txt` and `<doc>_cards.json` into one directory.
#[derive(Debug, Clone)]
pub struct ReferencePackager {
    output_dir: PathBuf,
}

impl ReferencePackager {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl Packager for ReferencePackager {
    async fn package(&self, output: &DocumentOutput) -> Result<PathBuf, PackageError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let stem = sanitize_file_stem(&output.doc_id);

        let json_path = self.output_dir.join(format!("{stem}_cards.json"));
        tokio::fs::write(&json_path, serde_json::to_vec_pretty(output)?).await?;

        let text_path = self.output_dir.join(format!("{stem}_cards_reference.txt"));
        tokio::fs::write(&text_path, render_reference(output, Local::now())).await?;

        info!(
            doc_id = %output.doc_id,
            cards = output.card_count(),
            reference = %text_path.display(),
            json = %json_path.display(),
            "Cards written"
        );
        Ok(text_path)
    }
}

/// Human-readable listing of every card, numbered in slide order.
pub fn render_reference(output: &DocumentOutput, generated_at: DateTime<Local>) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Cards for {}", output.doc_id);
    let _ = writeln!(text, "Total cards: {}", output.card_count());
    let _ = writeln!(text, "Generated: {}", generated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(ledger) = &output.ledger {
        let _ = writeln!(
            text,
            "Refinement: {} removed, {} merged, {} modified, {} hinted, {} regrouped, {} failed stages",
            ledger.total(DecisionAction::Removed),
            ledger.total(DecisionAction::Merged),
            ledger.total(DecisionAction::Modified),
            ledger.total(DecisionAction::Hinted),
            ledger.total(DecisionAction::Regrouped),
            ledger.total(DecisionAction::StageFailed),
        );
    }
    let _ = writeln!(text, "{}\n", "=".repeat(RULE.len()));
    let _ = writeln!(text, "Card Mode: {}", output.cloze_mode.describe());
    let _ = writeln!(text, "{RULE}");

    let cards = output
        .results
        .iter()
        .flat_map(|result| result.cards.iter().map(move |card| (result.page_id, card)));
    for (number, (page_id, card)) in cards.enumerate() {
        let _ = writeln!(text, "Card {} (Slide {page_id}):", number + 1);
        let _ = writeln!(text, "Text: {}", card.text);
        let _ = writeln!(text, "Facts tested: {}", card.facts.join(", "));
        let context = if card.context.is_empty() {
            "N/A"
        } else {
            card.context.as_str()
        };
        let _ = writeln!(text, "Context: {context}");
        if let Some(relevance) = &card.clinical_relevance {
            let _ = writeln!(text, "Clinical relevance: {relevance}");
        }
        let _ = writeln!(text, "{RULE}");
    }
    text
}
