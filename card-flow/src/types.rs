use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One rendered slide. The image is an opaque encoded payload (PNG by default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slide {
    pub page_id: u32,
    pub image: Vec<u8>,
    pub media_type: String,
}

impl Slide {
    pub fn png(page_id: u32, image: Vec<u8>) -> Self {
        Self {
            page_id,
            image,
            media_type: "image/png".to_string(),
        }
    }
}

/// A single cloze flash card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecord {
    pub text: String,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinical_relevance: Option<String>,
    #[serde(default)]
    pub source_slide: u32,
}

impl CardRecord {
    pub fn new(source_slide: u32, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            facts: Vec::new(),
            context: String::new(),
            clinical_relevance: None,
            source_slide,
        }
    }
}

/// Cards generated for one slide. Present for every requested slide, even when empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideResult {
    pub page_id: u32,
    #[serde(default)]
    pub cards: Vec<CardRecord>,
}

impl SlideResult {
    pub fn empty(page_id: u32) -> Self {
        Self {
            page_id,
            cards: Vec::new(),
        }
    }
}

/// How cloze group indices are assigned within a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClozeMode {
    /// Group indices are chosen by the model; each group becomes its own review card.
    #[default]
    MultiGroup,
    /// Every marker uses group 1, so all blanks are revealed together.
    SingleGroup,
}

impl ClozeMode {
    pub fn is_single_group(self) -> bool {
        matches!(self, ClozeMode::SingleGroup)
    }

    pub fn describe(self) -> &'static str {
        match self {
            ClozeMode::MultiGroup => "Multiple card mode (separate cards for each blank)",
            ClozeMode::SingleGroup => "Single card mode (all blanks shown together)",
        }
    }
}

/// Flatten per-slide results into one card list, in slide order.
pub fn flatten_cards(results: &[SlideResult]) -> Vec<CardRecord> {
    results
        .iter()
        .flat_map(|result| result.cards.iter().cloned())
        .collect()
}

/// Regroup cards by their source slide. Every id in `page_ids` gets an entry,
/// cards keep their relative order, and cards pointing at unknown slides are kept
/// under their own id.
pub fn group_by_slide(
    cards: Vec<CardRecord>,
    page_ids: impl IntoIterator<Item = u32>,
) -> Vec<SlideResult> {
    let mut grouped: BTreeMap<u32, Vec<CardRecord>> =
        page_ids.into_iter().map(|id| (id, Vec::new())).collect();
    for card in cards {
        grouped.entry(card.source_slide).or_default().push(card);
    }
    grouped
        .into_iter()
        .map(|(page_id, cards)| SlideResult { page_id, cards })
        .collect()
}

pub fn card_count(results: &[SlideResult]) -> usize {
    results.iter().map(|result| result.cards.len()).sum()
}
