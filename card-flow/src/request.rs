//! Assembly of outbound requests. Everything here is a pure function of its inputs.

use serde::Serialize;

use crate::ledger::StageKind;
use crate::prompts;
use crate::types::{CardRecord, ClozeMode, Slide};

/// What a request is for. Used for logging and by test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Generation,
    Stage(StageKind),
}

/// One inline image, tagged with the slide it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub page_id: u32,
    pub label: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

/// A single outbound call: one instruction block plus zero or more images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub mode: RequestMode,
    pub instruction: String,
    pub attachments: Vec<Attachment>,
    pub max_completion_tokens: Option<u32>,
}

impl GenerationRequest {
    /// Page ids of the attached slides, in attachment order.
    pub fn page_ids(&self) -> Vec<u32> {
        self.attachments.iter().map(|a| a.page_id).collect()
    }
}

/// Inputs shared by every request built for one document.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub lecture_name: String,
    pub cloze_mode: ClozeMode,
    pub max_completion_tokens: Option<u32>,
}

impl RequestOptions {
    pub fn new(lecture_name: impl Into<String>, cloze_mode: ClozeMode) -> Self {
        Self {
            lecture_name: lecture_name.into(),
            cloze_mode,
            max_completion_tokens: None,
        }
    }
}

/// Multi-image generation request for the given pending slides.
pub fn build_generation(pending: &[Slide], options: &RequestOptions) -> GenerationRequest {
    let page_ids: Vec<u32> = pending.iter().map(|s| s.page_id).collect();
    let attachments = pending
        .iter()
        .map(|slide| Attachment {
            page_id: slide.page_id,
            label: format!("Slide {}", slide.page_id),
            media_type: slide.media_type.clone(),
            data: slide.image.clone(),
        })
        .collect();

    GenerationRequest {
        mode: RequestMode::Generation,
        instruction: prompts::generation(&options.lecture_name, &page_ids, options.cloze_mode),
        attachments,
        max_completion_tokens: options.max_completion_tokens,
    }
}

#[derive(Serialize)]
struct IndexedCard<'a> {
    index: usize,
    source_slide: u32,
    text: &'a str,
    facts: &'a [String],
    context: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    clinical_relevance: Option<&'a str>,
}

/// The card set as the indexed JSON listing every refinement prompt embeds.
pub fn indexed_cards_json(cards: &[CardRecord]) -> String {
    let indexed: Vec<IndexedCard<'_>> = cards
        .iter()
        .enumerate()
        .map(|(index, card)| IndexedCard {
            index,
            source_slide: card.source_slide,
            text: &card.text,
            facts: &card.facts,
            context: &card.context,
            clinical_relevance: card.clinical_relevance.as_deref(),
        })
        .collect();
    serde_json::to_string_pretty(&indexed).unwrap_or_else(|_| "[]".to_string())
}

/// Text-only request for one refinement stage over the current card set.
pub fn build_refinement(
    stage: StageKind,
    cards: &[CardRecord],
    options: &RequestOptions,
) -> GenerationRequest {
    let listing = indexed_cards_json(cards);
    let lecture = options.lecture_name.as_str();
    let instruction = match stage {
        StageKind::Refine => prompts::refine(lecture, options.cloze_mode, &listing),
        StageKind::Hint => prompts::hint(lecture, &listing),
        StageKind::Group => prompts::group(lecture, &listing),
        StageKind::Audit => prompts::audit(lecture, options.cloze_mode, &listing),
    };

    GenerationRequest {
        mode: RequestMode::Stage(stage),
        instruction,
        attachments: Vec::new(),
        max_completion_tokens: options.max_completion_tokens,
    }
}
