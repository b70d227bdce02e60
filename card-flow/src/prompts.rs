//! Instruction text for every request mode. Pure string assembly, no shared state.

use crate::types::ClozeMode;

pub(crate) fn cloze_instruction(mode: ClozeMode) -> &'static str {
    match mode {
        ClozeMode::MultiGroup => {
            "IMPORTANT: Create cloze deletions using {{c1::}}, {{c2::}}, {{c3::}} etc. for different blanks within the same card."
        }
        ClozeMode::SingleGroup => {
            "IMPORTANT: Use ONLY {{c1::}} for ALL cloze deletions (this creates a single card with multiple blanks revealed simultaneously)."
        }
    }
}

pub(crate) fn generation(lecture_name: &str, page_ids: &[u32], mode: ClozeMode) -> String {
    let ids = page_ids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"You are analyzing {count} slides from a medical lecture on "{lecture_name}".
Each slide image is preceded by a label of the form "Slide <number>". The slide numbers in this request are: {ids}.

Your task is to:
1. Extract ALL important medical facts, concepts, definitions, and relationships that could be tested in MCQ exams
2. Create cloze deletion flashcards for each key fact
3. Focus on testable information like:
   - Definitions and terminology
   - Numerical values (doses, percentages, durations)
   - Classifications and categories
   - Mechanisms of action
   - Clinical features and symptoms
   - Diagnostic criteria
   - Treatment protocols
   - Anatomical relationships
   - Pathophysiology concepts

{cloze}

Format your response as a JSON array with exactly one object per slide number listed above:
- "page_id": the slide number
- "cards": array of flashcards for that slide (empty if the slide has nothing testable), each with
  - "text": the complete text with cloze deletions in {{{{c1::answer}}}} format
  - "facts": array of the key facts being tested
  - "context": brief context about why this is important
  - "clinical_relevance": optional one-line clinical hook

Example:
[
  {{
    "page_id": 4,
    "cards": [
      {{
        "text": "{{{{c1::Peristalsis}}}} is the {{{{c2::autonomous rhythmic contraction}}}} of smooth muscle in the GI tract",
        "facts": ["Peristalsis", "autonomous rhythmic contraction"],
        "context": "Key GI physiology concept"
      }}
    ]
  }},
  {{ "page_id": 5, "cards": [] }}
]

Create as many cards as needed to cover all testable information on each slide. **Make the cards as concise as possible while retaining the key points**"#,
        count = page_ids.len(),
        cloze = cloze_instruction(mode),
    )
}

pub(crate) fn refine(lecture_name: &str, mode: ClozeMode, cards_json: &str) -> String {
    format!(
        r#"You are reviewing cloze flashcards generated from the lecture "{lecture_name}".
Improve the deck as a whole:
- Remove exact or near duplicates and cards that test trivia
- Merge cards that test the same fact into one card
- Tighten wording so each card is as concise as possible
- Keep at least one cloze deletion in every card
{cloze}

Input cards (JSON, "index" identifies each card):
{cards_json}

Respond with a JSON object with two keys:
- "cards": the full improved deck; each card has "source_slide", "text", "facts", "context", optional "clinical_relevance", and "from" (array of input indices it came from)
- "decisions": one entry per change, each with "action" ("removed", "merged" or "modified"), "indices" (input indices affected), optional "before" and "after" texts, and "reason"
Cards you do not change must still appear in "cards"."#,
        cloze = cloze_instruction(mode),
    )
}

pub(crate) fn hint(lecture_name: &str, cards_json: &str) -> String {
    format!(
        r#"You are adding recall hints to cloze flashcards from the lecture "{lecture_name}".
For cloze deletions whose answer is ambiguous without a cue, add a short hint using the
{{{{cN::answer::hint}}}} syntax. Do not change the answers, the wording outside the cloze markers,
or the cloze numbers. Leave cards that need no hint out of the response.

Input cards (JSON, "index" identifies each card):
{cards_json}

Respond with a JSON array of objects with "index" and the new "text"."#,
    )
}

pub(crate) fn group(lecture_name: &str, cards_json: &str) -> String {
    format!(
        r#"You are organising cloze numbering in flashcards from the lecture "{lecture_name}".
Cloze deletions that must be recalled together share one number; independent facts get
separate numbers, starting at c1 within each card. Do not change any other text.
Leave cards whose numbering is already right out of the response.

Input cards (JSON, "index" identifies each card):
{cards_json}

Respond with a JSON array of objects with "index" and the renumbered "text"."#,
    )
}

pub(crate) fn audit(lecture_name: &str, mode: ClozeMode, cards_json: &str) -> String {
    format!(
        r#"You are auditing cloze flashcards from the lecture "{lecture_name}" for factual accuracy.
For every card decide one verdict:
- "keep": the card is correct
- "fix": the card contains an error; supply the corrected "text"
- "remove": the card is wrong or misleading beyond repair
{cloze}

Input cards (JSON, "index" identifies each card):
{cards_json}

Respond with a JSON array of objects with "index", "verdict", optional "text" (required for "fix"), and "reason"."#,
        cloze = cloze_instruction(mode),
    )
}
