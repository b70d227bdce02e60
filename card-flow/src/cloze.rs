//! Cloze marker handling: `{{cN::answer}}` and `{{cN::answer::hint}}`.

use regex::Regex;
use std::sync::LazyLock;

static CLOZE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{c(\d+)::(.*?)\}\}").expect("cloze marker pattern is valid")
});

static CLOZE_OPENER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{c\d+::").expect("cloze opener pattern is valid"));

static EMPHASIS_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(NOT|EXCEPT|NEVER|ALWAYS|ONLY|LEAST|MOST)\b")
        .expect("emphasis pattern is valid")
});

/// True when the text holds at least one marker with a positive group index
/// and a non-empty answer.
pub fn has_cloze(text: &str) -> bool {
    CLOZE_MARKER.captures_iter(text).any(|caps| {
        let group_ok = caps[1].parse::<u32>().map(|n| n >= 1).unwrap_or(false);
        let answer = caps[2].split("::").next().unwrap_or("");
        group_ok && !answer.trim().is_empty()
    })
}

/// Group indices of every marker, in order of appearance.
pub fn group_indices(text: &str) -> Vec<u32> {
    CLOZE_MARKER
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse().ok())
        .collect()
}

/// Answers of every marker with any `::hint` suffix removed, in order.
pub fn answers(text: &str) -> Vec<String> {
    CLOZE_MARKER
        .captures_iter(text)
        .map(|caps| {
            caps[2]
                .split("::")
                .next()
                .unwrap_or("")
                .trim()
                .to_string()
        })
        .collect()
}

/// The text with every marker replaced by its bare answer.
pub fn strip_markers(text: &str) -> String {
    CLOZE_MARKER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            caps[2].split("::").next().unwrap_or("").to_string()
        })
        .into_owned()
}

/// Rewrite every marker to group 1.
pub fn flatten_to_single_group(text: &str) -> String {
    CLOZE_OPENER.replace_all(text, "{{c1::").into_owned()
}

/// Bold exam qualifiers written in capitals. Text inside cloze markers is never
/// touched, and words already wrapped in `<b>` stay as they are.
pub fn emphasize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut cursor = 0;
    for marker in CLOZE_MARKER.find_iter(text) {
        out.push_str(&emphasize_plain(&text[cursor..marker.start()]));
        out.push_str(marker.as_str());
        cursor = marker.end();
    }
    out.push_str(&emphasize_plain(&text[cursor..]));
    out
}

fn emphasize_plain(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut cursor = 0;
    for word in EMPHASIS_WORDS.find_iter(segment) {
        out.push_str(&segment[cursor..word.start()]);
        let already_bold =
            segment[..word.start()].ends_with("<b>") && segment[word.end()..].starts_with("</b>");
        if already_bold {
            out.push_str(word.as_str());
        } else {
            out.push_str("<b>");
            out.push_str(word.as_str());
            out.push_str("</b>");
        }
        cursor = word.end();
    }
    out.push_str(&segment[cursor..]);
    out
}
