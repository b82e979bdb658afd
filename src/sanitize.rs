//! Document-text scrubbing before prompt assembly.
//!
//! Parsed PDF text is attacker-controlled: hidden instructions, chat
//! template tokens, and zero-width characters all survive OCR. Every piece
//! of document text is scrubbed here before it reaches a prompt template.

use std::sync::LazyLock;

use regex::Regex;

/// Cap on sanitized text handed to a single prompt.
pub const MAX_PROMPT_CHARS: usize = 8_000;

struct InjectionPattern {
    regex: Regex,
    label: &'static str,
}

static INJECTION_PATTERNS: LazyLock<Vec<InjectionPattern>> = LazyLock::new(|| {
    let patterns: [(&str, &str); 8] = [
        (r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions?", "IGNORE_PREV_INSTR"),
        (r"(?i)disregard\s+(all\s+)?(previous|prior|above)\s+instructions?", "DISREGARD_INSTR"),
        (r"(?i)your\s+(new\s+)?instructions?\s+(are|is)\s+", "INSTR_OVERRIDE"),
        (r"(?i)you\s+are\s+now\s+(a|an|the)\s+", "ROLE_REDEFINITION"),
        (r"(?i)(print|show|reveal|display|repeat|echo)\s+(your\s+)?(system\s+)?prompt", "SYS_PROMPT_EXFIL"),
        (r"(?i)(print|show|echo|dump)\s+(all\s+)?(env(ironment)?\s+var(iable)?s?|secrets?|api\s+keys?)", "ENV_EXFIL"),
        (r"(?i)<\|?(system|user|assistant|im_start|im_end)\|?>", "CHAT_TEMPLATE_INJECTION"),
        (r"(?i)\[INST\]|\[/?SYS\]|<<SYS>>|<</SYS>>", "TEMPLATE_DELIMITER"),
    ];
    patterns
        .into_iter()
        .map(|(pattern, label)| InjectionPattern {
            regex: Regex::new(pattern).unwrap(),
            label,
        })
        .collect()
});

static ZERO_WIDTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\u{200b}\u{200c}\u{200d}\u{200e}\u{200f}\u{202a}-\u{202e}\u{2060}-\u{2064}\u{feff}]")
        .unwrap()
});

/// Any single "word" longer than this is suspicious (hidden payloads).
const MAX_TOKEN_LENGTH: usize = 500;

#[derive(Debug, Clone)]
pub struct SanitizedText {
    pub cleaned_text: String,
    pub was_modified: bool,
    pub threats_found: Vec<&'static str>,
    pub truncated: bool,
}

/// Scrub raw document text before inserting it into an LLM prompt.
pub fn sanitize_document_text(raw: &str, max_chars: usize) -> SanitizedText {
    let mut threats: Vec<&'static str> = Vec::new();
    let mut text = raw.to_string();

    if ZERO_WIDTH.is_match(&text) {
        threats.push("ZERO_WIDTH_CHARS");
        text = ZERO_WIDTH.replace_all(&text, "").into_owned();
    }

    for pattern in INJECTION_PATTERNS.iter() {
        if pattern.regex.is_match(&text) {
            threats.push(pattern.label);
            text = pattern.regex.replace_all(&text, "[removed]").into_owned();
        }
    }

    // Break up pathologically long tokens.
    if text.split_whitespace().any(|w| w.len() > MAX_TOKEN_LENGTH) {
        threats.push("OVERLONG_TOKEN");
        text = text
            .split_whitespace()
            .map(|w| {
                if w.len() > MAX_TOKEN_LENGTH {
                    &w[..floor_char_boundary(w, MAX_TOKEN_LENGTH)]
                } else {
                    w
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
    }

    let mut truncated = false;
    if text.len() > max_chars {
        truncated = true;
        let cut = floor_char_boundary(&text, max_chars);
        text.truncate(cut);
    }

    let was_modified = !threats.is_empty() || truncated;
    if !threats.is_empty() {
        tracing::warn!(threats = ?threats, "document text sanitized");
    }

    SanitizedText {
        cleaned_text: text,
        was_modified,
        threats_found: threats,
        truncated,
    }
}

/// Largest byte index `<= at` that lands on a char boundary.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut idx = at;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
