//! JSON recovery from model completions.
//!
//! Models wrap JSON in prose and code fences despite instructions. The
//! contract: strip fence markers, locate the first balanced `{…}` or `[…]`
//! substring, parse strictly. Anything else fails the provider attempt.

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JsonExtractError {
    #[error("no JSON object or array found")]
    NotFound,
    #[error("unbalanced JSON starting at byte {0}")]
    Unbalanced(usize),
    #[error("invalid JSON: {0}")]
    Invalid(String),
}

/// Extract and strictly parse the first JSON value in `text`.
pub fn extract_json(text: &str) -> Result<serde_json::Value, JsonExtractError> {
    let stripped = strip_fences(text);
    let start = stripped
        .find(['{', '['])
        .ok_or(JsonExtractError::NotFound)?;
    let candidate = balanced_slice(&stripped[start..]).ok_or(JsonExtractError::Unbalanced(start))?;
    serde_json::from_str(candidate).map_err(|e| JsonExtractError::Invalid(e.to_string()))
}

/// Remove Markdown fence marker lines (```json, ```), keeping their content.
fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Return the shortest prefix of `s` that is a balanced JSON value,
/// honouring string literals and escapes.
fn balanced_slice(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let (open, close) = match bytes.first()? {
        b'{' => (b'{', b'}'),
        b'[' => (b'[', b']'),
        _ => return None,
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
