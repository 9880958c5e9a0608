/// Upper bound on stored document text, in bytes.
pub const MAX_DOCUMENT_BYTES: usize = 1_000_000;

/// Maximum number of characters in a result preview before truncation.
pub const DEFAULT_PREVIEW_MAX_CHARS: usize = 200;

/// Normalize extracted text for storage.
///
/// Drops NUL, the U+FFFD replacement character and control characters other
/// than tab, CR and LF, then collapses every whitespace run to a single
/// space and trims the ends.
///
/// # Examples
///
/// ```
/// use docchat::text_util::clean_text;
///
/// assert_eq!(clean_text("  a\u{0}b\n\n c\u{fffd} "), "ab c");
/// ```
pub fn clean_text(text: &str) -> String {
    let kept = text.chars().filter(|&c| {
        c != '\u{fffd}' && (!c.is_control() || matches!(c, '\t' | '\r' | '\n'))
    });

    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in kept {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// Cut `text` to at most `max_bytes` bytes without splitting a character.
pub fn safe_truncate(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// First `max_chars` characters of `text`, with `...` appended if cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => format!("{}...", &text[..byte]),
        None => text.to_string(),
    }
}
