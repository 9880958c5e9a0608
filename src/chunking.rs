//! Splitting cleaned document text into overlapping windows.
//!
//! Windows are measured in characters. A window prefers to end right after
//! a sentence terminator, then after whitespace, and only cuts mid-word when
//! neither is available.

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Default overlap between adjacent chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Sentence endings tried in order when picking a break point.
const SENTENCE_BREAKS: [&str; 6] = [". ", "! ", "? ", ".\n", "!\n", "?\n"];

/// How far back from the window end to look for whitespace.
const WHITESPACE_LOOKBACK: usize = 100;

/// A chunk of text from a larger document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Trimmed chunk text.
    pub text: String,
    /// Zero-based chunk index within the document.
    pub index: usize,
    /// Byte offset of `text` in the original document.
    pub start_offset: usize,
}

/// Split text into overlapping chunks.
///
/// Empty or whitespace-only windows are skipped. UTF-8 safe.
///
/// # Examples
///
/// ```
/// use docchat::chunking::chunk_text;
///
/// let chunks = chunk_text("Hello, world!", 500, 50);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].text, "Hello, world!");
///
/// let text = "This is a sentence. ".repeat(60);
/// let chunks = chunk_text(&text, 500, 50);
/// assert!(chunks.len() >= 3);
/// assert!(chunks[0].text.ends_with('.'));
/// ```
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    // char index -> byte index, with one extra entry for the end of text
    let char_to_byte: Vec<usize> = text
        .char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = char_to_byte.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < char_count {
        let mut end = (start + chunk_size).min(char_count);
        if end < char_count {
            end = find_break(text, &char_to_byte, start, end);
        }

        let window = &text[char_to_byte[start]..char_to_byte[end]];
        let trimmed = window.trim();
        if !trimmed.is_empty() {
            let leading = window.len() - window.trim_start().len();
            chunks.push(Chunk {
                text: trimmed.to_string(),
                index: chunks.len(),
                start_offset: char_to_byte[start] + leading,
            });
        }

        if end >= char_count {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

/// Pick where a window starting at `start` and nominally ending at `end`
/// (both char indices) should actually end.
fn find_break(text: &str, char_to_byte: &[usize], start: usize, end: usize) -> usize {
    let start_byte = char_to_byte[start];
    let end_byte = char_to_byte[end];
    let window = &text[start_byte..end_byte];
    let to_char = |byte: usize| char_to_byte.partition_point(|&b| b < byte);

    for terminator in SENTENCE_BREAKS {
        if let Some(pos) = window.rfind(terminator)
            && pos > 0
        {
            return to_char(start_byte + pos + terminator.len());
        }
    }

    let lookback_byte = char_to_byte[end.saturating_sub(WHITESPACE_LOOKBACK).max(start)];
    if let Some((pos, c)) = text[lookback_byte..end_byte]
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
    {
        let cut = to_char(lookback_byte + pos + c.len_utf8());
        if cut > start {
            return cut;
        }
    }

    end
}
