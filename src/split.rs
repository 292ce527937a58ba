//! Message splitting for platforms with hard size limits.

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Prefers breaking at the last newline inside the window so lines stay
/// whole; falls back to a hard cut when a single line overflows the
/// window. Each carried-over remainder has its leading whitespace
/// dropped, so continuation chunks never start mid-indentation.
///
/// `max_chars == 0` disables splitting. Empty input yields no chunks, and
/// no produced chunk is ever empty. Limits are counted in characters, not
/// bytes, so multi-byte content never splits inside a code point.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = text;
    while current.chars().count() > max_chars {
        let window_end = byte_of_char(current, max_chars);
        let (head_end, resume) = match current[..window_end].rfind('\n') {
            Some(pos) => (pos, pos + 1),
            None => (window_end, window_end),
        };
        let head = &current[..head_end];
        if !head.is_empty() {
            parts.push(head.to_string());
        }
        current = current[resume..].trim_start();
    }
    if !current.is_empty() {
        parts.push(current.to_string());
    }
    parts
}

/// Byte offset just past the first `nth` characters of `s`.
fn byte_of_char(s: &str, nth: usize) -> usize {
    s.char_indices().nth(nth).map_or(s.len(), |(i, _)| i)
}
