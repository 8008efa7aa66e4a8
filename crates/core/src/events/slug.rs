use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

pub const SLUG_PART_MAX: usize = 80;
pub const EVENT_ID_MAX: usize = 120;

/// Lower-case ASCII slug: diacritics stripped, every run of other characters
/// collapsed to `_`, leading/trailing `_` trimmed, capped at 80 chars.
pub fn slug_part(value: &str) -> String {
    let folded: String = value
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    let mut out = String::with_capacity(folded.len());
    let mut pending_sep = false;
    for c in folded.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out.truncate(SLUG_PART_MAX);
    out.trim_end_matches('_').to_string()
}

/// Cut `value` to at most `max` characters, on a char boundary.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
