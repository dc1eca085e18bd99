//! Text helpers used by the extractor and for logging.
//!
//! - Whitespace normalization for text pulled out of HTML
//! - Summary truncation with an ellipsis
//! - Integer scraping from counters like "1,234 views"
//! - Log-friendly truncation of long strings

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));
static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d[\d,]*").expect("static regex"));

/// Length, in characters, of an article summary before truncation.
pub const SUMMARY_CHARS: usize = 200;

/// Collapse every run of whitespace (including non-breaking and full-width
/// spaces) to a single ASCII space and trim the ends.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(clean_spaces("  a \n\t b  "), "a b");
/// ```
pub fn clean_spaces(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Build a summary from body text.
///
/// Returns the first `max_chars` characters followed by `...` when the text is
/// longer, otherwise the whole text. Counts characters, not bytes, so CJK text
/// is never split inside a code point.
pub fn summarize(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Parse the first integer found in `text`, ignoring thousands separators.
///
/// ```ignore
/// assert_eq!(first_integer("1,234 views"), Some(1234));
/// assert_eq!(first_integer("no digits"), None);
/// ```
pub fn first_integer(text: &str) -> Option<i64> {
    let found = DIGITS.find(text)?;
    found.as_str().replace(',', "").parse().ok()
}

/// Truncate a string for logging purposes.
///
/// Long strings are cut to `max` characters with an ellipsis and a count of
/// the dropped bytes appended.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…(+{} bytes)", &s[..cut], s.len() - cut),
        None => s.to_string(),
    }
}
