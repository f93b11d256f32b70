//! Deterministic HTML → character-sequence extraction.
//!
//! The extracted sequence is the coordinate system every highlight range is
//! measured against. The browser runs an equivalent walker over the same
//! HTML; the two must agree on every offset, so the traversal rules are
//! deliberately minimal: depth-first over text nodes, nothing else emits
//! characters, whitespace kept verbatim.

use scraper::{Html, Node};

/// Extracts the textual content of an HTML fragment in document order.
///
/// Element boundaries contribute no characters; consecutive inline or block
/// elements insert no separators. Entities are decoded by the parser before
/// counting (`&amp;` is one character). Malformed input is accepted via the
/// lenient parser; empty input yields the empty string.
pub fn extract_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::new();
    for node in fragment.tree.root().descendants() {
        if let Node::Text(text) = node.value() {
            out.push_str(&text.text);
        }
    }
    out
}

/// Length of a string in characters (Unicode scalar values).
///
/// All offsets in this crate count characters, never bytes; a highlight at
/// `[10, 20]` means the same thing on the server as in the browser.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Returns the substring covering character offsets `[start, end)`.
///
/// Out-of-range offsets clamp to the end of the string.
pub fn slice_chars(s: &str, start: usize, end: usize) -> String {
    s.chars().skip(start).take(end.saturating_sub(start)).collect()
}
