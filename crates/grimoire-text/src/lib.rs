//! # grimoire-text
//!
//! The text-position discipline shared by the collaboration engine, the UI,
//! and the export pipeline:
//! - A deterministic HTML → character-sequence walker (the ground truth for
//!   highlight ranges; mirrored byte-for-byte by the browser client)
//! - The paragraph map builder (`data-para` numbering for display and export)
//! - The highlight span compiler (block-respecting export spans)
//!
//! Everything in this crate is pure and synchronous: same inputs, same bytes
//! out.

mod emit;
mod para_map;
mod spans;
mod walker;

pub use para_map::{
    NumberingMode, ParagraphMap, build_paragraph_map, build_with_mode, detect_numbering_mode,
};
pub use spans::{SpanHighlight, compile_spans, format_margin_note};
pub use walker::{char_len, extract_text, slice_chars};
