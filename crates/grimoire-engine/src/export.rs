//! Export read path.
//!
//! Bridges a replica's highlights into the span compiler: resolves tag
//! display names through the catalogue, formats margin notes, and assigns
//! colors from the host's tag → color map.

use crate::replica::AnnotationReplica;
use crate::tags::TagCatalogue;
use grimoire_proto::Tag;
use grimoire_text::{SpanHighlight, compile_spans, format_margin_note};
use std::collections::HashMap;

/// Color identifier used when the host's color map has no entry for a tag.
const FALLBACK_COLOR: &str = "none";

/// Compiles a document's highlights into export HTML. Reads a consistent
/// snapshot of the replica; with no highlights the input HTML comes back
/// untouched.
pub fn compile_export_html(
    html: &str,
    replica: &AnnotationReplica,
    catalogue: &dyn TagCatalogue,
    colors: &HashMap<Tag, String>,
) -> String {
    let spans: Vec<SpanHighlight> = replica
        .highlights()
        .iter()
        .map(|highlight| {
            let tag_display = catalogue
                .resolve(&highlight.tag)
                .unwrap_or_else(|| highlight.tag.to_string());
            let comments: Vec<(String, String)> = highlight
                .comments
                .iter()
                .map(|comment| (comment.author.clone(), comment.text.clone()))
                .collect();
            SpanHighlight {
                start_char: highlight.start_char as usize,
                end_char: highlight.end_char as usize,
                color: colors
                    .get(&highlight.tag)
                    .cloned()
                    .unwrap_or_else(|| FALLBACK_COLOR.to_string()),
                note: Some(format_margin_note(
                    &highlight.author,
                    &tag_display,
                    &highlight.para_ref,
                    &highlight.created_at,
                    &comments,
                )),
            }
        })
        .collect();
    compile_spans(html, &spans)
}
