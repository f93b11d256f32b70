//! Highlight span compilation for the export read path.
//!
//! Turns a document's highlights into block-respecting display spans. The
//! downstream typesetter silently drops any span that crosses a block
//! boundary, so the compiler never emits one: spans are cut per text node,
//! which is strictly finer than per block. Overlapping highlights merge into
//! shared spans carrying every participant's tier index and color; the last
//! span of each highlight carries its margin-note payload.

use crate::emit::{end_tag, escape_attr, escape_text, is_raw_text, start_tag};
use ego_tree::NodeRef;
use scraper::node::Element;
use scraper::{Html, Node};

/// One highlight as the compiler consumes it. `end_char` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanHighlight {
    pub start_char: usize,
    pub end_char: usize,
    /// Color identifier emitted into `data-colors`.
    pub color: String,
    /// Pre-formatted margin-note payload, attached to the highlight's last
    /// span as `data-annots`.
    pub note: Option<String>,
}

/// Formats the margin-note payload consumed by the export typesetter.
///
/// Layout: `author · tag · para_ref · timestamp`, with each comment appended
/// as `author: text` separated by ` | `. An empty paragraph reference is
/// omitted.
pub fn format_margin_note(
    author: &str,
    tag_display: &str,
    para_ref: &str,
    created_at: &str,
    comments: &[(String, String)],
) -> String {
    let mut note = String::new();
    note.push_str(author);
    note.push_str(" · ");
    note.push_str(tag_display);
    if !para_ref.is_empty() {
        note.push_str(" · ");
        note.push_str(para_ref);
    }
    note.push_str(" · ");
    note.push_str(created_at);
    for (comment_author, comment_text) in comments {
        note.push_str(" | ");
        note.push_str(comment_author);
        note.push_str(": ");
        note.push_str(comment_text);
    }
    note
}

/// Compiles highlights over `html` into export spans.
///
/// Pure: identical inputs produce identical output bytes. With no
/// highlights the input is returned untouched.
pub fn compile_spans(html: &str, highlights: &[SpanHighlight]) -> String {
    if highlights.is_empty() {
        return html.to_string();
    }
    let doc = Html::parse_fragment(html);

    // Tier index: position after sorting by (start, end, input order).
    let mut order: Vec<usize> = (0..highlights.len()).collect();
    order.sort_by_key(|&i| (highlights[i].start_char, highlights[i].end_char, i));
    let tiers: Vec<&SpanHighlight> = order.iter().map(|&i| &highlights[i]).collect();

    // Where each highlight's final covered segment ends, so the walk below
    // knows which span gets the margin note.
    let runs = collect_runs(&doc);
    let last_covered: Vec<Option<usize>> = tiers
        .iter()
        .map(|h| {
            runs.iter()
                .filter(|run| {
                    run.highlightable && run.start < h.end_char && run.end > h.start_char
                })
                .map(|run| run.end.min(h.end_char))
                .max()
        })
        .collect();

    let mut compiler = Compiler {
        tiers,
        last_covered,
        offset: 0,
        out: String::new(),
    };
    for child in doc.root_element().children() {
        compiler.walk(child);
    }
    compiler.out
}

struct Run {
    start: usize,
    end: usize,
    highlightable: bool,
}

fn collect_runs(doc: &Html) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut offset = 0usize;
    for node in doc.root_element().descendants() {
        if let Node::Text(text) = node.value() {
            let len = text.text.chars().count();
            let highlightable = !node
                .parent()
                .map(|parent| match parent.value() {
                    Node::Element(el) => is_raw_text(el.name()),
                    _ => false,
                })
                .unwrap_or(false);
            runs.push(Run {
                start: offset,
                end: offset + len,
                highlightable,
            });
            offset += len;
        }
    }
    runs
}

struct Compiler<'a> {
    tiers: Vec<&'a SpanHighlight>,
    last_covered: Vec<Option<usize>>,
    offset: usize,
    out: String,
}

impl Compiler<'_> {
    fn walk(&mut self, node: NodeRef<'_, Node>) {
        match node.value() {
            Node::Text(text) => self.emit_text(node, &text.text),
            Node::Comment(comment) => {
                self.out.push_str("<!--");
                self.out.push_str(&comment.comment);
                self.out.push_str("-->");
            }
            Node::Element(element) => self.emit_element(node, element),
            _ => {
                for child in node.children() {
                    self.walk(child);
                }
            }
        }
    }

    fn emit_element(&mut self, node: NodeRef<'_, Node>, element: &Element) {
        start_tag(element, None, &mut self.out);
        for child in node.children() {
            self.walk(child);
        }
        end_tag(element, &mut self.out);
    }

    fn emit_text(&mut self, node: NodeRef<'_, Node>, text: &str) {
        let run_start = self.offset;
        let len = text.chars().count();
        let run_end = run_start + len;
        self.offset = run_end;

        let raw = node
            .parent()
            .map(|parent| match parent.value() {
                Node::Element(el) => is_raw_text(el.name()),
                _ => false,
            })
            .unwrap_or(false);
        if raw {
            self.out.push_str(text);
            return;
        }

        // Cut the run at every highlight boundary falling inside it.
        let mut cuts: Vec<usize> = vec![run_start, run_end];
        for h in &self.tiers {
            if h.start_char > run_start && h.start_char < run_end {
                cuts.push(h.start_char);
            }
            if h.end_char > run_start && h.end_char < run_end {
                cuts.push(h.end_char);
            }
        }
        cuts.sort_unstable();
        cuts.dedup();

        // Byte position of each char offset relative to the run start.
        let byte_at: Vec<usize> = text
            .char_indices()
            .map(|(byte, _)| byte)
            .chain(std::iter::once(text.len()))
            .collect();

        for pair in cuts.windows(2) {
            let (seg_start, seg_end) = (pair[0], pair[1]);
            let slice = &text[byte_at[seg_start - run_start]..byte_at[seg_end - run_start]];
            let covering: Vec<usize> = self
                .tiers
                .iter()
                .enumerate()
                .filter(|(_, h)| h.start_char <= seg_start && h.end_char >= seg_end)
                .map(|(tier, _)| tier)
                .collect();
            if covering.is_empty() {
                escape_text(slice, &mut self.out);
            } else {
                self.emit_span(seg_end, &covering, slice);
            }
        }
    }

    fn emit_span(&mut self, seg_end: usize, covering: &[usize], slice: &str) {
        let hl = join_csv(covering.iter().map(|tier| tier.to_string()));
        let colors = join_csv(covering.iter().map(|&tier| self.tiers[tier].color.clone()));
        let depth = match covering.len() {
            1 => "1",
            2 => "2",
            _ => "many",
        };
        let annots: Vec<&str> = covering
            .iter()
            .filter(|&&tier| self.last_covered[tier] == Some(seg_end))
            .filter_map(|&tier| self.tiers[tier].note.as_deref())
            .collect();

        self.out.push_str("<span data-hl=\"");
        self.out.push_str(&hl);
        self.out.push_str("\" data-colors=\"");
        escape_attr(&colors, &mut self.out);
        self.out.push_str("\" data-depth=\"");
        self.out.push_str(depth);
        self.out.push('"');
        if !annots.is_empty() {
            self.out.push_str(" data-annots=\"");
            escape_attr(&annots.join("; "), &mut self.out);
            self.out.push('"');
        }
        self.out.push('>');
        escape_text(slice, &mut self.out);
        self.out.push_str("</span>");
    }
}

fn join_csv(items: impl Iterator<Item = String>) -> String {
    let mut out = String::new();
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&item);
    }
    out
}
