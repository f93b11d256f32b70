//! Paragraph map construction and `data-para` attribute injection.
//!
//! A paragraph map keys the first character offset of every numbered
//! paragraph to its number. Two numbering modes exist: sequential
//! auto-numbering of prose blocks, and source numbering read off `li[value]`
//! elements (Australian court judgments ship their paragraph numbers that
//! way). The builder walks the parsed HTML once, producing the map and the
//! re-serialized HTML with `data-para` attributes in the same pass.

use crate::emit::{end_tag, escape_text, is_raw_text, start_tag};
use ego_tree::NodeRef;
use scraper::node::Element;
use scraper::{Html, Node};
use std::collections::BTreeMap;

/// How paragraph numbers are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberingMode {
    /// Sequential `1, 2, 3, …` over prose blocks in document order.
    Auto,
    /// Numbers read from `value` attributes of `li` elements; gaps preserved.
    Source,
}

/// Mapping from first-character offsets to paragraph numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParagraphMap {
    entries: BTreeMap<usize, u32>,
}

impl ParagraphMap {
    /// Builds a map from explicit entries. Mostly useful to hosts and tests;
    /// the usual constructor is [`build_paragraph_map`].
    pub fn from_entries(entries: impl IntoIterator<Item = (usize, u32)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub(crate) fn insert(&mut self, offset: usize, number: u32) {
        self.entries.insert(offset, number);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates `(first_char_offset, paragraph_number)` in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.entries.iter().map(|(offset, number)| (*offset, *number))
    }

    /// The paragraph containing `offset`: the entry with the greatest key
    /// less than or equal to it.
    pub fn para_at(&self, offset: usize) -> Option<u32> {
        self.entries
            .range(..=offset)
            .next_back()
            .map(|(_, number)| *number)
    }

    /// Formats the paragraph reference for a character range.
    ///
    /// Returns `""` when no paragraph precedes `start`, `"[N]"` when both
    /// ends fall in the same paragraph, and `"[N]-[M]"` otherwise. Computed
    /// once at highlight creation; never recomputed on rebuilds.
    pub fn lookup_para_ref(&self, start: usize, end: usize) -> String {
        let Some(first) = self.para_at(start) else {
            return String::new();
        };
        let last = self.para_at(end).unwrap_or(first);
        if first == last {
            format!("[{first}]")
        } else {
            format!("[{first}]-[{last}]")
        }
    }
}

/// Classifies a document: source-numbered when it carries at least two
/// `li[value]` elements, auto-numbered otherwise.
pub fn detect_numbering_mode(html: &str) -> NumberingMode {
    let doc = Html::parse_fragment(html);
    let numbered_items = doc
        .tree
        .root()
        .descendants()
        .filter(|node| match node.value() {
            Node::Element(el) => el.name() == "li" && el.attr("value").is_some(),
            _ => false,
        })
        .count();
    if numbered_items >= 2 {
        NumberingMode::Source
    } else {
        NumberingMode::Auto
    }
}

/// Builds the paragraph map for `html` using the detected numbering mode and
/// returns it with the HTML re-serialized to carry `data-para` attributes.
pub fn build_paragraph_map(html: &str) -> (ParagraphMap, String) {
    build_with_mode(html, detect_numbering_mode(html))
}

/// Builds the paragraph map with an explicit numbering mode.
pub fn build_with_mode(html: &str, mode: NumberingMode) -> (ParagraphMap, String) {
    let doc = Html::parse_fragment(html);
    let mut builder = Builder {
        mode,
        next_auto: 1,
        offset: 0,
        map: ParagraphMap::default(),
        out: String::new(),
    };
    for child in doc.root_element().children() {
        builder.walk(child);
    }
    (builder.map, builder.out)
}

struct Builder {
    mode: NumberingMode,
    next_auto: u32,
    offset: usize,
    map: ParagraphMap,
    out: String,
}

impl Builder {
    fn walk(&mut self, node: NodeRef<'_, Node>) {
        match node.value() {
            Node::Text(text) => self.emit_text(node, &text.text),
            Node::Comment(comment) => {
                self.out.push_str("<!--");
                self.out.push_str(&comment.comment);
                self.out.push_str("-->");
            }
            Node::Element(element) => self.walk_element(node, element),
            _ => {
                for child in node.children() {
                    self.walk(child);
                }
            }
        }
    }

    fn emit_text(&mut self, node: NodeRef<'_, Node>, text: &str) {
        let raw = node
            .parent()
            .map(|parent| match parent.value() {
                Node::Element(el) => is_raw_text(el.name()),
                _ => false,
            })
            .unwrap_or(false);
        if raw {
            self.out.push_str(text);
        } else {
            escape_text(text, &mut self.out);
        }
        self.offset += text.chars().count();
    }

    fn walk_element(&mut self, node: NodeRef<'_, Node>, element: &Element) {
        let name = element.name();
        match self.mode {
            NumberingMode::Auto => {
                if name == "p" {
                    self.walk_paragraph(node, element);
                    return;
                }
                // blockquote delegates to the paragraphs it wraps; a bare
                // blockquote (or pre) is a paragraph of its own
                let bare_quote = name == "blockquote" && !has_paragraph_descendant(node);
                if (name == "pre" || bare_quote) && has_visible_text(node) {
                    let number = self.next_auto;
                    self.next_auto += 1;
                    self.numbered_block(node, element, number);
                    return;
                }
            }
            NumberingMode::Source => {
                if name == "li" {
                    let value = element
                        .attr("value")
                        .and_then(|raw| raw.trim().parse::<u32>().ok());
                    if let Some(number) = value {
                        if has_visible_text(node) {
                            self.numbered_block(node, element, number);
                            return;
                        }
                    }
                }
            }
        }
        self.plain_element(node, element);
    }

    fn plain_element(&mut self, node: NodeRef<'_, Node>, element: &Element) {
        start_tag(element, None, &mut self.out);
        for child in node.children() {
            self.walk(child);
        }
        end_tag(element, &mut self.out);
    }

    fn numbered_block(&mut self, node: NodeRef<'_, Node>, element: &Element, number: u32) {
        self.map.insert(self.offset, number);
        let label = number.to_string();
        start_tag(element, Some(("data-para", &label)), &mut self.out);
        for child in node.children() {
            self.walk(child);
        }
        end_tag(element, &mut self.out);
    }

    /// Handles a `p` element, splitting `<br><br>` sequences into
    /// pseudo-paragraphs. The `p` tag itself carries the first segment's
    /// number; later segments are wrapped in numbered spans.
    fn walk_paragraph(&mut self, node: NodeRef<'_, Node>, element: &Element) {
        let children: Vec<NodeRef<'_, Node>> = node.children().collect();
        let mut segments: Vec<Vec<NodeRef<'_, Node>>> = Vec::new();
        let mut boundaries: Vec<Vec<NodeRef<'_, Node>>> = Vec::new();
        let mut current: Vec<NodeRef<'_, Node>> = Vec::new();

        let mut i = 0;
        while i < children.len() {
            if is_br(&children[i]) {
                let mut j = i + 1;
                while j < children.len() && is_ws_text(&children[j]) {
                    j += 1;
                }
                if j < children.len() && is_br(&children[j]) {
                    // absorb any further consecutive breaks into one boundary
                    let mut end = j + 1;
                    loop {
                        let mut m = end;
                        while m < children.len() && is_ws_text(&children[m]) {
                            m += 1;
                        }
                        if m < children.len() && is_br(&children[m]) {
                            end = m + 1;
                        } else {
                            break;
                        }
                    }
                    segments.push(std::mem::take(&mut current));
                    boundaries.push(children[i..end].to_vec());
                    i = end;
                    continue;
                }
            }
            current.push(children[i]);
            i += 1;
        }
        segments.push(current);

        let numbers: Vec<Option<u32>> = segments
            .iter()
            .map(|segment| {
                if segment.iter().any(|n| has_visible_text(*n)) {
                    let number = self.next_auto;
                    self.next_auto += 1;
                    Some(number)
                } else {
                    None
                }
            })
            .collect();

        match numbers.first().copied().flatten() {
            Some(number) => {
                let label = number.to_string();
                start_tag(element, Some(("data-para", &label)), &mut self.out);
            }
            None => start_tag(element, None, &mut self.out),
        }

        for (idx, segment) in segments.iter().enumerate() {
            if idx > 0 {
                for boundary_node in &boundaries[idx - 1] {
                    self.walk(*boundary_node);
                }
            }
            match (idx, numbers[idx]) {
                (0, Some(number)) => {
                    self.map.insert(self.offset, number);
                    for child in segment {
                        self.walk(*child);
                    }
                }
                (_, Some(number)) if idx > 0 => {
                    self.map.insert(self.offset, number);
                    self.out.push_str("<span data-para=\"");
                    self.out.push_str(&number.to_string());
                    self.out.push_str("\">");
                    for child in segment {
                        self.walk(*child);
                    }
                    self.out.push_str("</span>");
                }
                _ => {
                    for child in segment {
                        self.walk(*child);
                    }
                }
            }
        }
        end_tag(element, &mut self.out);
    }
}

fn is_br(node: &NodeRef<'_, Node>) -> bool {
    matches!(node.value(), Node::Element(el) if el.name() == "br")
}

fn is_ws_text(node: &NodeRef<'_, Node>) -> bool {
    matches!(node.value(), Node::Text(text) if text.trim().is_empty())
}

fn has_visible_text(node: NodeRef<'_, Node>) -> bool {
    node.descendants().any(|n| match n.value() {
        Node::Text(text) => !text.trim().is_empty(),
        _ => false,
    })
}

fn has_paragraph_descendant(node: NodeRef<'_, Node>) -> bool {
    node.descendants()
        .any(|n| matches!(n.value(), Node::Element(el) if el.name() == "p"))
}
