//! Shared HTML re-emission helpers.
//!
//! scraper trees are read-only, so both the paragraph map builder and the
//! span compiler produce their output by re-serializing the parsed tree as
//! they walk it. Attribute order is preserved by the parser, which keeps the
//! output deterministic for identical input.

use scraper::node::Element;

/// Elements with no closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements whose text content is raw (never entity-escaped on output, never
/// eligible for highlight spans).
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

pub(crate) fn is_void(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

pub(crate) fn is_raw_text(name: &str) -> bool {
    RAW_TEXT_ELEMENTS.contains(&name)
}

/// Escapes text-node content.
pub(crate) fn escape_text(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
}

/// Escapes attribute values (double-quoted).
pub(crate) fn escape_attr(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}

/// Emits a start tag, carrying over the element's attributes. When `extra`
/// is given it wins over any attribute of the same name already present.
pub(crate) fn start_tag(element: &Element, extra: Option<(&str, &str)>, out: &mut String) {
    out.push('<');
    out.push_str(element.name());
    for (name, value) in element.attrs() {
        if let Some((extra_name, _)) = extra {
            if name == extra_name {
                continue;
            }
        }
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        escape_attr(value, out);
        out.push('"');
    }
    if let Some((name, value)) = extra {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        escape_attr(value, out);
        out.push('"');
    }
    out.push('>');
}

/// Emits an end tag unless the element is void.
pub(crate) fn end_tag(element: &Element, out: &mut String) {
    if !is_void(element.name()) {
        out.push_str("</");
        out.push_str(element.name());
        out.push('>');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Node};

    fn first_element(html: &str) -> Element {
        let doc = Html::parse_fragment(html);
        doc.tree
            .root()
            .descendants()
            .find_map(|node| match node.value() {
                Node::Element(el) if el.name() != "html" => Some(el.clone()),
                _ => None,
            })
            .expect("fragment has an element")
    }

    #[test]
    fn test_start_tag_preserves_attributes() {
        let el = first_element("<p class=\"lede\" id=\"p1\">x</p>");
        let mut out = String::new();
        start_tag(&el, None, &mut out);
        assert_eq!(out, "<p class=\"lede\" id=\"p1\">");
    }

    #[test]
    fn test_extra_attribute_replaces_existing() {
        let el = first_element("<p data-para=\"9\">x</p>");
        let mut out = String::new();
        start_tag(&el, Some(("data-para", "2")), &mut out);
        assert_eq!(out, "<p data-para=\"2\">");
    }

    #[test]
    fn test_text_escaping() {
        let mut out = String::new();
        escape_text("a < b & c > d", &mut out);
        assert_eq!(out, "a &lt; b &amp; c &gt; d");
    }

    #[test]
    fn test_attr_escaping_quotes() {
        let mut out = String::new();
        escape_attr("say \"hi\"", &mut out);
        assert_eq!(out, "say &quot;hi&quot;");
    }

    #[test]
    fn test_void_elements_have_no_end_tag() {
        let el = first_element("<p>a<br>b</p>");
        assert_eq!(el.name(), "p");
        assert!(is_void("br"));
        assert!(!is_void("p"));
    }
}
