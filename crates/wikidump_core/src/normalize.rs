//! Storage-format markup to portable HTML.
//!
//! The input is parsed into a small owned tree, proprietary elements are
//! replaced through [`RULES`], and the tree is serialized back to HTML.
//! Normalization never fails: anything the tokenizer cannot read, and
//! anything nested deeper than [`MAX_DEPTH`], is kept as escaped text.

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::escape::{escape, partial_escape, resolve_html5_entity};
use quick_xml::events::{BytesStart, Event};

pub const BROKEN_LINK_PLACEHOLDER: &str = "[broken link]";

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements nested deeper than this are kept as escaped text.
pub const MAX_DEPTH: usize = 512;

type RewriteRule = fn(&Element) -> Option<Node>;

/// Element name to rewrite rule, checked in order.
const RULES: &[(&str, RewriteRule)] = &[
    ("ac:image", rewrite_image),
    ("ac:link", rewrite_link),
    ("ac:structured-macro", rewrite_macro),
    ("ac:macro", rewrite_macro),
    ("ac:plain-text-body", rewrite_plain_text_body),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    /// Character data exactly as it appeared in the source (entities intact).
    Text(String),
    CData(String),
    /// Markup emitted verbatim: comments and doctypes.
    Raw(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    /// Attribute names with unescaped values.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.push((name.to_string(), value.to_string()));
        self
    }

    fn with_text(mut self, text: &str) -> Self {
        self.children
            .push(Node::Text(partial_escape(text).into_owned()));
        self
    }

    fn from_start(start: &BytesStart<'_>) -> Self {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let attributes = start
            .html_attributes()
            .with_checks(false)
            .map_while(Result::ok)
            .map(|attribute| {
                let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
                let value = attribute
                    .unescape_value_with(resolve_html5_entity)
                    .map(Cow::into_owned)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attribute.value).into_owned());
                (key, value)
            })
            .collect();
        Self {
            name,
            attributes,
            children: Vec::new(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// First descendant element named `name`, in document order.
    pub fn find(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if let Node::Element(element) = child {
                if element.is(name) {
                    return Some(element);
                }
                if let Some(found) = element.find(name) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn descendant_attribute(&self, element: &str, attribute: &str) -> Option<String> {
        self.find(element)
            .and_then(|found| found.attribute(attribute))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    }

    /// Text-bearing descendants flattened into passthrough text nodes.
    fn text_nodes(&self, out: &mut Vec<Node>) {
        for child in &self.children {
            match child {
                Node::Text(text) => out.push(Node::Text(text.clone())),
                Node::CData(data) => out.push(Node::Text(partial_escape(data).into_owned())),
                Node::Element(element) => element.text_nodes(out),
                Node::Raw(_) => {}
            }
        }
    }
}

pub fn normalize(raw_markup: &str) -> String {
    let nodes = rewrite_nodes(parse(raw_markup));
    let mut output = String::with_capacity(raw_markup.len());
    for node in &nodes {
        write_node(node, &mut output);
    }
    output
}

/// Parse markup into a forest. Unmatched end tags are ignored, unclosed
/// elements are closed at end of input.
pub fn parse(raw_markup: &str) -> Vec<Node> {
    let mut reader = Reader::from_str(raw_markup);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut tree = TreeBuilder::default();
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                if tree.depth() >= MAX_DEPTH {
                    let position = usize::try_from(reader.buffer_position()).unwrap_or(usize::MAX);
                    let tag = format!("<{}>", String::from_utf8_lossy(&start));
                    let rest = raw_markup.get(position..).unwrap_or_default();
                    tree.push(Node::Text(partial_escape(&format!("{tag}{rest}")).into_owned()));
                    break;
                }
                tree.open(Element::from_start(&start));
            }
            Ok(Event::Empty(start)) => tree.push(Node::Element(Element::from_start(&start))),
            Ok(Event::End(end)) => tree.close(&String::from_utf8_lossy(end.name().as_ref())),
            Ok(Event::Text(text)) => {
                tree.push(Node::Text(String::from_utf8_lossy(&text).into_owned()));
            }
            Ok(Event::CData(data)) => {
                tree.push(Node::CData(String::from_utf8_lossy(&data).into_owned()));
            }
            Ok(Event::Comment(comment)) => tree.push(Node::Raw(format!(
                "<!--{}-->",
                String::from_utf8_lossy(&comment)
            ))),
            Ok(Event::DocType(doctype)) => tree.push(Node::Raw(format!(
                "<!DOCTYPE {}>",
                String::from_utf8_lossy(&doctype)
            ))),
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) => {}
            Ok(Event::Eof) => break,
            Err(_) => {
                let position = usize::try_from(reader.error_position()).unwrap_or(0);
                let rest = raw_markup.get(position..).unwrap_or_default();
                if !rest.is_empty() {
                    tree.push(Node::Text(partial_escape(rest).into_owned()));
                }
                break;
            }
        }
    }
    tree.finish()
}

#[derive(Debug, Default)]
struct TreeBuilder {
    roots: Vec<Node>,
    open: Vec<Element>,
}

impl TreeBuilder {
    fn depth(&self) -> usize {
        self.open.len()
    }

    fn open(&mut self, element: Element) {
        self.open.push(element);
    }

    fn push(&mut self, node: Node) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.roots.push(node),
        }
    }

    fn close(&mut self, name: &str) {
        let Some(index) = self.open.iter().rposition(|element| element.name == name) else {
            return;
        };
        while self.open.len() > index {
            if let Some(element) = self.open.pop() {
                self.push(Node::Element(element));
            }
        }
    }

    fn finish(mut self) -> Vec<Node> {
        while let Some(element) = self.open.pop() {
            self.push(Node::Element(element));
        }
        self.roots
    }
}

fn rule_for(element: &Element) -> Option<RewriteRule> {
    RULES
        .iter()
        .find(|(name, _)| element.is(name))
        .map(|(_, rule)| *rule)
}

/// Top-down, left-to-right rewrite. Replacement nodes are not revisited.
fn rewrite_nodes(nodes: Vec<Node>) -> Vec<Node> {
    let mut output = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Element(element) => match rule_for(&element) {
                Some(rule) => output.extend(rule(&element)),
                None => {
                    let Element {
                        name,
                        attributes,
                        children,
                    } = element;
                    output.push(Node::Element(Element {
                        name,
                        attributes,
                        children: rewrite_nodes(children),
                    }));
                }
            },
            other => output.push(other),
        }
    }
    output
}

pub fn rewrite_image(image: &Element) -> Option<Node> {
    let src = image
        .descendant_attribute("ri:attachment", "ri:filename")
        .or_else(|| image.descendant_attribute("ri:url", "ri:value"))?;
    Some(Node::Element(Element::new("img").with_attribute("src", &src)))
}

pub fn rewrite_link(link: &Element) -> Option<Node> {
    let target = link
        .descendant_attribute("ri:page", "ri:content-title")
        .or_else(|| link.descendant_attribute("ri:url", "ri:value"));
    match target {
        Some(target) => Some(Node::Element(
            Element::new("a")
                .with_attribute("href", &target)
                .with_text(&target),
        )),
        None => Some(Node::Text(BROKEN_LINK_PLACEHOLDER.to_string())),
    }
}

pub fn rewrite_macro(macro_block: &Element) -> Option<Node> {
    let name = macro_block.attribute("ac:name").unwrap_or_default();
    Some(Node::Element(Element::new("div").with_text(name)))
}

pub fn rewrite_plain_text_body(body: &Element) -> Option<Node> {
    let mut paragraph = Element::new("p");
    body.text_nodes(&mut paragraph.children);
    Some(Node::Element(paragraph))
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Element(element) => write_element(element, out),
        Node::Text(text) | Node::Raw(text) => out.push_str(text),
        Node::CData(data) => out.push_str(&partial_escape(data)),
    }
}

fn write_element(element: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&element.name);
    for (name, value) in &element.attributes {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape(value));
        out.push('"');
    }
    out.push('>');

    let is_void = VOID_ELEMENTS
        .iter()
        .any(|void| element.name.eq_ignore_ascii_case(void));
    if is_void && element.children.is_empty() {
        return;
    }
    for child in &element.children {
        write_node(child, out);
    }
    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::{BROKEN_LINK_PLACEHOLDER, Element, MAX_DEPTH, Node, normalize, parse, rewrite_image};

    #[test]
    fn image_with_attachment_becomes_img() {
        let html = normalize(
            r#"<p><ac:image ac:height="250"><ri:attachment ri:filename="diagram.png" /></ac:image></p>"#,
        );
        assert_eq!(html, r#"<p><img src="diagram.png"></p>"#);
    }

    #[test]
    fn image_falls_back_to_url() {
        let html = normalize(r#"<ac:image><ri:url ri:value="https://cdn.example/logo.svg" /></ac:image>"#);
        assert_eq!(html, r#"<img src="https://cdn.example/logo.svg">"#);
    }

    #[test]
    fn image_prefers_attachment_over_url() {
        let html = normalize(
            r#"<ac:image><ri:url ri:value="https://cdn.example/x.png"/><ri:attachment ri:filename="local.png"/></ac:image>"#,
        );
        assert_eq!(html, r#"<img src="local.png">"#);
    }

    #[test]
    fn image_without_reference_is_dropped() {
        let html = normalize(r#"<p>before<ac:image ac:width="10"></ac:image>after</p>"#);
        assert_eq!(html, "<p>beforeafter</p>");
        assert!(!html.contains("<img"));
        assert!(!html.contains("ac:image"));
    }

    #[test]
    fn image_rule_is_pure_over_the_element() {
        let image = Element::new("ac:image");
        assert_eq!(rewrite_image(&image), None);
    }

    #[test]
    fn link_to_page_uses_title_for_href_and_text() {
        let html = normalize(
            r#"<ac:link><ri:page ri:content-title="Release Notes" /><ac:plain-text-link-body><![CDATA[notes]]></ac:plain-text-link-body></ac:link>"#,
        );
        assert_eq!(html, r#"<a href="Release Notes">Release Notes</a>"#);
    }

    #[test]
    fn link_falls_back_to_url() {
        let html = normalize(r#"<ac:link><ri:url ri:value="https://example.org/a?b=1&amp;c=2" /></ac:link>"#);
        assert_eq!(
            html,
            r#"<a href="https://example.org/a?b=1&amp;c=2">https://example.org/a?b=1&amp;c=2</a>"#
        );
    }

    #[test]
    fn unresolvable_link_becomes_placeholder_text() {
        let html = normalize(r#"<p>see <ac:link><ri:user ri:account-id="abc" /></ac:link></p>"#);
        assert_eq!(html, format!("<p>see {BROKEN_LINK_PLACEHOLDER}</p>"));
    }

    #[test]
    fn macro_is_labelled_not_expanded() {
        let html = normalize(
            r#"<ac:structured-macro ac:name="toc" ac:schema-version="1"><ac:parameter ac:name="maxLevel">2</ac:parameter></ac:structured-macro>"#,
        );
        assert_eq!(html, "<div>toc</div>");
    }

    #[test]
    fn macro_without_name_is_empty_div() {
        assert_eq!(
            normalize("<ac:structured-macro></ac:structured-macro>"),
            "<div></div>"
        );
    }

    #[test]
    fn plain_text_body_becomes_paragraph() {
        let html = normalize(
            "<ac:plain-text-body><![CDATA[let x = a < b;]]></ac:plain-text-body>",
        );
        assert_eq!(html, "<p>let x = a &lt; b;</p>");
    }

    #[test]
    fn code_macro_is_replaced_as_a_whole() {
        let html = normalize(
            r#"<ac:structured-macro ac:name="code"><ac:plain-text-body><![CDATA[fn main() {}]]></ac:plain-text-body></ac:structured-macro>"#,
        );
        assert_eq!(html, "<div>code</div>");
    }

    #[test]
    fn plain_html_passes_through_with_entities() {
        let html = normalize(r#"<h1 class="title">A&nbsp;B</h1><p>x<br/>y</p><table><tbody><tr><td/></tr></tbody></table>"#);
        assert_eq!(
            html,
            r#"<h1 class="title">A&nbsp;B</h1><p>x<br>y</p><table><tbody><tr><td></td></tr></tbody></table>"#
        );
    }

    #[test]
    fn no_proprietary_markup_survives() {
        let html = normalize(
            r#"<p><ac:image><ri:attachment ri:filename="a.png"/></ac:image><ac:link></ac:link><ac:structured-macro ac:name="info"/></p>"#,
        );
        assert!(!html.contains("ac:"));
        assert!(!html.contains("ri:"));
        assert_eq!(
            html,
            r#"<p><img src="a.png">[broken link]<div>info</div></p>"#
        );
    }

    #[test]
    fn mismatched_tags_do_not_fail() {
        let html = normalize("<p><b>bold</p> tail</i>");
        assert_eq!(html, "<p><b>bold</b></p> tail");
    }

    #[test]
    fn unclosed_elements_are_closed_at_end() {
        assert_eq!(normalize("<div><p>open"), "<div><p>open</p></div>");
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn normalize_is_deterministic() {
        let raw = r#"<p>a<ac:link><ri:page ri:content-title="T"/></ac:link></p>"#;
        assert_eq!(normalize(raw), normalize(raw));
    }

    #[test]
    fn parse_keeps_document_order() {
        let nodes = parse("<a>1</a>2<b/>");
        assert_eq!(nodes.len(), 3);
        assert!(matches!(&nodes[0], Node::Element(element) if element.name == "a"));
        assert_eq!(nodes[1], Node::Text("2".to_string()));
        assert!(matches!(&nodes[2], Node::Element(element) if element.name == "b"));
    }

    #[test]
    fn deep_nesting_is_cut_off_as_text() {
        let depth = 5000;
        let raw = format!("{}x{}", "<div>".repeat(depth), "</div>".repeat(depth));
        let html = normalize(&raw);

        assert!(html.starts_with(&"<div>".repeat(MAX_DEPTH)));
        assert!(!html.starts_with(&"<div>".repeat(MAX_DEPTH + 1)));
        assert!(html.contains("&lt;div&gt;&lt;div&gt;x&lt;/div&gt;"));
        assert!(html.ends_with(&"</div>".repeat(MAX_DEPTH)));
    }

    #[test]
    fn html_entities_in_attributes_are_not_double_escaped() {
        let html = normalize(r#"<span title="a&nbsp;b &amp; c">t</span>"#);
        assert_eq!(html, "<span title=\"a\u{a0}b &amp; c\">t</span>");
        assert!(!html.contains("&amp;nbsp;"));
    }
}
