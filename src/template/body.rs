//! Owned XML tree for `word/document.xml` plus paragraph helpers.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::TemplateError;

const XML_SPACE: &str = "xml:space";

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    /// Declarations, comments, CDATA and processing instructions, kept as read.
    Other(Event<'static>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
    /// Written back as `<x/>` when it still has no children.
    pub self_closing: bool,
}

fn xml_err(e: impl std::fmt::Display) -> TemplateError {
    TemplateError::Xml(e.to_string())
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
            self_closing: false,
        }
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self, TemplateError> {
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(xml_err)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_err)?.into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attrs,
            children: Vec::new(),
            self_closing: false,
        })
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn set_attr(&mut self, key: &str, value: &str) {
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attrs.push((key.to_string(), value.to_string())),
        }
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|n| match n {
            Node::Element(e) if e.is(name) => Some(e),
            _ => None,
        })
    }

    /// Concatenated character data of this element and its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }
}

fn collect_text(el: &Element, out: &mut String) {
    for child in &el.children {
        match child {
            Node::Element(e) => collect_text(e, out),
            Node::Text(t) if el.is("w:t") => out.push_str(t),
            _ => {}
        }
    }
}

/// Parsed XML part. `nodes` are the top-level nodes, prolog included.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlPart {
    pub nodes: Vec<Node>,
}

impl XmlPart {
    pub fn parse(xml: &str) -> Result<Self, TemplateError> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = vec![Element::new("#root")];

        loop {
            let event = reader.read_event().map_err(xml_err)?;
            match event {
                Event::Start(start) => stack.push(Element::from_start(&start)?),
                Event::Empty(start) => {
                    let mut el = Element::from_start(&start)?;
                    el.self_closing = true;
                    push_child(&mut stack, Node::Element(el))?;
                }
                Event::End(_) => {
                    let el = stack.pop().ok_or_else(|| xml_err("unbalanced end tag"))?;
                    if stack.is_empty() {
                        return Err(xml_err("unbalanced end tag"));
                    }
                    push_child(&mut stack, Node::Element(el))?;
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(xml_err)?.into_owned();
                    push_child(&mut stack, Node::Text(text))?;
                }
                Event::Eof => break,
                other => push_child(&mut stack, Node::Other(other.into_owned()))?,
            }
        }

        match stack.pop() {
            Some(root) if stack.is_empty() => Ok(Self {
                nodes: root.children,
            }),
            _ => Err(xml_err("unclosed element at end of document")),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TemplateError> {
        let mut writer = Writer::new(Vec::new());
        for node in &self.nodes {
            write_node(&mut writer, node)?;
        }
        Ok(writer.into_inner())
    }

    /// The `w:body` element of a WordprocessingML document.
    pub fn body_mut(&mut self) -> Result<&mut Element, TemplateError> {
        self.nodes
            .iter_mut()
            .find_map(|n| match n {
                Node::Element(e) if e.is("w:document") => Some(e),
                _ => None,
            })
            .and_then(|doc| doc.child_mut("w:body"))
            .ok_or(TemplateError::MissingBody)
    }

    pub fn body(&self) -> Result<&Element, TemplateError> {
        self.nodes
            .iter()
            .find_map(|n| match n {
                Node::Element(e) if e.is("w:document") => Some(e),
                _ => None,
            })
            .and_then(|doc| doc.child_elements().find(|e| e.is("w:body")))
            .ok_or(TemplateError::MissingBody)
    }
}

fn push_child(stack: &mut [Element], node: Node) -> Result<(), TemplateError> {
    stack
        .last_mut()
        .map(|parent| parent.children.push(node))
        .ok_or_else(|| xml_err("content outside the root element"))
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> Result<(), TemplateError> {
    match node {
        Node::Element(el) => {
            let start = BytesStart::new(el.name.as_str())
                .with_attributes(el.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            if el.self_closing && el.children.is_empty() {
                writer.write_event(Event::Empty(start)).map_err(xml_err)?;
            } else {
                writer.write_event(Event::Start(start)).map_err(xml_err)?;
                for child in &el.children {
                    write_node(writer, child)?;
                }
                writer
                    .write_event(Event::End(BytesEnd::new(el.name.as_str())))
                    .map_err(xml_err)?;
            }
        }
        Node::Text(text) => {
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(xml_err)?;
        }
        Node::Other(event) => writer.write_event(event.clone()).map_err(xml_err)?,
    }
    Ok(())
}

// =============================================================================
// Paragraphs and runs
// =============================================================================

/// Visit every paragraph under `el` in document order, including paragraphs
/// nested in table cells and text boxes. A paragraph is visited before the
/// paragraphs nested inside it.
pub fn for_each_paragraph_mut(el: &mut Element, f: &mut impl FnMut(&mut Element)) {
    for child in el.children.iter_mut() {
        if let Node::Element(child) = child {
            if child.is("w:p") {
                f(child);
            }
            for_each_paragraph_mut(child, f);
        }
    }
}

pub fn for_each_paragraph(el: &Element, f: &mut impl FnMut(&Element)) {
    for child in el.child_elements() {
        if child.is("w:p") {
            f(child);
        }
        for_each_paragraph(child, f);
    }
}

/// Runs belonging to `paragraph` itself, in order. Hyperlinks, smart tags
/// and similar wrappers are looked through; nested paragraphs are not.
pub fn runs_mut(paragraph: &mut Element) -> Vec<&mut Element> {
    let mut out = Vec::new();
    collect_runs_mut(paragraph, &mut out);
    out
}

fn collect_runs_mut<'a>(el: &'a mut Element, out: &mut Vec<&'a mut Element>) {
    for child in el.children.iter_mut() {
        if let Node::Element(child) = child {
            if child.is("w:r") {
                out.push(child);
            } else if !child.is("w:p") {
                collect_runs_mut(child, out);
            }
        }
    }
}

fn runs(paragraph: &Element) -> Vec<&Element> {
    let mut out = Vec::new();
    collect_runs(paragraph, &mut out);
    out
}

fn collect_runs<'a>(el: &'a Element, out: &mut Vec<&'a Element>) {
    for child in el.child_elements() {
        if child.is("w:r") {
            out.push(child);
        } else if !child.is("w:p") {
            collect_runs(child, out);
        }
    }
}

/// Text of the `w:t` nodes directly inside a run.
pub fn text_nodes(run: &Element) -> Vec<String> {
    run.child_elements()
        .filter(|e| e.is("w:t"))
        .map(Element::text)
        .collect()
}

/// Visible text of a paragraph, excluding nested paragraphs.
pub fn paragraph_text(paragraph: &Element) -> String {
    runs(paragraph)
        .into_iter()
        .flat_map(text_nodes)
        .collect()
}

fn text_element(text: &str) -> Element {
    let mut t = Element::new("w:t");
    t.set_attr(XML_SPACE, "preserve");
    if !text.is_empty() {
        t.children.push(Node::Text(text.to_string()));
    } else {
        t.self_closing = true;
    }
    t
}

/// Nodes for `text` inside a run: one `w:t` per line, `w:br` between lines.
fn text_nodes_for(text: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            let mut br = Element::new("w:br");
            br.self_closing = true;
            nodes.push(Node::Element(br));
        }
        nodes.push(Node::Element(text_element(line.trim_end_matches('\r'))));
    }
    nodes
}

/// Rewrite each `w:t` of `run` through `edit`. Nodes `edit` leaves
/// unchanged are kept as they are.
pub fn edit_run_text(run: &mut Element, edit: &mut impl FnMut(&str) -> Option<String>) {
    let children = std::mem::take(&mut run.children);
    for child in children {
        match child {
            Node::Element(t) if t.is("w:t") => match edit(&t.text()) {
                Some(new_text) => run.children.extend(text_nodes_for(&new_text)),
                None => run.children.push(Node::Element(t)),
            },
            other => run.children.push(other),
        }
    }
}

/// Put `text` in the first run that has text and drop every other `w:t` of
/// the paragraph. The first run keeps its formatting.
pub fn set_paragraph_text(paragraph: &mut Element, text: &str) {
    let mut placed = false;
    for run in runs_mut(paragraph) {
        let has_text = run.child_elements().any(|e| e.is("w:t"));
        if !has_text {
            continue;
        }
        let children = std::mem::take(&mut run.children);
        for child in children {
            match child {
                Node::Element(t) if t.is("w:t") => {
                    if !placed {
                        run.children.extend(text_nodes_for(text));
                        placed = true;
                    }
                }
                other => run.children.push(other),
            }
        }
    }
    if !placed {
        let mut run = Element::new("w:r");
        run.children.extend(text_nodes_for(text));
        paragraph.children.push(Node::Element(run));
    }
}
