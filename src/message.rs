//! Message module: the navigable XML document a filter is evaluated against.
//!
//! Messages are parsed once with quick-xml into an arena of nodes. Node ids are assigned in
//! document order (an element, then its attributes, then its children), so sorting ids sorts
//! nodes into document order and every subtree occupies a contiguous id range. Traversals walk
//! those ranges instead of recursing, so nesting depth is bounded only by memory.

use crate::expr::{Axis, NodeTest};
use crate::{Result, WirequeryError};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt;
use std::sync::Arc;

pub const SOAP11_NAMESPACE: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP12_NAMESPACE: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSA10_NAMESPACE: &str = "http://www.w3.org/2005/08/addressing";
pub const WSA_AUGUST2004_NAMESPACE: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Element,
    Attribute,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub prefix: Option<String>,
    pub local: String,
    /// Empty when the name is in no namespace.
    pub namespace: String,
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}:{}", prefix, self.local),
            None => write!(f, "{}", self.local),
        }
    }
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    name: Option<QualifiedName>,
    value: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attributes: Vec<NodeId>,
    /// One past the last id of the subtree rooted here.
    end: u32,
}

impl NodeData {
    fn new(kind: NodeKind, parent: Option<NodeId>) -> Self {
        Self {
            kind,
            name: None,
            value: String::new(),
            parent,
            children: Vec::new(),
            attributes: Vec::new(),
            end: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<NodeData>,
    /// Text node ids in document order.
    texts: Vec<NodeId>,
}

impl Document {
    pub fn parse(xml: &str) -> Result<Document> {
        DocumentParser::new(xml).parse()
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }

    /// Ids strictly inside the subtree rooted at `id`.
    fn subtree(&self, id: NodeId) -> std::ops::Range<u32> {
        id.0 + 1..self.node(id).end
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn attributes(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).attributes
    }

    pub fn qualified_name(&self, id: NodeId) -> Option<&QualifiedName> {
        self.node(id).name.as_ref()
    }

    pub fn local_name(&self, id: NodeId) -> &str {
        self.node(id).name.as_ref().map(|n| n.local.as_str()).unwrap_or("")
    }

    pub fn namespace_uri(&self, id: NodeId) -> &str {
        self.node(id).name.as_ref().map(|n| n.namespace.as_str()).unwrap_or("")
    }

    /// The prefixed name as written in the source document.
    pub fn name(&self, id: NodeId) -> String {
        self.node(id).name.as_ref().map(|n| n.to_string()).unwrap_or_default()
    }

    /// XPath string-value: attribute and text values, or the concatenated descendant text of
    /// elements and the root.
    pub fn string_value(&self, id: NodeId) -> String {
        let node = self.node(id);
        match node.kind {
            NodeKind::Attribute | NodeKind::Text => node.value.clone(),
            NodeKind::Root | NodeKind::Element => {
                let range = self.subtree(id);
                let first = self.texts.partition_point(|t| t.0 < range.start);
                let last = self.texts.partition_point(|t| t.0 < range.end);
                self.texts[first..last].iter().map(|&t| self.node(t).value.as_str()).collect()
            }
        }
    }

    pub fn element_children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id).children.iter().copied().filter(move |&c| self.kind(c) == NodeKind::Element)
    }

    pub fn find_child(&self, id: NodeId, namespace: &str, local: &str) -> Option<NodeId> {
        self.element_children(id)
            .find(|&c| self.local_name(c) == local && self.namespace_uri(c) == namespace)
    }

    pub fn document_element(&self) -> Option<NodeId> {
        self.element_children(NodeId::ROOT).next()
    }

    /// Tests whether `id` passes a node test on the given axis.
    pub fn matches_test(&self, id: NodeId, axis: Axis, test: &NodeTest) -> bool {
        let kind = self.kind(id);
        let principal = if axis == Axis::Attribute { NodeKind::Attribute } else { NodeKind::Element };
        match test {
            NodeTest::Node => true,
            NodeTest::Text => kind == NodeKind::Text,
            NodeTest::Wildcard => kind == principal,
            NodeTest::NamespaceWildcard { namespace } => {
                kind == principal && self.namespace_uri(id) == namespace
            }
            NodeTest::Name { namespace, local } => {
                kind == principal && self.local_name(id) == local && self.namespace_uri(id) == namespace
            }
        }
    }

    /// Appends the nodes reachable from `id` along `axis` that pass `test`, in axis order
    /// (reverse document order for reverse axes).
    pub fn select(&self, id: NodeId, axis: Axis, test: &NodeTest, out: &mut Vec<NodeId>) {
        let start = out.len();
        match axis {
            Axis::Child => out.extend(self.children(id).iter().copied()),
            Axis::Attribute => out.extend(self.attributes(id).iter().copied()),
            Axis::SelfAxis => out.push(id),
            Axis::Parent => out.extend(self.parent(id)),
            Axis::Descendant => self.push_descendants(id, out),
            Axis::DescendantOrSelf => {
                out.push(id);
                self.push_descendants(id, out);
            }
            Axis::Ancestor | Axis::AncestorOrSelf => {
                if axis == Axis::AncestorOrSelf {
                    out.push(id);
                }
                let mut current = self.parent(id);
                while let Some(p) = current {
                    out.push(p);
                    current = self.parent(p);
                }
            }
            Axis::FollowingSibling | Axis::PrecedingSibling => {
                if self.kind(id) == NodeKind::Attribute {
                    return;
                }
                if let Some(parent) = self.parent(id) {
                    let siblings = self.children(parent);
                    if let Some(pos) = siblings.iter().position(|&s| s == id) {
                        if axis == Axis::FollowingSibling {
                            out.extend(siblings[pos + 1..].iter().copied());
                        } else {
                            out.extend(siblings[..pos].iter().rev().copied());
                        }
                    }
                }
            }
        }
        let mut write = start;
        for read in start..out.len() {
            if self.matches_test(out[read], axis, test) {
                out[write] = out[read];
                write += 1;
            }
        }
        out.truncate(write);
    }

    fn push_descendants(&self, id: NodeId, out: &mut Vec<NodeId>) {
        out.extend(self.subtree(id).map(NodeId).filter(|&n| self.kind(n) != NodeKind::Attribute));
    }

    /// Canonical text of a node: namespace-qualified names, sorted attributes, no namespace
    /// declarations. Two elements that differ only in prefix spelling canonicalize equally.
    pub fn canonical_form(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_canonical(id, &mut out);
        out
    }

    fn write_canonical(&self, id: NodeId, out: &mut String) {
        let mut pending = vec![Visit::Open(id)];
        while let Some(visit) = pending.pop() {
            let id = match visit {
                Visit::Open(id) => id,
                Visit::Close(id) => {
                    out.push_str("</");
                    write_expanded_name(self.qualified_name(id), out);
                    out.push('>');
                    continue;
                }
            };
            let node = self.node(id);
            match node.kind {
                NodeKind::Root => pending.extend(node.children.iter().rev().map(|&c| Visit::Open(c))),
                NodeKind::Text => escape_into(&node.value, out),
                NodeKind::Attribute => self.write_attribute(id, out),
                NodeKind::Element => {
                    out.push('<');
                    write_expanded_name(node.name.as_ref(), out);
                    let mut attributes: Vec<NodeId> = node.attributes.clone();
                    attributes.sort_by(|&a, &b| {
                        (self.namespace_uri(a), self.local_name(a))
                            .cmp(&(self.namespace_uri(b), self.local_name(b)))
                    });
                    for attr in attributes {
                        out.push(' ');
                        self.write_attribute(attr, out);
                    }
                    out.push('>');
                    pending.push(Visit::Close(id));
                    pending.extend(node.children.iter().rev().map(|&c| Visit::Open(c)));
                }
            }
        }
    }

    fn write_attribute(&self, id: NodeId, out: &mut String) {
        let node = self.node(id);
        write_expanded_name(node.name.as_ref(), out);
        out.push_str("=\"");
        escape_into(&node.value, out);
        out.push('"');
    }
}

enum Visit {
    Open(NodeId),
    Close(NodeId),
}

fn write_expanded_name(name: Option<&QualifiedName>, out: &mut String) {
    if let Some(name) = name {
        if !name.namespace.is_empty() {
            out.push('{');
            out.push_str(&name.namespace);
            out.push('}');
        }
        out.push_str(&name.local);
    }
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

struct DocumentParser<'a> {
    input: &'a str,
    nodes: Vec<NodeData>,
    texts: Vec<NodeId>,
    open: Vec<NodeId>,
    /// In-scope namespace declarations, innermost last.
    bindings: Vec<(String, String)>,
    /// Length of `bindings` when each open element started.
    scope_marks: Vec<usize>,
}

impl<'a> DocumentParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            nodes: vec![NodeData::new(NodeKind::Root, None)],
            texts: Vec::new(),
            open: vec![NodeId::ROOT],
            bindings: Vec::new(),
            scope_marks: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<Document> {
        let mut reader = Reader::from_str(self.input);
        loop {
            let position = reader.buffer_position();
            let event = reader
                .read_event()
                .map_err(|e| WirequeryError::Xml(format!("at position {}: {}", position, e)))?;
            match event {
                Event::Start(start) => self.start_element(&start, position)?,
                Event::Empty(start) => {
                    self.start_element(&start, position)?;
                    self.end_element();
                }
                Event::End(_) => self.end_element(),
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| WirequeryError::Xml(format!("at position {}: {}", position, e)))?;
                    self.push_text(&text);
                }
                Event::CData(data) => {
                    let bytes = data.into_inner();
                    self.push_text(&String::from_utf8_lossy(&bytes));
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if self.open.len() != 1 {
            return Err(WirequeryError::Xml("unexpected end of document: unclosed element".into()));
        }
        if self.nodes.len() == 1 {
            return Err(WirequeryError::Xml("document has no root element".into()));
        }
        self.nodes[0].end = self.nodes.len() as u32;
        Ok(Document { nodes: self.nodes, texts: self.texts })
    }

    fn current(&self) -> NodeId {
        *self.open.last().unwrap_or(&NodeId::ROOT)
    }

    fn alloc(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(data);
        id
    }

    fn start_element(&mut self, start: &BytesStart<'_>, position: usize) -> Result<()> {
        let raw_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut declarations = Vec::new();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| WirequeryError::Xml(format!("at position {}: {}", position, e)))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| WirequeryError::Xml(format!("at position {}: {}", position, e)))?
                .into_owned();
            if key == "xmlns" {
                declarations.push((String::new(), value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                declarations.push((prefix.to_string(), value));
            } else {
                attributes.push((key, value));
            }
        }
        self.scope_marks.push(self.bindings.len());
        self.bindings.extend(declarations);

        let parent = self.current();
        let name = self.resolve(&raw_name, true, position)?;
        let mut element = NodeData::new(NodeKind::Element, Some(parent));
        element.name = Some(name);
        let id = self.alloc(element);
        self.nodes[parent.index()].children.push(id);

        for (key, value) in attributes {
            let name = self.resolve(&key, false, position)?;
            let mut attr = NodeData::new(NodeKind::Attribute, Some(id));
            attr.name = Some(name);
            attr.value = value;
            let attr_id = self.alloc(attr);
            self.nodes[attr_id.index()].end = attr_id.0 + 1;
            self.nodes[id.index()].attributes.push(attr_id);
        }
        self.open.push(id);
        Ok(())
    }

    fn end_element(&mut self) {
        if self.open.len() > 1 {
            if let Some(id) = self.open.pop() {
                self.nodes[id.index()].end = self.nodes.len() as u32;
            }
            if let Some(mark) = self.scope_marks.pop() {
                self.bindings.truncate(mark);
            }
        }
    }

    /// Whitespace between the document element and the envelope structure is layout, not
    /// content. Everywhere else whitespace text is kept.
    fn is_layout(&self, parent: NodeId) -> bool {
        let node = &self.nodes[parent.index()];
        match (node.kind, &node.name) {
            (NodeKind::Root, _) => true,
            (NodeKind::Element, Some(name)) => {
                matches!(name.namespace.as_str(), SOAP11_NAMESPACE | SOAP12_NAMESPACE)
                    && matches!(name.local.as_str(), "Envelope" | "Header" | "Body")
            }
            _ => false,
        }
    }

    fn push_text(&mut self, text: &str) {
        let parent = self.current();
        if text.trim().is_empty() && (text.is_empty() || self.is_layout(parent)) {
            return;
        }
        if let Some(&last) = self.nodes[parent.index()].children.last() {
            if self.nodes[last.index()].kind == NodeKind::Text {
                self.nodes[last.index()].value.push_str(text);
                return;
            }
        }
        let mut node = NodeData::new(NodeKind::Text, Some(parent));
        node.value = text.to_string();
        let id = self.alloc(node);
        self.nodes[id.index()].end = id.0 + 1;
        self.nodes[parent.index()].children.push(id);
        self.texts.push(id);
    }

    fn resolve(&self, raw: &str, is_element: bool, position: usize) -> Result<QualifiedName> {
        let (prefix, local) = match raw.split_once(':') {
            Some((p, l)) => (Some(p.to_string()), l.to_string()),
            None => (None, raw.to_string()),
        };
        let namespace = match prefix.as_deref() {
            Some("xml") => XML_NAMESPACE.to_string(),
            Some(p) => self.lookup(p).ok_or_else(|| {
                WirequeryError::Xml(format!("at position {}: unbound namespace prefix '{}'", position, p))
            })?,
            None if is_element => self.lookup("").unwrap_or_default(),
            None => String::new(),
        };
        Ok(QualifiedName { prefix, local, namespace })
    }

    fn lookup(&self, prefix: &str) -> Option<String> {
        self.bindings.iter().rev().find(|(p, _)| p == prefix).map(|(_, uri)| uri.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeVersion {
    Soap11,
    Soap12,
    /// Plain XML with no SOAP envelope.
    None,
}

impl EnvelopeVersion {
    pub fn namespace(self) -> Option<&'static str> {
        match self {
            EnvelopeVersion::Soap11 => Some(SOAP11_NAMESPACE),
            EnvelopeVersion::Soap12 => Some(SOAP12_NAMESPACE),
            EnvelopeVersion::None => None,
        }
    }
}

#[derive(Debug)]
struct MessageInner {
    document: Document,
    version: EnvelopeVersion,
    header: Option<NodeId>,
    body: Option<NodeId>,
    headers: Vec<NodeId>,
    action: Option<String>,
    to: Option<String>,
}

/// A parsed message. Cloning is cheap and clones share the parsed document.
#[derive(Debug, Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    pub fn parse(xml: &str) -> Result<Message> {
        let document = Document::parse(xml)?;
        let mut version = EnvelopeVersion::None;
        let mut header = None;
        let mut body = None;
        if let Some(envelope) = document.document_element() {
            let ns = document.namespace_uri(envelope);
            if document.local_name(envelope) == "Envelope" {
                if ns == SOAP11_NAMESPACE {
                    version = EnvelopeVersion::Soap11;
                } else if ns == SOAP12_NAMESPACE {
                    version = EnvelopeVersion::Soap12;
                }
            }
            if let Some(env_ns) = version.namespace() {
                header = document.find_child(envelope, env_ns, "Header");
                body = document.find_child(envelope, env_ns, "Body");
            }
        }
        let headers: Vec<NodeId> = header.map(|h| document.element_children(h).collect()).unwrap_or_default();
        let addressing_header = |local: &str| {
            headers
                .iter()
                .copied()
                .find(|&h| {
                    document.local_name(h) == local
                        && matches!(document.namespace_uri(h), WSA10_NAMESPACE | WSA_AUGUST2004_NAMESPACE)
                })
                .map(|h| document.string_value(h).trim().to_string())
        };
        let action = addressing_header("Action");
        let to = addressing_header("To");
        Ok(Message {
            inner: Arc::new(MessageInner { document, version, header, body, headers, action, to }),
        })
    }

    pub fn builder(version: EnvelopeVersion) -> MessageBuilder {
        MessageBuilder::new(version)
    }

    pub fn document(&self) -> &Document {
        &self.inner.document
    }

    pub fn version(&self) -> EnvelopeVersion {
        self.inner.version
    }

    pub fn action(&self) -> Option<&str> {
        self.inner.action.as_deref()
    }

    pub fn to(&self) -> Option<&str> {
        self.inner.to.as_deref()
    }

    /// Element children of the envelope header, in document order.
    pub fn headers(&self) -> &[NodeId] {
        &self.inner.headers
    }

    pub fn header_element(&self) -> Option<NodeId> {
        self.inner.header
    }

    pub fn body(&self) -> Option<NodeId> {
        self.inner.body
    }
}

/// Assembles a SOAP envelope with WS-Addressing 1.0 headers.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    version: EnvelopeVersion,
    action: Option<String>,
    to: Option<String>,
    headers: Vec<String>,
    body: Option<String>,
}

impl MessageBuilder {
    pub fn new(version: EnvelopeVersion) -> Self {
        Self { version, action: None, to: None, headers: Vec::new(), body: None }
    }
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }
    /// Adds a raw XML header element.
    pub fn header(mut self, xml: impl Into<String>) -> Self {
        self.headers.push(xml.into());
        self
    }
    /// Sets the raw XML body content.
    pub fn body(mut self, xml: impl Into<String>) -> Self {
        self.body = Some(xml.into());
        self
    }

    pub fn to_xml(&self) -> String {
        let env_ns = self.version.namespace().unwrap_or(SOAP12_NAMESPACE);
        let mut xml = format!("<s:Envelope xmlns:s=\"{}\" xmlns:a=\"{}\"><s:Header>", env_ns, WSA10_NAMESPACE);
        if let Some(action) = &self.action {
            xml.push_str("<a:Action>");
            escape_into(action, &mut xml);
            xml.push_str("</a:Action>");
        }
        if let Some(to) = &self.to {
            xml.push_str("<a:To>");
            escape_into(to, &mut xml);
            xml.push_str("</a:To>");
        }
        for header in &self.headers {
            xml.push_str(header);
        }
        xml.push_str("</s:Header><s:Body>");
        if let Some(body) = &self.body {
            xml.push_str(body);
        }
        xml.push_str("</s:Body></s:Envelope>");
        xml
    }

    pub fn build(self) -> Result<Message> {
        Message::parse(&self.to_xml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing">
        <s:Header><a:Action>urn:ping</a:Action><a:To>http://example.org/svc</a:To></s:Header>
        <s:Body><order id="7" xmlns="urn:shop"><item>apple</item><item>pear</item></order></s:Body>
    </s:Envelope>"#;

    #[test]
    fn test_parse_envelope_headers() {
        let msg = Message::parse(SAMPLE).unwrap();
        assert_eq!(msg.version(), EnvelopeVersion::Soap12);
        assert_eq!(msg.action(), Some("urn:ping"));
        assert_eq!(msg.to(), Some("http://example.org/svc"));
        assert_eq!(msg.headers().len(), 2);
        assert!(msg.body().is_some());
    }

    #[test]
    fn test_default_namespace_and_attributes() {
        let msg = Message::parse(SAMPLE).unwrap();
        let doc = msg.document();
        let order = doc.element_children(msg.body().unwrap()).next().unwrap();
        assert_eq!(doc.local_name(order), "order");
        assert_eq!(doc.namespace_uri(order), "urn:shop");
        let attr = doc.attributes(order)[0];
        assert_eq!(doc.local_name(attr), "id");
        assert_eq!(doc.namespace_uri(attr), "");
        assert_eq!(doc.string_value(attr), "7");
        assert_eq!(doc.string_value(order), "applepear");
    }

    #[test]
    fn test_node_ids_follow_document_order() {
        let doc = Document::parse("<a x='1'><b/><c><d/></c></a>").unwrap();
        let mut out = Vec::new();
        doc.select(NodeId::ROOT, Axis::Descendant, &NodeTest::Node, &mut out);
        let mut sorted = out.clone();
        sorted.sort();
        assert_eq!(out, sorted);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_select_reverse_axis_order() {
        let doc = Document::parse("<a><b/><c/><d/></a>").unwrap();
        let a = doc.document_element().unwrap();
        let d = *doc.children(a).last().unwrap();
        let mut out = Vec::new();
        doc.select(d, Axis::PrecedingSibling, &NodeTest::Wildcard, &mut out);
        let names: Vec<_> = out.iter().map(|&n| doc.local_name(n)).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn test_canonical_form_ignores_prefixes() {
        let a = Document::parse(r#"<p:h xmlns:p="urn:x" q:v="1" xmlns:q="urn:y" w="2">t</p:h>"#).unwrap();
        let b = Document::parse(r#"<h xmlns="urn:x" w="2" xmlns:z="urn:y" z:v="1">t</h>"#).unwrap();
        let ca = a.canonical_form(a.document_element().unwrap());
        let cb = b.canonical_form(b.document_element().unwrap());
        assert_eq!(ca, cb);
        assert_eq!(ca, r#"<{urn:x}h w="2" {urn:y}v="1">t</{urn:x}h>"#);
    }

    #[test]
    fn test_malformed_xml_is_rejected() {
        assert!(matches!(Document::parse("<a><b></a>"), Err(WirequeryError::Xml(_))));
        assert!(matches!(Document::parse("<a>"), Err(WirequeryError::Xml(_))));
        assert!(matches!(Document::parse("<p:a/>"), Err(WirequeryError::Xml(_))));
    }

    #[test]
    fn test_builder_round_trip() {
        let msg = Message::builder(EnvelopeVersion::Soap11)
            .action("urn:a&b")
            .to("http://h/x")
            .header(r#"<k xmlns="urn:k">1</k>"#)
            .body("<ping/>")
            .build()
            .unwrap();
        assert_eq!(msg.version(), EnvelopeVersion::Soap11);
        assert_eq!(msg.action(), Some("urn:a&b"));
        assert_eq!(msg.headers().len(), 3);
    }

    #[test]
    fn test_whitespace_text_is_content() {
        let msg = Message::builder(EnvelopeVersion::Soap12).body("<v> </v><w>a b</w>").build().unwrap();
        let doc = msg.document();
        let v = doc.element_children(msg.body().unwrap()).next().unwrap();
        assert_eq!(doc.string_value(v), " ");
        assert_eq!(doc.children(v).len(), 1);

        // Layout whitespace around the envelope structure is not.
        let msg = Message::parse(SAMPLE).unwrap();
        let doc = msg.document();
        let envelope = doc.document_element().unwrap();
        assert!(doc.children(envelope).iter().all(|&c| doc.kind(c) == NodeKind::Element));
        assert_eq!(doc.string_value(msg.header_element().unwrap()), "urn:pinghttp://example.org/svc");
    }

    #[test]
    fn test_deep_nesting_does_not_recurse() {
        const DEPTH: usize = 100_000;
        let xml = format!("{}x{}", "<n>".repeat(DEPTH), "</n>".repeat(DEPTH));
        let doc = Document::parse(&xml).unwrap();
        let top = doc.document_element().unwrap();
        assert_eq!(doc.string_value(top), "x");

        let mut out = Vec::new();
        doc.select(NodeId::ROOT, Axis::Descendant, &NodeTest::Wildcard, &mut out);
        assert_eq!(out.len(), DEPTH);
        let innermost = *out.last().unwrap();
        assert_eq!(doc.string_value(innermost), "x");

        let canonical = doc.canonical_form(top);
        assert!(canonical.starts_with("<n><n>"));
        assert!(canonical.ends_with("x</n></n>"));
        assert_eq!(canonical.len(), DEPTH * 7 + 1);
    }

    #[test]
    fn test_string_value_spans_subtree_only() {
        let doc = Document::parse("<r>a<s>b<t>c</t></s>d<u>e</u></r>").unwrap();
        let r = doc.document_element().unwrap();
        let s = doc.element_children(r).next().unwrap();
        assert_eq!(doc.string_value(r), "abcde");
        assert_eq!(doc.string_value(s), "bc");
        assert_eq!(doc.string_value(NodeId::ROOT), "abcde");
    }

    #[test]
    fn test_plain_xml_message() {
        let msg = Message::parse("<root><a>1</a></root>").unwrap();
        assert_eq!(msg.version(), EnvelopeVersion::None);
        assert!(msg.action().is_none());
        assert!(msg.headers().is_empty());
    }
}
