//! Arena-based tree for markup flows.
//!
//! Each spine flow is held as an arena-allocated element/text tree. Nodes
//! are addressed by copyable [`NodeId`] handles; parent/child/sibling links
//! are indices into a contiguous vector. Arena slots are never reused
//! within a conversion, so a `NodeId` is a stable identity for
//! cross-reference rewriting even after the node is detached.

use std::borrow::Cow;
use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;

use crate::error::{Error, Result};

/// Unique identifier for a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sentinel value for no node.
    pub const NONE: NodeId = NodeId(u32::MAX);

    pub fn is_some(&self) -> bool {
        self.0 != u32::MAX
    }

    pub fn is_none(&self) -> bool {
        self.0 == u32::MAX
    }
}

/// A markup attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// Node type in the flow tree.
#[derive(Debug, Clone)]
pub enum NodeData {
    /// Element with tag name and attributes.
    Element {
        name: String,
        attrs: Vec<Attribute>,
        /// Set when the producer flagged this element as a page-break
        /// marker (page-break-before/after equivalent).
        page_break: bool,
    },
    /// Text content.
    Text(String),
}

/// A node in the flow tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub data: NodeData,
    pub parent: NodeId,
    pub first_child: NodeId,
    pub last_child: NodeId,
    pub prev_sibling: NodeId,
    pub next_sibling: NodeId,
}

impl Node {
    fn new(data: NodeData) -> Self {
        Self {
            data,
            parent: NodeId::NONE,
            first_child: NodeId::NONE,
            last_child: NodeId::NONE,
            prev_sibling: NodeId::NONE,
            next_sibling: NodeId::NONE,
        }
    }
}

/// One markup flow as a mutable tree.
///
/// Invariant: exactly one root element. Detached subtrees stay allocated in
/// the arena but are unreachable from the root and are not serialized.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Document {
    /// Create a document with an empty root element.
    pub fn new(root_name: &str) -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            root: NodeId::NONE,
        };
        doc.root = doc.create_element(root_name);
        doc
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        if id.is_none() {
            return None;
        }
        self.nodes.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if id.is_none() {
            return None;
        }
        self.nodes.get_mut(id.0 as usize)
    }

    pub fn create_element(&mut self, name: &str) -> NodeId {
        self.alloc(Node::new(NodeData::Element {
            name: name.to_string(),
            attrs: Vec::new(),
            page_break: false,
        }))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(Node::new(NodeData::Text(text.to_string())))
    }

    /// Append a child to a parent node.
    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        let last_child = self
            .get(parent)
            .map(|n| n.last_child)
            .unwrap_or(NodeId::NONE);

        if let Some(child_node) = self.get_mut(child) {
            child_node.parent = parent;
            child_node.prev_sibling = last_child;
            child_node.next_sibling = NodeId::NONE;
        }

        if last_child.is_some() {
            if let Some(last_node) = self.get_mut(last_child) {
                last_node.next_sibling = child;
            }
        }

        if let Some(parent_node) = self.get_mut(parent) {
            if parent_node.first_child.is_none() {
                parent_node.first_child = child;
            }
            parent_node.last_child = child;
        }
    }

    /// Insert a node before a sibling.
    pub fn insert_before(&mut self, sibling: NodeId, new_node: NodeId) {
        let parent = self.get(sibling).map(|n| n.parent).unwrap_or(NodeId::NONE);
        let prev = self
            .get(sibling)
            .map(|n| n.prev_sibling)
            .unwrap_or(NodeId::NONE);

        if let Some(new) = self.get_mut(new_node) {
            new.parent = parent;
            new.prev_sibling = prev;
            new.next_sibling = sibling;
        }

        if let Some(sib) = self.get_mut(sibling) {
            sib.prev_sibling = new_node;
        }

        if prev.is_some() {
            if let Some(p) = self.get_mut(prev) {
                p.next_sibling = new_node;
            }
        } else if let Some(par) = self.get_mut(parent) {
            par.first_child = new_node;
        }
    }

    /// Detach a node (and its subtree) from its parent. The node stays
    /// allocated; its `NodeId` remains valid but unreachable.
    pub fn detach(&mut self, id: NodeId) {
        let (parent, prev, next) = match self.get(id) {
            Some(n) => (n.parent, n.prev_sibling, n.next_sibling),
            None => return,
        };

        if prev.is_some() {
            if let Some(p) = self.get_mut(prev) {
                p.next_sibling = next;
            }
        } else if let Some(par) = self.get_mut(parent) {
            par.first_child = next;
        }

        if next.is_some() {
            if let Some(n) = self.get_mut(next) {
                n.prev_sibling = prev;
            }
        } else if let Some(par) = self.get_mut(parent) {
            par.last_child = prev;
        }

        if let Some(node) = self.get_mut(id) {
            node.parent = NodeId::NONE;
            node.prev_sibling = NodeId::NONE;
            node.next_sibling = NodeId::NONE;
        }
    }

    pub fn parent(&self, id: NodeId) -> NodeId {
        self.get(id).map(|n| n.parent).unwrap_or(NodeId::NONE)
    }

    pub fn next_sibling(&self, id: NodeId) -> NodeId {
        self.get(id).map(|n| n.next_sibling).unwrap_or(NodeId::NONE)
    }

    pub fn prev_sibling(&self, id: NodeId) -> NodeId {
        self.get(id).map(|n| n.prev_sibling).unwrap_or(NodeId::NONE)
    }

    /// Iterate over children of a node.
    pub fn children(&self, parent: NodeId) -> ChildrenIter<'_> {
        let first = self
            .get(parent)
            .map(|n| n.first_child)
            .unwrap_or(NodeId::NONE);
        ChildrenIter {
            doc: self,
            current: first,
        }
    }

    /// Iterate over the subtree rooted at `id` in document order,
    /// including `id` itself.
    pub fn descendants(&self, id: NodeId) -> DescendantsIter<'_> {
        DescendantsIter {
            doc: self,
            stack: vec![id],
        }
    }

    /// Ancestors of a node, nearest first, ending at the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.parent(id);
        while cur.is_some() {
            out.push(cur);
            cur = self.parent(cur);
        }
        out
    }

    /// Element tag name, or `None` for text nodes.
    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.get(id).and_then(|n| match &n.data {
            NodeData::Element { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Retag an element in place, keeping attributes and children.
    pub fn set_name(&mut self, id: NodeId, new_name: &str) {
        if let Some(NodeData::Element { name, .. }) = self.get_mut(id).map(|n| &mut n.data) {
            *name = new_name.to_string();
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.get(id)
            .is_some_and(|n| matches!(n.data, NodeData::Element { .. }))
    }

    pub fn is_text(&self, id: NodeId) -> bool {
        self.get(id)
            .is_some_and(|n| matches!(n.data, NodeData::Text(_)))
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.get(id).and_then(|n| match &n.data {
            NodeData::Text(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn set_text(&mut self, id: NodeId, text: &str) {
        if let Some(NodeData::Text(s)) = self.get_mut(id).map(|n| &mut n.data) {
            *s = text.to_string();
        }
    }

    pub fn attr(&self, id: NodeId, attr_name: &str) -> Option<&str> {
        self.get(id).and_then(|n| match &n.data {
            NodeData::Element { attrs, .. } => attrs
                .iter()
                .find(|a| a.name == attr_name)
                .map(|a| a.value.as_str()),
            _ => None,
        })
    }

    pub fn set_attr(&mut self, id: NodeId, attr_name: &str, value: &str) {
        if let Some(NodeData::Element { attrs, .. }) = self.get_mut(id).map(|n| &mut n.data) {
            if let Some(attr) = attrs.iter_mut().find(|a| a.name == attr_name) {
                attr.value = value.to_string();
            } else {
                attrs.push(Attribute {
                    name: attr_name.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, attr_name: &str) {
        if let Some(NodeData::Element { attrs, .. }) = self.get_mut(id).map(|n| &mut n.data) {
            attrs.retain(|a| a.name != attr_name);
        }
    }

    pub fn set_page_break(&mut self, id: NodeId, value: bool) {
        if let Some(NodeData::Element { page_break, .. }) = self.get_mut(id).map(|n| &mut n.data) {
            *page_break = value;
        }
    }

    pub fn has_page_break(&self, id: NodeId) -> bool {
        self.get(id).is_some_and(|n| match &n.data {
            NodeData::Element { page_break, .. } => *page_break,
            _ => false,
        })
    }

    /// First element with the given tag name, in document order.
    pub fn find_by_tag(&self, tag: &str) -> Option<NodeId> {
        self.descendants(self.root)
            .find(|&id| self.name(id) == Some(tag))
    }

    /// The `body` element, if present.
    pub fn body(&self) -> Option<NodeId> {
        self.find_by_tag("body")
    }

    /// Element carrying `id="..."`, in document order.
    pub fn find_by_id(&self, value: &str) -> Option<NodeId> {
        self.descendants(self.root)
            .find(|&id| self.attr(id, "id") == Some(value))
    }

    /// All `id` attribute values reachable from the root.
    pub fn collect_ids(&self) -> Vec<(String, NodeId)> {
        self.descendants(self.root)
            .filter_map(|id| self.attr(id, "id").map(|v| (v.to_string(), id)))
            .collect()
    }

    /// Deep-copy the subtree rooted at `src` into `dest` under
    /// `dest_parent`, returning the id of the copied root.
    pub fn clone_subtree_into(
        &self,
        src: NodeId,
        dest: &mut Document,
        dest_parent: NodeId,
    ) -> NodeId {
        let data = match self.get(src) {
            Some(n) => n.data.clone(),
            None => return NodeId::NONE,
        };
        let copy = dest.alloc(Node::new(data));
        if dest_parent.is_some() {
            dest.append(dest_parent, copy);
        }
        let children: Vec<NodeId> = self.children(src).collect();
        for child in children {
            self.clone_subtree_into(child, dest, copy);
        }
        copy
    }

    /// Rough serialized byte size of a single node (excluding children):
    /// tag overhead for elements, escaped length for text.
    pub fn node_size(&self, id: NodeId) -> usize {
        match self.get(id).map(|n| &n.data) {
            Some(NodeData::Element { name, attrs, .. }) => {
                let attr_len: usize = attrs.iter().map(|a| a.name.len() + a.value.len() + 4).sum();
                name.len() * 2 + attr_len + 5
            }
            Some(NodeData::Text(s)) => s.len(),
            None => 0,
        }
    }

    /// Rough serialized byte size of the subtree rooted at `id`.
    pub fn subtree_size(&self, id: NodeId) -> usize {
        self.descendants(id).map(|n| self.node_size(n)).sum()
    }

    /// Rough serialized byte size of the whole document.
    pub fn size_estimate(&self) -> usize {
        self.subtree_size(self.root)
    }

    /// Concatenated text content of a subtree.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        for n in self.descendants(id) {
            if let Some(t) = self.text(n) {
                out.push_str(t);
            }
        }
        out
    }

    /// Parse a well-formed XML/XHTML document into a flow tree.
    ///
    /// Comments, processing instructions, and the doctype are dropped;
    /// entity references are resolved to text.
    pub fn parse(xml: &str) -> Result<Document> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().check_end_names = false;

        let mut doc = Document {
            nodes: Vec::new(),
            root: NodeId::NONE,
        };
        let mut stack: Vec<NodeId> = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let id = start_element(&mut doc, &e)?;
                    if doc.root.is_none() {
                        doc.root = id;
                    } else if let Some(&parent) = stack.last() {
                        doc.append(parent, id);
                    }
                    stack.push(id);
                }
                Event::Empty(e) => {
                    let id = start_element(&mut doc, &e)?;
                    if doc.root.is_none() {
                        doc.root = id;
                    } else if let Some(&parent) = stack.last() {
                        doc.append(parent, id);
                    }
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(e) => {
                    if let Some(&parent) = stack.last() {
                        let text = String::from_utf8_lossy(e.as_ref()).into_owned();
                        append_text(&mut doc, parent, &text);
                    }
                }
                Event::GeneralRef(e) => {
                    if let Some(&parent) = stack.last() {
                        let entity = String::from_utf8_lossy(e.as_ref()).into_owned();
                        if let Some(resolved) = resolve_entity(&entity) {
                            append_text(&mut doc, parent, &resolved);
                        }
                    }
                }
                Event::CData(e) => {
                    if let Some(&parent) = stack.last() {
                        let text = String::from_utf8_lossy(e.as_ref()).into_owned();
                        append_text(&mut doc, parent, &text);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if doc.root.is_none() {
            return Err(Error::FatalInternal("document has no root element".into()));
        }
        Ok(doc)
    }

    /// Serialize to an XHTML string with XML declaration. Empty elements
    /// self-close; text and attribute values are escaped.
    pub fn to_xhtml(&self) -> String {
        let mut out = String::with_capacity(self.size_estimate() + 64);
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        self.serialize_node(self.root, &mut out);
        out.push('\n');
        out
    }

    fn serialize_node(&self, id: NodeId, out: &mut String) {
        match self.get(id).map(|n| &n.data) {
            Some(NodeData::Text(s)) => out.push_str(&escape_text(s)),
            Some(NodeData::Element { name, attrs, .. }) => {
                out.push('<');
                out.push_str(name);
                for attr in attrs {
                    out.push(' ');
                    out.push_str(&attr.name);
                    out.push_str("=\"");
                    out.push_str(&escape(attr.value.as_str()));
                    out.push('"');
                }
                let first_child = self.get(id).map(|n| n.first_child).unwrap_or(NodeId::NONE);
                if first_child.is_none() {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    let children: Vec<NodeId> = self.children(id).collect();
                    for child in children {
                        self.serialize_node(child, out);
                    }
                    out.push_str("</");
                    out.push_str(name);
                    out.push('>');
                }
            }
            None => {}
        }
    }
}

/// Escape text content, keeping non-ASCII characters literal but turning
/// U+00A0 into a numeric reference so the output survives whitespace
/// normalization in downstream tooling.
fn escape_text(s: &str) -> String {
    let escaped: Cow<'_, str> = escape(s);
    escaped.replace('\u{a0}', "&#160;")
}

fn start_element(doc: &mut Document, e: &quick_xml::events::BytesStart<'_>) -> Result<NodeId> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let id = doc.create_element(&name);
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::Configuration(format!("bad attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(attr.value.as_ref()).into_owned();
        doc.set_attr(id, &key, &unescape_entities(&raw));
    }
    if let Some(style) = doc.attr(id, "style")
        && style_forces_page_break(style)
    {
        doc.set_page_break(id, true);
    }
    Ok(id)
}

/// Inline-style equivalent of a page-break marker.
fn style_forces_page_break(style: &str) -> bool {
    style.split(';').any(|decl| {
        let Some((prop, value)) = decl.split_once(':') else {
            return false;
        };
        matches!(prop.trim(), "page-break-before" | "break-before")
            && matches!(value.trim(), "always" | "page")
    })
}

/// Merge consecutive text into the parent's trailing text node.
fn append_text(doc: &mut Document, parent: NodeId, text: &str) {
    let last = doc.get(parent).map(|n| n.last_child).unwrap_or(NodeId::NONE);
    if let Some(NodeData::Text(existing)) = doc.get_mut(last).map(|n| &mut n.data) {
        existing.push_str(text);
        return;
    }
    let t = doc.create_text(text);
    doc.append(parent, t);
}

fn resolve_entity(entity: &str) -> Option<String> {
    match entity {
        "apos" => return Some("'".to_string()),
        "quot" => return Some("\"".to_string()),
        "lt" => return Some("<".to_string()),
        "gt" => return Some(">".to_string()),
        "amp" => return Some("&".to_string()),
        "nbsp" => return Some("\u{a0}".to_string()),
        _ => {}
    }

    if let Some(hex) = entity.strip_prefix("#x") {
        if let Ok(code) = u32::from_str_radix(hex, 16)
            && let Some(c) = char::from_u32(code)
        {
            return Some(c.to_string());
        }
    } else if let Some(dec) = entity.strip_prefix('#')
        && let Ok(code) = dec.parse::<u32>()
        && let Some(c) = char::from_u32(code)
    {
        return Some(c.to_string());
    }

    None
}

/// Resolve predefined and numeric entity references in an attribute value.
fn unescape_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        if let Some(end) = rest.find(';') {
            if let Some(resolved) = resolve_entity(&rest[..end]) {
                out.push_str(&resolved);
                rest = &rest[end + 1..];
                continue;
            }
        }
        out.push('&');
    }
    out.push_str(rest);
    out
}

/// Iterator over children of a node.
pub struct ChildrenIter<'a> {
    doc: &'a Document,
    current: NodeId,
}

impl Iterator for ChildrenIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_none() {
            return None;
        }
        let id = self.current;
        self.current = self.doc.next_sibling(id);
        Some(id)
    }
}

/// Depth-first, document-order iterator over a subtree.
pub struct DescendantsIter<'a> {
    doc: &'a Document,
    stack: Vec<NodeId>,
}

impl Iterator for DescendantsIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let mut children: Vec<NodeId> = self.doc.children(id).collect();
        children.reverse();
        self.stack.extend(children);
        Some(id)
    }
}

/// Build a minimal XHTML flow document, returning it and its `body` node.
pub fn xhtml_skeleton(title: &str) -> (Document, NodeId) {
    let mut doc = Document::new("html");
    let root = doc.root();
    doc.set_attr(root, "xmlns", "http://www.w3.org/1999/xhtml");
    let head = doc.create_element("head");
    doc.append(root, head);
    let title_el = doc.create_element("title");
    doc.append(head, title_el);
    let title_text = doc.create_text(title);
    doc.append(title_el, title_text);
    let body = doc.create_element("body");
    doc.append(root, body);
    (doc, body)
}

/// Map from id value to node, for duplicate detection and lookups.
pub fn id_index(doc: &Document) -> HashMap<String, NodeId> {
    let mut map = HashMap::new();
    for (value, id) in doc.collect_ids() {
        map.entry(value).or_insert(id);
    }
    map
}
