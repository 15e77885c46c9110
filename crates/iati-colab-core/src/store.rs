use std::fmt::{Debug, Display, Formatter};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use crate::{ColabError, IDENTIFIER_ELEMENT};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(usize);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NodeKind {
    Element { name: String, attributes: Vec<(String, String)> },
    Text(String),
    Comment(String),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// An ordered collection of activity records under one root element.
///
/// Nodes live in an arena and are addressed by [`NodeId`]. Removing a node
/// detaches it (and with it, its descendants) from the tree; the arena slot
/// stays allocated but is no longer reachable from the root.
#[derive(Debug)]
pub struct RecordStore {
    nodes: Vec<Node>,
    root: NodeId,
}

impl RecordStore {
    #[must_use]
    pub fn new(root_name: &str) -> Self {
        Self::with_root(NodeKind::Element { name: root_name.to_string(), attributes: Vec::new() })
    }

    /// An empty store whose root element copies `other`'s root name and attributes.
    #[must_use]
    pub fn empty_like(other: &RecordStore) -> Self {
        Self::with_root(other.nodes[other.root.0].kind.clone())
    }

    fn with_root(kind: NodeKind) -> Self {
        Self { nodes: vec![Node { kind, parent: None, children: Vec::new() }], root: NodeId(0) }
    }

    /// Parse one XML document. Whitespace-only text is dropped; comments inside
    /// the root element are kept as nodes.
    ///
    /// # Errors
    /// Returns [`ColabError::MalformedDocument`] when the bytes are not a single
    /// well-formed UTF-8 XML element tree.
    pub fn parse(bytes: &[u8], locator: &str) -> Result<Self, ColabError> {
        let malformed = |detail: String| ColabError::MalformedDocument {
            locator: locator.to_string(),
            detail,
        };

        let mut reader = Reader::from_reader(bytes);
        let mut store: Option<RecordStore> = None;
        let mut stack: Vec<NodeId> = Vec::new();

        loop {
            let event = reader.read_event().map_err(|err| {
                malformed(format!("at byte {}: {err}", reader.buffer_position()))
            })?;

            match event {
                Event::Start(start) => {
                    let kind = element_kind(&start).map_err(malformed)?;
                    let id = open_element(&mut store, &stack, kind).map_err(malformed)?;
                    stack.push(id);
                }
                Event::Empty(start) => {
                    let kind = element_kind(&start).map_err(malformed)?;
                    open_element(&mut store, &stack, kind).map_err(malformed)?;
                }
                Event::End(_) => {
                    if stack.pop().is_none() {
                        return Err(malformed("closing tag without an open element".to_string()));
                    }
                }
                Event::Text(text) => {
                    let value = text
                        .unescape()
                        .map_err(|err| malformed(format!("invalid text content: {err}")))?;
                    if value.trim().is_empty() {
                        continue;
                    }
                    match (store.as_mut(), stack.last()) {
                        (Some(store), Some(parent)) => {
                            store.append_text(*parent, &value);
                        }
                        _ => return Err(malformed("text outside the root element".to_string())),
                    }
                }
                Event::CData(data) => {
                    let value = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|err| malformed(format!("CDATA is not UTF-8: {err}")))?;
                    if let (Some(store), Some(parent)) = (store.as_mut(), stack.last()) {
                        store.append_text(*parent, &value);
                    }
                }
                Event::Comment(comment) => {
                    let value = std::str::from_utf8(&comment)
                        .map_err(|err| malformed(format!("comment is not UTF-8: {err}")))?;
                    // Comments outside the root element belong to no record.
                    if let (Some(store), Some(parent)) = (store.as_mut(), stack.last()) {
                        store.append_comment(*parent, value);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let (Some(store), Some(open)) = (store.as_ref(), stack.last()) {
            let name = store.node(*open).name().unwrap_or_default().to_string();
            return Err(malformed(format!("unclosed element `{name}` at end of input")));
        }

        store.ok_or_else(|| malformed("document has no root element".to_string()))
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> NodeRef<'_> {
        NodeRef { store: self, id }
    }

    #[must_use]
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0].kind
    }

    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Top-level records: the element children of the root, in document order.
    pub fn records(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.element_children(self.root)
    }

    pub fn element_children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id.0]
            .children
            .iter()
            .copied()
            .filter(move |child| matches!(self.nodes[child.0].kind, NodeKind::Element { .. }))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records().next().is_none()
    }

    /// All nodes below `id` in pre-order, excluding `id` itself.
    #[must_use]
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut pending: Vec<NodeId> = self.nodes[id.0].children.iter().rev().copied().collect();
        while let Some(next) = pending.pop() {
            out.push(next);
            pending.extend(self.nodes[next.0].children.iter().rev().copied());
        }
        out
    }

    /// Concatenated text of a node: the text itself for text and comment nodes,
    /// all descendant text for elements.
    #[must_use]
    pub fn string_value(&self, id: NodeId) -> String {
        match &self.nodes[id.0].kind {
            NodeKind::Text(text) | NodeKind::Comment(text) => text.clone(),
            NodeKind::Element { .. } => self
                .descendants(id)
                .into_iter()
                .filter_map(|node| match &self.nodes[node.0].kind {
                    NodeKind::Text(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn append_element(
        &mut self,
        parent: NodeId,
        name: &str,
        attributes: &[(&str, &str)],
    ) -> NodeId {
        let attributes = attributes
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        self.attach(parent, NodeKind::Element { name: name.to_string(), attributes })
    }

    pub fn append_text(&mut self, parent: NodeId, text: &str) -> NodeId {
        self.attach(parent, NodeKind::Text(text.to_string()))
    }

    pub fn append_comment(&mut self, parent: NodeId, text: &str) -> NodeId {
        self.attach(parent, NodeKind::Comment(text.to_string()))
    }

    fn attach(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { kind, parent: Some(parent), children: Vec::new() });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Deep-copy `node` from `source` (with its whole subtree) under `parent`.
    pub fn graft(&mut self, parent: NodeId, source: &RecordStore, node: NodeId) -> NodeId {
        let copy = self.attach(parent, source.nodes[node.0].kind.clone());
        for child in &source.nodes[node.0].children {
            self.graft(copy, source, *child);
        }
        copy
    }

    /// Append every top-level record of `source` after this store's records.
    /// Returns the number of records appended.
    pub fn extend_records(&mut self, source: &RecordStore) -> usize {
        let mut appended = 0;
        for record in source.records() {
            self.graft(self.root, source, record);
            appended += 1;
        }
        appended
    }

    /// Detach a node from its parent. Returns `false` for the root or a node
    /// that is already detached.
    pub fn remove(&mut self, id: NodeId) -> bool {
        if id == self.root {
            return false;
        }
        let Some(parent) = self.nodes[id.0].parent.take() else {
            return false;
        };
        self.nodes[parent.0].children.retain(|child| *child != id);
        true
    }

    /// Remove every comment node reachable from the root. Returns the number removed.
    pub fn strip_comments(&mut self) -> usize {
        let comments: Vec<NodeId> = self
            .descendants(self.root)
            .into_iter()
            .filter(|id| matches!(self.nodes[id.0].kind, NodeKind::Comment(_)))
            .collect();
        comments.into_iter().filter(|id| self.remove(*id)).count()
    }

    /// Build a new store holding only the records for which `keep` returns true.
    /// `keep` receives each record's position and a view of it.
    pub fn retain_records<F>(&self, mut keep: F) -> RecordStore
    where
        F: FnMut(usize, NodeRef<'_>) -> bool,
    {
        let mut kept = Self::empty_like(self);
        for (position, record) in self.records().enumerate() {
            if keep(position, self.node(record)) {
                kept.graft(kept.root, self, record);
            }
        }
        kept
    }

    /// Serialize the tree reachable from the root as indented UTF-8 XML.
    ///
    /// # Errors
    /// Returns [`ColabError::Io`] when the XML writer fails.
    pub fn to_xml(&self) -> Result<Vec<u8>, ColabError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(|err| ColabError::Io(format!("failed to write XML declaration: {err}")))?;
        self.write_node(&mut writer, self.root)?;
        let mut bytes = writer.into_inner();
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn write_node(&self, writer: &mut Writer<Vec<u8>>, id: NodeId) -> Result<(), ColabError> {
        let write_failed = |err: String| ColabError::Io(format!("failed to write XML: {err}"));
        let node = &self.nodes[id.0];
        match &node.kind {
            NodeKind::Element { name, attributes } => {
                let mut start = BytesStart::new(name.as_str());
                for (key, value) in attributes {
                    start.push_attribute((key.as_str(), value.as_str()));
                }
                if node.children.is_empty() {
                    return writer
                        .write_event(Event::Empty(start))
                        .map_err(|err| write_failed(err.to_string()));
                }
                writer.write_event(Event::Start(start)).map_err(|err| write_failed(err.to_string()))?;
                for child in &node.children {
                    self.write_node(writer, *child)?;
                }
                writer
                    .write_event(Event::End(BytesEnd::new(name.as_str())))
                    .map_err(|err| write_failed(err.to_string()))
            }
            NodeKind::Text(text) => writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(|err| write_failed(err.to_string())),
            NodeKind::Comment(text) => writer
                .write_event(Event::Comment(BytesText::from_escaped(text.as_str())))
                .map_err(|err| write_failed(err.to_string())),
        }
    }
}

fn element_kind(start: &BytesStart<'_>) -> Result<NodeKind, String> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|err| format!("element name is not UTF-8: {err}"))?
        .to_string();
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|err| format!("invalid attribute on `{name}`: {err}"))?;
        let key = std::str::from_utf8(attribute.key.as_ref())
            .map_err(|err| format!("attribute name on `{name}` is not UTF-8: {err}"))?
            .to_string();
        let value = attribute
            .unescape_value()
            .map_err(|err| format!("invalid value for `{name}/@{key}`: {err}"))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(NodeKind::Element { name, attributes })
}

fn open_element(
    store: &mut Option<RecordStore>,
    stack: &[NodeId],
    kind: NodeKind,
) -> Result<NodeId, String> {
    if let Some(existing) = store.as_mut() {
        return match stack.last() {
            Some(parent) => Ok(existing.attach(*parent, kind)),
            None => Err("document has more than one root element".to_string()),
        };
    }
    let root = RecordStore::with_root(kind);
    let id = root.root;
    *store = Some(root);
    Ok(id)
}

/// A borrowed view of one node in a [`RecordStore`].
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    store: &'a RecordStore,
    id: NodeId,
}

impl Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef").field("id", &self.id).field("name", &self.name()).finish()
    }
}

impl<'a> NodeRef<'a> {
    #[must_use]
    pub fn id(self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn store(self) -> &'a RecordStore {
        self.store
    }

    /// Element name, or `None` for text and comment nodes.
    #[must_use]
    pub fn name(self) -> Option<&'a str> {
        match &self.store.nodes[self.id.0].kind {
            NodeKind::Element { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn attribute(self, key: &str) -> Option<&'a str> {
        match &self.store.nodes[self.id.0].kind {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    pub fn child_elements(self) -> impl Iterator<Item = NodeRef<'a>> {
        let store = self.store;
        store.element_children(self.id).map(move |id| NodeRef { store, id })
    }

    pub fn children_named(self, name: &'a str) -> impl Iterator<Item = NodeRef<'a>> {
        self.child_elements().filter(move |child| child.name() == Some(name))
    }

    #[must_use]
    pub fn string_value(self) -> String {
        self.store.string_value(self.id)
    }

    /// Text of the first `iati-identifier` child; empty when the element has no text.
    #[must_use]
    pub fn identifier(self) -> Option<String> {
        self.children_named(IDENTIFIER_ELEMENT).next().map(NodeRef::string_value)
    }
}
