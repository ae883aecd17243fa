//! Host tree adapter boundary plus an arena-backed in-memory host.
//!
//! The runtime never touches a rendering surface directly; everything goes
//! through [`HostAdapter`]. `MemoryHost` is the reference implementation used
//! by the test suite: it records every mutating operation in a serializable
//! journal so tests can assert that a no-op render produced zero mutations
//! and that a keyed reorder moved the minimum number of nodes.
use crate::errors::RuntimeError;
use phf::phf_set;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};

/// Form-control properties written through direct property assignment rather
/// than attributes, and suppressed while the control is mid-composition.
pub static LIVE_PROPS: phf::Set<&'static str> = phf_set! {
    "value",
    "checked",
    "disabled",
};

static VOID_TAGS: phf::Set<&'static str> = phf_set! {
    "img", "hr", "br", "input", "meta", "link",
};

/// Opaque identity of a host node. Stable for the lifetime of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId(pub usize);

/// Boundary abstraction over the actual rendering surface.
///
/// All methods take `&self`; implementations use interior mutability. The
/// runtime assumes a single logical thread.
pub trait HostAdapter {
    fn create_element(&self, tag: &str) -> HostId;
    fn create_text(&self, value: &str) -> HostId;
    fn set_text(&self, id: HostId, value: &str) -> Result<(), RuntimeError>;
    fn set_attribute(&self, id: HostId, name: &str, value: &str) -> Result<(), RuntimeError>;
    fn remove_attribute(&self, id: HostId, name: &str) -> Result<(), RuntimeError>;
    fn set_live_property(&self, id: HostId, name: &str, value: Value)
        -> Result<(), RuntimeError>;
    /// Insert `node` into `parent` before `anchor` (append when `None`). An
    /// already-attached node is moved; a move is a single operation.
    fn insert_before(
        &self,
        parent: HostId,
        node: HostId,
        anchor: Option<HostId>,
    ) -> Result<(), RuntimeError>;
    fn remove_child(&self, parent: HostId, node: HostId) -> Result<(), RuntimeError>;
    fn parent(&self, id: HostId) -> Option<HostId>;
    fn children(&self, id: HostId) -> Vec<HostId>;
    /// Simple selector match: `tag`, `#id`, `.class`, or `*`.
    fn matches(&self, id: HostId, selector: &str) -> bool;
    /// Scoped query; `root: None` searches every attached tree.
    fn select(&self, root: Option<HostId>, selector: &str) -> Vec<HostId>;
    fn focused(&self) -> Option<HostId>;
    fn set_focus(&self, id: HostId) -> Result<(), RuntimeError>;
    fn selection(&self, id: HostId) -> Option<(usize, usize)>;
    fn set_selection(&self, id: HostId, start: usize, end: usize) -> Result<(), RuntimeError>;
    fn is_composing(&self, id: HostId) -> bool;
    /// Apply a parsed-markup fragment, used when a component's render function
    /// returns raw markup rather than a vnode tree.
    fn apply_markup(&self, parent: HostId, markup: &str) -> Result<(), RuntimeError>;

    /// Whether `id` sits in the subtree rooted at `root` (inclusive).
    fn contains(&self, root: HostId, id: HostId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == root {
                return true;
            }
            current = self.parent(node);
        }
        false
    }
}

/// One recorded host mutation. Creations are journaled too so tests can
/// assert a render allocated nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    CreateElement { id: HostId, tag: String },
    CreateText { id: HostId },
    SetText { id: HostId, value: String },
    SetAttribute { id: HostId, name: String, value: String },
    RemoveAttribute { id: HostId, name: String },
    SetLiveProperty { id: HostId, name: String },
    InsertBefore { parent: HostId, node: HostId, anchor: Option<HostId> },
    RemoveChild { parent: HostId, node: HostId },
    ApplyMarkup { parent: HostId },
}

#[derive(Debug)]
enum MemNodeKind {
    Element { tag: String },
    Text { value: String },
    Markup { raw: String },
}

#[derive(Debug)]
struct MemNode {
    kind: MemNodeKind,
    attrs: indexmap::IndexMap<String, String>,
    live: serde_json::Map<String, Value>,
    children: Vec<HostId>,
    parent: Option<HostId>,
    selection: Option<(usize, usize)>,
    composing: bool,
}

impl MemNode {
    fn new(kind: MemNodeKind) -> Self {
        MemNode {
            kind,
            attrs: indexmap::IndexMap::new(),
            live: serde_json::Map::new(),
            children: Vec::new(),
            parent: None,
            selection: None,
            composing: false,
        }
    }
}

/// In-memory host tree with a mutation journal.
#[derive(Default)]
pub struct MemoryHost {
    nodes: RefCell<Vec<MemNode>>,
    focused: Cell<Option<HostId>>,
    journal: RefCell<Vec<Mutation>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        MemoryHost::default()
    }

    fn alloc(&self, node: MemNode) -> HostId {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(node);
        HostId(nodes.len() - 1)
    }

    fn check(&self, id: HostId) -> Result<(), RuntimeError> {
        if id.0 < self.nodes.borrow().len() {
            Ok(())
        } else {
            Err(RuntimeError::host(format!("unknown host node {:?}", id)))
        }
    }

    fn record(&self, mutation: Mutation) {
        self.journal.borrow_mut().push(mutation);
    }

    /// Snapshot of every mutation recorded so far.
    pub fn journal(&self) -> Vec<Mutation> {
        self.journal.borrow().clone()
    }

    pub fn journal_len(&self) -> usize {
        self.journal.borrow().len()
    }

    pub fn clear_journal(&self) {
        self.journal.borrow_mut().clear();
    }

    /// Test hook: mark a control as mid-IME-composition.
    pub fn set_composing(&self, id: HostId, composing: bool) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(id.0) {
            node.composing = composing;
        }
    }

    pub fn tag(&self, id: HostId) -> Option<String> {
        match &self.nodes.borrow().get(id.0)?.kind {
            MemNodeKind::Element { tag } => Some(tag.clone()),
            _ => None,
        }
    }

    pub fn attr(&self, id: HostId, name: &str) -> Option<String> {
        self.nodes.borrow().get(id.0)?.attrs.get(name).cloned()
    }

    pub fn live_prop(&self, id: HostId, name: &str) -> Option<Value> {
        self.nodes.borrow().get(id.0)?.live.get(name).cloned()
    }

    /// Concatenated text of the subtree, markup stored verbatim.
    pub fn text_content(&self, id: HostId) -> String {
        let nodes = self.nodes.borrow();
        let mut out = String::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = nodes.get(current.0) else {
                continue;
            };
            match &node.kind {
                MemNodeKind::Text { value } => out.push_str(value),
                MemNodeKind::Markup { raw } => out.push_str(raw),
                MemNodeKind::Element { .. } => {
                    for child in node.children.iter().rev() {
                        stack.push(*child);
                    }
                }
            }
        }
        out
    }

    /// Debug serialization of a subtree to an HTML-like string.
    pub fn markup_of(&self, id: HostId) -> String {
        let nodes = self.nodes.borrow();
        fn render(nodes: &[MemNode], id: HostId, out: &mut String) {
            let Some(node) = nodes.get(id.0) else {
                return;
            };
            match &node.kind {
                MemNodeKind::Text { value } => out.push_str(&html_escape(value)),
                MemNodeKind::Markup { raw } => out.push_str(raw),
                MemNodeKind::Element { tag } => {
                    out.push('<');
                    out.push_str(tag);
                    for (name, value) in &node.attrs {
                        out.push_str(&format!(r#" {}="{}""#, name, html_escape(value)));
                    }
                    out.push('>');
                    if !VOID_TAGS.contains(tag.as_str()) {
                        for child in &node.children {
                            render(nodes, *child, out);
                        }
                        out.push_str(&format!("</{}>", tag));
                    }
                }
            }
        }
        let mut out = String::new();
        render(&nodes, id, &mut out);
        out
    }

    fn detach(&self, node: HostId) {
        let mut nodes = self.nodes.borrow_mut();
        if let Some(parent) = nodes.get(node.0).and_then(|n| n.parent) {
            if let Some(parent_node) = nodes.get_mut(parent.0) {
                parent_node.children.retain(|c| *c != node);
            }
            if let Some(n) = nodes.get_mut(node.0) {
                n.parent = None;
            }
        }
    }

    fn matches_inner(&self, id: HostId, selector: &str) -> bool {
        let nodes = self.nodes.borrow();
        let Some(node) = nodes.get(id.0) else {
            return false;
        };
        if selector == "*" {
            return matches!(node.kind, MemNodeKind::Element { .. });
        }
        if let Some(wanted) = selector.strip_prefix('#') {
            return node.attrs.get("id").is_some_and(|v| v == wanted);
        }
        if let Some(wanted) = selector.strip_prefix('.') {
            return node
                .attrs
                .get("class")
                .is_some_and(|v| v.split_whitespace().any(|c| c == wanted));
        }
        matches!(&node.kind, MemNodeKind::Element { tag } if tag == selector)
    }
}

impl HostAdapter for MemoryHost {
    fn create_element(&self, tag: &str) -> HostId {
        let id = self.alloc(MemNode::new(MemNodeKind::Element {
            tag: tag.to_string(),
        }));
        self.record(Mutation::CreateElement {
            id,
            tag: tag.to_string(),
        });
        id
    }

    fn create_text(&self, value: &str) -> HostId {
        let id = self.alloc(MemNode::new(MemNodeKind::Text {
            value: value.to_string(),
        }));
        self.record(Mutation::CreateText { id });
        id
    }

    fn set_text(&self, id: HostId, value: &str) -> Result<(), RuntimeError> {
        self.check(id)?;
        let mut nodes = self.nodes.borrow_mut();
        match &mut nodes[id.0].kind {
            MemNodeKind::Text { value: current } => {
                *current = value.to_string();
            }
            _ => return Err(RuntimeError::host(format!("{:?} is not a text node", id))),
        }
        drop(nodes);
        self.record(Mutation::SetText {
            id,
            value: value.to_string(),
        });
        Ok(())
    }

    fn set_attribute(&self, id: HostId, name: &str, value: &str) -> Result<(), RuntimeError> {
        self.check(id)?;
        self.nodes.borrow_mut()[id.0]
            .attrs
            .insert(name.to_string(), value.to_string());
        self.record(Mutation::SetAttribute {
            id,
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn remove_attribute(&self, id: HostId, name: &str) -> Result<(), RuntimeError> {
        self.check(id)?;
        let removed = self.nodes.borrow_mut()[id.0].attrs.shift_remove(name);
        if removed.is_some() {
            self.record(Mutation::RemoveAttribute {
                id,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn set_live_property(
        &self,
        id: HostId,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        self.check(id)?;
        self.nodes.borrow_mut()[id.0]
            .live
            .insert(name.to_string(), value);
        self.record(Mutation::SetLiveProperty {
            id,
            name: name.to_string(),
        });
        Ok(())
    }

    fn insert_before(
        &self,
        parent: HostId,
        node: HostId,
        anchor: Option<HostId>,
    ) -> Result<(), RuntimeError> {
        self.check(parent)?;
        self.check(node)?;
        self.detach(node);
        let mut nodes = self.nodes.borrow_mut();
        let position = match anchor {
            Some(a) => nodes[parent.0]
                .children
                .iter()
                .position(|c| *c == a)
                .ok_or_else(|| {
                    RuntimeError::host(format!("anchor {:?} is not a child of {:?}", a, parent))
                })?,
            None => nodes[parent.0].children.len(),
        };
        nodes[parent.0].children.insert(position, node);
        nodes[node.0].parent = Some(parent);
        drop(nodes);
        self.record(Mutation::InsertBefore {
            parent,
            node,
            anchor,
        });
        Ok(())
    }

    fn remove_child(&self, parent: HostId, node: HostId) -> Result<(), RuntimeError> {
        self.check(parent)?;
        self.check(node)?;
        if self.parent(node) != Some(parent) {
            return Err(RuntimeError::host(format!(
                "{:?} is not a child of {:?}",
                node, parent
            )));
        }
        // Removal blurs a focused descendant, like the real surface would.
        if let Some(focused) = self.focused.get() {
            if self.contains(node, focused) {
                self.focused.set(None);
            }
        }
        self.detach(node);
        self.record(Mutation::RemoveChild { parent, node });
        Ok(())
    }

    fn parent(&self, id: HostId) -> Option<HostId> {
        self.nodes.borrow().get(id.0)?.parent
    }

    fn children(&self, id: HostId) -> Vec<HostId> {
        self.nodes
            .borrow()
            .get(id.0)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn matches(&self, id: HostId, selector: &str) -> bool {
        self.matches_inner(id, selector)
    }

    fn select(&self, root: Option<HostId>, selector: &str) -> Vec<HostId> {
        let count = self.nodes.borrow().len();
        (0..count)
            .map(HostId)
            .filter(|id| match root {
                Some(r) => self.contains(r, *id),
                None => true,
            })
            .filter(|id| self.matches_inner(*id, selector))
            .collect()
    }

    fn focused(&self) -> Option<HostId> {
        self.focused.get()
    }

    fn set_focus(&self, id: HostId) -> Result<(), RuntimeError> {
        self.check(id)?;
        self.focused.set(Some(id));
        Ok(())
    }

    fn selection(&self, id: HostId) -> Option<(usize, usize)> {
        self.nodes.borrow().get(id.0)?.selection
    }

    fn set_selection(&self, id: HostId, start: usize, end: usize) -> Result<(), RuntimeError> {
        self.check(id)?;
        self.nodes.borrow_mut()[id.0].selection = Some((start, end));
        Ok(())
    }

    fn is_composing(&self, id: HostId) -> bool {
        self.nodes
            .borrow()
            .get(id.0)
            .map(|n| n.composing)
            .unwrap_or(false)
    }

    fn apply_markup(&self, parent: HostId, markup: &str) -> Result<(), RuntimeError> {
        self.check(parent)?;
        let id = self.alloc(MemNode::new(MemNodeKind::Markup {
            raw: markup.to_string(),
        }));
        let mut nodes = self.nodes.borrow_mut();
        nodes[parent.0].children.push(id);
        nodes[id.0].parent = Some(parent);
        drop(nodes);
        self.record(Mutation::ApplyMarkup { parent });
        Ok(())
    }
}

/// Consistent attribute/text escaping for the debug serializer.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
