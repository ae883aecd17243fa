//! The virtual node model: the immutable description of a subtree that the
//! diff engine materializes against the host tree.
//!
//! Attribute maps preserve insertion order so attribute reconciliation walks
//! them deterministically. Each text/element node carries a `Cell` back
//! reference to the host node it produced; the cell is written exactly once
//! when the node is first materialized and reused by every later patch that
//! matches it, until a type/tag mismatch replaces the node outright.
use crate::events::EventHandler;
use crate::host::HostId;
use indexmap::IndexMap;
use std::cell::Cell;
use std::rc::Rc;

/// Attribute value: plain text, boolean presence, or an event handler.
/// Handlers never reach the host tree; they are looked up on the committed
/// tree when an event is dispatched.
#[derive(Clone)]
pub enum AttrValue {
    Str(String),
    Bool(bool),
    Handler(EventHandler),
}

impl AttrValue {
    /// Text and boolean values compare by value; handlers compare by
    /// structural identity (same allocation).
    pub fn same(&self, other: &AttrValue) -> bool {
        match (self, other) {
            (AttrValue::Str(a), AttrValue::Str(b)) => a == b,
            (AttrValue::Bool(a), AttrValue::Bool(b)) => a == b,
            (AttrValue::Handler(a), AttrValue::Handler(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn is_handler(&self) -> bool {
        matches!(self, AttrValue::Handler(_))
    }
}

impl std::fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Str(s) => write!(f, "Str({:?})", s),
            AttrValue::Bool(b) => write!(f, "Bool({})", b),
            AttrValue::Handler(_) => write!(f, "Handler(<fn>)"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

#[derive(Debug)]
pub struct TextNode {
    pub value: String,
    host: Cell<Option<HostId>>,
}

#[derive(Debug)]
pub struct ElementNode {
    pub tag: String,
    pub attrs: IndexMap<String, AttrValue>,
    pub children: Vec<VNode>,
    pub key: Option<String>,
    host: Cell<Option<HostId>>,
}

#[derive(Debug)]
pub struct FragmentNode {
    pub children: Vec<VNode>,
}

/// A subtree description prior to materialization.
#[derive(Debug)]
pub enum VNode {
    Text(TextNode),
    Element(ElementNode),
    Fragment(FragmentNode),
}

impl VNode {
    pub fn text(value: impl Into<String>) -> VNode {
        VNode::Text(TextNode {
            value: value.into(),
            host: Cell::new(None),
        })
    }

    pub fn element(tag: impl Into<String>) -> VNode {
        VNode::Element(ElementNode {
            tag: tag.into(),
            attrs: IndexMap::new(),
            children: Vec::new(),
            key: None,
            host: Cell::new(None),
        })
    }

    pub fn fragment(children: Vec<VNode>) -> VNode {
        VNode::Fragment(FragmentNode { children })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> VNode {
        if let VNode::Element(el) = &mut self {
            el.key = Some(key.into());
        }
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> VNode {
        if let VNode::Element(el) = &mut self {
            el.attrs.insert(name.into(), value.into());
        }
        self
    }

    pub fn with_handler(mut self, event_type: &str, handler: EventHandler) -> VNode {
        if let VNode::Element(el) = &mut self {
            el.attrs
                .insert(format!("on{}", event_type), AttrValue::Handler(handler));
        }
        self
    }

    pub fn with_child(mut self, child: VNode) -> VNode {
        if let VNode::Element(el) = &mut self {
            el.children.push(child);
        }
        self
    }

    pub fn with_children(mut self, mut children: Vec<VNode>) -> VNode {
        if let VNode::Element(el) = &mut self {
            el.children.append(&mut children);
        }
        self
    }

    /// Keys are compared as strings; only elements can carry one.
    pub fn key(&self) -> Option<&str> {
        match self {
            VNode::Element(el) => el.key.as_deref(),
            _ => None,
        }
    }

    /// Host node this description materialized into, if any. Fragments have
    /// no host of their own; their children carry the references.
    pub fn host(&self) -> Option<HostId> {
        match self {
            VNode::Text(t) => t.host.get(),
            VNode::Element(el) => el.host.get(),
            VNode::Fragment(_) => None,
        }
    }

    pub(crate) fn set_host(&self, id: HostId) {
        match self {
            VNode::Text(t) => t.host.set(Some(id)),
            VNode::Element(el) => el.host.set(Some(id)),
            VNode::Fragment(_) => {}
        }
    }

    /// First concrete host node of this subtree, used as a move/insert anchor.
    pub(crate) fn first_host(&self) -> Option<HostId> {
        match self {
            VNode::Fragment(frag) => frag.children.iter().find_map(|c| c.first_host()),
            _ => self.host(),
        }
    }

    /// All concrete host nodes at this level of the subtree (fragments expand
    /// to their children's hosts).
    pub(crate) fn collect_hosts(&self, out: &mut Vec<HostId>) {
        match self {
            VNode::Fragment(frag) => {
                for child in &frag.children {
                    child.collect_hosts(out);
                }
            }
            _ => {
                if let Some(id) = self.host() {
                    out.push(id);
                }
            }
        }
    }

    /// Flatten a child list, expanding fragments into their parent's child
    /// sequence. Reconciliation always operates on flattened lists.
    pub(crate) fn flatten<'a>(nodes: &'a [VNode], out: &mut Vec<&'a VNode>) {
        for node in nodes {
            match node {
                VNode::Fragment(frag) => VNode::flatten(&frag.children, out),
                other => out.push(other),
            }
        }
    }

    /// Locate the vnode that materialized into `id`, if it is part of this
    /// committed tree. Used by event dispatch to find handler attributes.
    pub(crate) fn find_by_host(&self, id: HostId) -> Option<&VNode> {
        match self {
            VNode::Fragment(frag) => frag.children.iter().find_map(|c| c.find_by_host(id)),
            VNode::Text(_) => {
                if self.host() == Some(id) {
                    Some(self)
                } else {
                    None
                }
            }
            VNode::Element(el) => {
                if self.host() == Some(id) {
                    Some(self)
                } else {
                    el.children.iter().find_map(|c| c.find_by_host(id))
                }
            }
        }
    }

    /// The root of a committed tree viewed as a child list: a fragment root
    /// contributes its children, anything else contributes itself.
    pub(crate) fn as_list(&self) -> &[VNode] {
        match self {
            VNode::Fragment(frag) => &frag.children,
            other => std::slice::from_ref(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_expands_nested_fragments() {
        let nodes = vec![
            VNode::text("a"),
            VNode::fragment(vec![
                VNode::text("b"),
                VNode::fragment(vec![VNode::text("c")]),
            ]),
            VNode::element("div"),
        ];
        let mut flat = Vec::new();
        VNode::flatten(&nodes, &mut flat);
        assert_eq!(flat.len(), 4);
        assert!(matches!(flat[3], VNode::Element(_)));
    }

    #[test]
    fn handler_attrs_compare_by_identity() {
        let h: EventHandler = Rc::new(|_| {});
        let a = AttrValue::Handler(h.clone());
        let b = AttrValue::Handler(h);
        let c = AttrValue::Handler(Rc::new(|_| {}));
        assert!(a.same(&b));
        assert!(!a.same(&c));
    }

    #[test]
    fn key_only_on_elements() {
        let el = VNode::element("li").with_key("a");
        assert_eq!(el.key(), Some("a"));
        assert_eq!(VNode::text("x").key(), None);
    }
}
