//! Declarative event delegation. Components register selector-scoped rules;
//! dispatch walks the host path from the event target up to the component
//! root, firing matching rules and any handler attribute on the committed
//! tree along the way.
use crate::host::{HostAdapter, HostId};
use crate::vnode::{AttrValue, VNode};
use serde_json::Value;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub target: HostId,
    pub detail: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, target: HostId) -> Self {
        Event {
            event_type: event_type.into(),
            target,
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

pub type EventHandler = Rc<dyn Fn(&Event)>;

#[derive(Clone)]
pub(crate) struct EventRule {
    pub event_type: String,
    pub selector: Option<String>,
    pub handler: EventHandler,
}

impl EventRule {
    /// A rule without a selector fires only at the component root, like a
    /// listener attached directly to the delegation root.
    fn applies_to(&self, host: &dyn HostAdapter, node: HostId, root: HostId) -> bool {
        match &self.selector {
            Some(selector) => host.matches(node, selector),
            None => node == root,
        }
    }
}

/// Fire every rule and handler attribute matching `event` along the path
/// from its target to `root` (inclusive). Returns the number of handlers
/// invoked, which dispatch callers use for debugging.
pub(crate) fn dispatch(
    host: &dyn HostAdapter,
    root: HostId,
    rules: &[EventRule],
    committed: Option<&VNode>,
    event: &Event,
) -> usize {
    if !host.contains(root, event.target) {
        return 0;
    }

    let mut fired = 0;
    let mut current = Some(event.target);
    while let Some(node) = current {
        for rule in rules {
            if rule.event_type == event.event_type && rule.applies_to(host, node, root) {
                (rule.handler)(event);
                fired += 1;
            }
        }
        if let Some(tree) = committed {
            if let Some(VNode::Element(el)) = tree.find_by_host(node) {
                let attr_name = format!("on{}", event.event_type);
                if let Some(AttrValue::Handler(handler)) = el.attrs.get(&attr_name) {
                    handler(event);
                    fired += 1;
                }
            }
        }
        if node == root {
            break;
        }
        current = host.parent(node);
    }
    fired
}
