//! Diff/patch engine: mutates an existing host subtree in place to match a
//! new vnode description, reusing materialized host nodes wherever they are
//! structurally compatible.
//!
//! Child lists reconcile positionally until a key appears on either side;
//! keyed mode matches by key, computes a longest-increasing-subsequence over
//! the matched old indices, and moves only the nodes outside it. Each move is
//! a single insert-before, walking the new list from the end so every
//! insertion has a stable anchor.
use crate::errors::RuntimeError;
use crate::host::{HostAdapter, HostId, LIVE_PROPS};
use crate::vnode::{AttrValue, ElementNode, VNode};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

/// A live-property write skipped because its control was mid-composition.
/// Replayed at the start of the next patch once composition ends, so the
/// suppressed value is deferred, never dropped.
#[derive(Debug, Clone)]
pub(crate) struct PendingLiveWrite {
    id: HostId,
    name: String,
    value: Value,
}

pub struct DiffEngine<'a> {
    host: &'a dyn HostAdapter,
    deferred: RefCell<Vec<PendingLiveWrite>>,
}

impl<'a> DiffEngine<'a> {
    pub fn new(host: &'a dyn HostAdapter) -> Self {
        DiffEngine {
            host,
            deferred: RefCell::new(Vec::new()),
        }
    }

    /// Seed this engine with writes a previous engine over the same host
    /// deferred mid-composition.
    pub(crate) fn carry_deferred(&self, writes: Vec<PendingLiveWrite>) {
        *self.deferred.borrow_mut() = writes;
    }

    /// Hand back whatever is still deferred, for the owner to carry into the
    /// next patch cycle.
    pub(crate) fn take_deferred(&self) -> Vec<PendingLiveWrite> {
        self.deferred.take()
    }

    /// Mutate `parent`'s children in place so that the subtree described by
    /// `old` matches `new`. Fragments on either side reconcile as child
    /// lists against the same parent.
    pub fn patch(
        &self,
        parent: HostId,
        old: Option<&VNode>,
        new: Option<&VNode>,
    ) -> Result<(), RuntimeError> {
        self.replay_deferred()?;
        self.patch_node(parent, old, new)
    }

    fn patch_node(
        &self,
        parent: HostId,
        old: Option<&VNode>,
        new: Option<&VNode>,
    ) -> Result<(), RuntimeError> {
        match (old, new) {
            (None, None) => Ok(()),
            (None, Some(node)) => self.materialize(parent, node, None),
            (Some(node), None) => self.remove(parent, node),
            (Some(old), Some(new)) => {
                if matches!(old, VNode::Fragment(_)) || matches!(new, VNode::Fragment(_)) {
                    self.reconcile_list(parent, old.as_list(), new.as_list())
                } else {
                    self.patch_pair(parent, old, new)
                }
            }
        }
    }

    /// Reconcile two whole child lists of `parent`.
    pub fn reconcile_children(
        &self,
        parent: HostId,
        old: &[VNode],
        new: &[VNode],
    ) -> Result<(), RuntimeError> {
        self.replay_deferred()?;
        self.reconcile_list(parent, old, new)
    }

    fn reconcile_list(
        &self,
        parent: HostId,
        old: &[VNode],
        new: &[VNode],
    ) -> Result<(), RuntimeError> {
        let mut old_flat = Vec::new();
        VNode::flatten(old, &mut old_flat);
        let mut new_flat = Vec::new();
        VNode::flatten(new, &mut new_flat);

        if old_flat.is_empty() && new_flat.is_empty() {
            return Ok(());
        }

        let any_key = old_flat
            .iter()
            .chain(new_flat.iter())
            .any(|n| n.key().is_some());
        if any_key {
            self.reconcile_keyed(parent, &old_flat, &new_flat)
        } else {
            self.reconcile_positional(parent, &old_flat, &new_flat)
        }
    }

    fn reconcile_positional(
        &self,
        parent: HostId,
        old: &[&VNode],
        new: &[&VNode],
    ) -> Result<(), RuntimeError> {
        let shared = old.len().min(new.len());
        for i in 0..shared {
            self.patch_pair(parent, old[i], new[i])?;
        }
        for node in &new[shared..] {
            self.materialize(parent, node, None)?;
        }
        for node in &old[shared..] {
            self.remove(parent, node)?;
        }
        Ok(())
    }

    fn reconcile_keyed(
        &self,
        parent: HostId,
        old: &[&VNode],
        new: &[&VNode],
    ) -> Result<(), RuntimeError> {
        let mut old_key_to_idx: HashMap<&str, usize> = old
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.key().map(|k| (k, i)))
            .collect();

        // Pass 1: match and patch in place, recording which old position each
        // matched new slot came from.
        let mut matched_old: HashSet<usize> = HashSet::new();
        let mut source: Vec<Option<usize>> = Vec::with_capacity(new.len());
        let mut lis_input: Vec<usize> = Vec::new();

        for (i, candidate) in new.iter().enumerate() {
            if let Some(key) = candidate.key() {
                if let Some(old_idx) = old_key_to_idx.remove(key) {
                    self.patch_pair(parent, old[old_idx], candidate)?;
                    matched_old.insert(old_idx);
                    source.push(Some(old_idx));
                    lis_input.push(old_idx);
                } else {
                    source.push(None);
                }
            } else if i < old.len() && old[i].key().is_none() {
                // Unkeyed members reconcile purely positionally; a keyed
                // sibling shifting their index can misattribute them. This is
                // defined behavior, not an error.
                self.patch_pair(parent, old[i], candidate)?;
                matched_old.insert(i);
                source.push(Some(i));
                lis_input.push(i);
            } else {
                source.push(None);
            }
        }

        // Matched children already in increasing relative order stay
        // untouched; everything else moves.
        let lis_positions = longest_increasing_subsequence(&lis_input);
        let stable: HashSet<usize> = lis_positions.into_iter().map(|p| lis_input[p]).collect();

        let mut moves = 0usize;
        let mut anchor: Option<HostId> = None;
        for i in (0..new.len()).rev() {
            let candidate = new[i];
            match source[i] {
                None => self.materialize(parent, candidate, anchor)?,
                Some(old_idx) => {
                    if !stable.contains(&old_idx) {
                        self.move_before(parent, candidate, anchor)?;
                        moves += 1;
                    }
                }
            }
            anchor = candidate.first_host().or(anchor);
        }
        if moves > 0 {
            log::debug!(
                "diff: keyed reconcile moved {} of {} children",
                moves,
                new.len()
            );
        }

        for (old_idx, node) in old.iter().enumerate() {
            if !matched_old.contains(&old_idx) {
                self.remove(parent, node)?;
            }
        }
        Ok(())
    }

    /// Patch a matched non-fragment pair in place.
    fn patch_pair(&self, parent: HostId, old: &VNode, new: &VNode) -> Result<(), RuntimeError> {
        match (old, new) {
            (VNode::Text(old_text), VNode::Text(new_text)) => {
                let id = old
                    .host()
                    .ok_or_else(|| RuntimeError::host("patching unmaterialized text node"))?;
                if old_text.value != new_text.value {
                    self.host.set_text(id, &new_text.value)?;
                }
                new.set_host(id);
                Ok(())
            }
            (VNode::Element(old_el), VNode::Element(new_el)) if old_el.tag == new_el.tag => {
                let id = old
                    .host()
                    .ok_or_else(|| RuntimeError::host("patching unmaterialized element"))?;
                new.set_host(id);
                self.reconcile_attrs(id, old_el, new_el)?;
                self.reconcile_list(id, &old_el.children, &new_el.children)
            }
            _ => {
                // Type or tag mismatch: splice a fresh subtree in place.
                log::debug!("diff: type/tag mismatch, replacing subtree");
                let anchor = old
                    .first_host()
                    .and_then(|id| self.next_sibling(parent, id));
                self.remove(parent, old)?;
                self.materialize(parent, new, anchor)
            }
        }
    }

    fn reconcile_attrs(
        &self,
        id: HostId,
        old: &ElementNode,
        new: &ElementNode,
    ) -> Result<(), RuntimeError> {
        // Never clobber in-flight keystrokes: live property writes are
        // deferred while the control is focused and mid-composition, and
        // replayed at the start of the next patch.
        let live_suppressed =
            self.host.focused() == Some(id) && self.host.is_composing(id);

        for (name, old_value) in &old.attrs {
            if new.attrs.contains_key(name) || old_value.is_handler() {
                continue;
            }
            if LIVE_PROPS.contains(name.as_str()) {
                let reset = default_live_value(old_value);
                if live_suppressed {
                    self.defer_live_write(id, name, reset);
                } else {
                    self.host.set_live_property(id, name, reset)?;
                }
            } else {
                self.host.remove_attribute(id, name)?;
            }
        }

        for (name, new_value) in &new.attrs {
            if let Some(old_value) = old.attrs.get(name) {
                if old_value.same(new_value) {
                    continue;
                }
            }
            if new_value.is_handler() {
                continue;
            }
            if LIVE_PROPS.contains(name.as_str()) {
                let value = live_value(new_value);
                if live_suppressed {
                    self.defer_live_write(id, name, value);
                } else {
                    self.host.set_live_property(id, name, value)?;
                }
            } else {
                self.apply_plain_attr(id, name, new_value)?;
            }
        }
        Ok(())
    }

    /// Remember a suppressed live write, keeping only the newest value per
    /// property.
    fn defer_live_write(&self, id: HostId, name: &str, value: Value) {
        let mut deferred = self.deferred.borrow_mut();
        if let Some(existing) = deferred
            .iter_mut()
            .find(|w| w.id == id && w.name == name)
        {
            existing.value = value;
        } else {
            deferred.push(PendingLiveWrite {
                id,
                name: name.to_string(),
                value,
            });
        }
    }

    /// Apply deferred live writes whose control is no longer composing; the
    /// rest stay deferred for a later patch.
    fn replay_deferred(&self) -> Result<(), RuntimeError> {
        if self.deferred.borrow().is_empty() {
            return Ok(());
        }
        let writes = self.deferred.take();
        let mut still_composing = Vec::new();
        for write in writes {
            if self.host.focused() == Some(write.id) && self.host.is_composing(write.id) {
                still_composing.push(write);
            } else {
                self.host
                    .set_live_property(write.id, &write.name, write.value)?;
            }
        }
        *self.deferred.borrow_mut() = still_composing;
        Ok(())
    }

    fn apply_plain_attr(
        &self,
        id: HostId,
        name: &str,
        value: &AttrValue,
    ) -> Result<(), RuntimeError> {
        match value {
            AttrValue::Str(s) => self.host.set_attribute(id, name, s),
            AttrValue::Bool(true) => self.host.set_attribute(id, name, ""),
            AttrValue::Bool(false) => self.host.remove_attribute(id, name),
            AttrValue::Handler(_) => Ok(()),
        }
    }

    /// Create host nodes for a fresh subtree and splice them in before
    /// `anchor`. Children attach before the subtree root is inserted.
    fn materialize(
        &self,
        parent: HostId,
        node: &VNode,
        anchor: Option<HostId>,
    ) -> Result<(), RuntimeError> {
        match node {
            VNode::Text(text) => {
                let id = self.host.create_text(&text.value);
                node.set_host(id);
                self.host.insert_before(parent, id, anchor)
            }
            VNode::Element(el) => {
                let id = self.host.create_element(&el.tag);
                node.set_host(id);
                for (name, value) in &el.attrs {
                    if value.is_handler() {
                        continue;
                    }
                    if LIVE_PROPS.contains(name.as_str()) {
                        self.host.set_live_property(id, name, live_value(value))?;
                    } else if !matches!(value, AttrValue::Bool(false)) {
                        self.apply_plain_attr(id, name, value)?;
                    }
                }
                for child in &el.children {
                    self.materialize(id, child, None)?;
                }
                self.host.insert_before(parent, id, anchor)
            }
            VNode::Fragment(frag) => {
                for child in &frag.children {
                    self.materialize(parent, child, anchor)?;
                }
                Ok(())
            }
        }
    }

    fn remove(&self, parent: HostId, node: &VNode) -> Result<(), RuntimeError> {
        let mut hosts = Vec::new();
        node.collect_hosts(&mut hosts);
        for id in hosts {
            self.host.remove_child(parent, id)?;
        }
        Ok(())
    }

    fn move_before(
        &self,
        parent: HostId,
        node: &VNode,
        anchor: Option<HostId>,
    ) -> Result<(), RuntimeError> {
        let mut hosts = Vec::new();
        node.collect_hosts(&mut hosts);
        for id in hosts {
            self.host.insert_before(parent, id, anchor)?;
        }
        Ok(())
    }

    fn next_sibling(&self, parent: HostId, node: HostId) -> Option<HostId> {
        let children = self.host.children(parent);
        let position = children.iter().position(|c| *c == node)?;
        children.get(position + 1).copied()
    }
}

fn live_value(value: &AttrValue) -> Value {
    match value {
        AttrValue::Str(s) => Value::String(s.clone()),
        AttrValue::Bool(b) => Value::Bool(*b),
        AttrValue::Handler(_) => Value::Null,
    }
}

/// Removing a live property resets it to the type's neutral value.
fn default_live_value(old: &AttrValue) -> Value {
    match old {
        AttrValue::Bool(_) => Value::Bool(false),
        _ => Value::String(String::new()),
    }
}

/// O(n log n) longest increasing subsequence; returns positions into `seq`.
/// Handles the empty sequence and is stable for equal-length answers.
fn longest_increasing_subsequence(seq: &[usize]) -> Vec<usize> {
    if seq.is_empty() {
        return Vec::new();
    }

    let mut predecessors = vec![0; seq.len()];
    let mut indices = vec![0; seq.len()];
    let mut length = 0;

    for (i, &value) in seq.iter().enumerate() {
        let mut low = 0;
        let mut high = length;
        while low < high {
            let mid = low + (high - low) / 2;
            if seq[indices[mid]] < value {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        if low > 0 {
            predecessors[i] = indices[low - 1];
        }
        indices[low] = i;
        if low == length {
            length += 1;
        }
    }

    let mut lis = Vec::with_capacity(length);
    let mut k = indices[length - 1];
    for _ in 0..length {
        lis.push(k);
        k = predecessors[k];
    }
    lis.reverse();
    lis
}
