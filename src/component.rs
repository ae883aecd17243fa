//! Component lifecycle wrapper: construction, first mount, focus-preserving
//! re-render, error capture with fallback rendering, and teardown.
//!
//! Instances move `Constructed → Mounted → Unmounted`; the last state is
//! terminal and remounting requires a fresh instance. The scheduler only ever
//! holds weak references, so a torn-down instance drained from the dirty set
//! is skipped rather than re-rendered into a detached host.
use crate::diff::{DiffEngine, PendingLiveWrite};
use crate::errors::RuntimeError;
use crate::events::{self, Event, EventHandler, EventRule};
use crate::hooks::{self, CommittedEffect, Ctx, HookCell, StagedEffect};
use crate::host::{HostAdapter, HostId};
use crate::scheduler::{Renderable, Scheduler, SchedulerHandle};
use crate::vnode::VNode;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Arbitrary keyed record backing component state and props.
pub type Record = serde_json::Map<String, Value>;

static INSTANCE_IDS: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(1));

fn next_instance_id() -> u64 {
    INSTANCE_IDS.fetch_add(1, Ordering::SeqCst)
}

/// What a render function may produce: a vnode tree, or raw markup handed to
/// the host's fragment parser.
pub enum RenderOutput {
    Node(VNode),
    Markup(String),
}

impl From<VNode> for RenderOutput {
    fn from(node: VNode) -> Self {
        RenderOutput::Node(node)
    }
}

pub type RenderFn = Rc<dyn Fn(&mut Ctx<'_>) -> Result<RenderOutput, RuntimeError>>;
pub type FallbackFn = Rc<dyn Fn(&RuntimeError) -> VNode>;

/// Last committed output, compared against on the next render.
enum Committed {
    Empty,
    Tree(VNode),
    Markup(String),
}

pub(crate) struct ComponentInner {
    id: u64,
    render_fn: RenderFn,
    fallback: RefCell<Option<FallbackFn>>,
    state: RefCell<Record>,
    props: RefCell<Record>,
    // Partial merges arriving mid-render, applied once the render completes.
    pending_state: RefCell<Vec<Record>>,
    pending_props: RefCell<Vec<Record>>,
    host: RefCell<Option<Rc<dyn HostAdapter>>>,
    host_root: Cell<Option<HostId>>,
    last_output: RefCell<Committed>,
    // Live writes the diff deferred mid-composition, carried between commits.
    pending_live: RefCell<Vec<PendingLiveWrite>>,
    mounted: Cell<bool>,
    rendering: Cell<bool>,
    unmounted: Cell<bool>,
    hooks: RefCell<Vec<HookCell>>,
    staged_effects: RefCell<Vec<StagedEffect>>,
    effects: RefCell<Vec<CommittedEffect>>,
    rules: RefCell<Vec<EventRule>>,
    scheduler: SchedulerHandle,
    weak_self: Weak<ComponentInner>,
}

/// A mountable component instance. Exclusively owned by whoever created it;
/// dropping it makes any pending dirty-set entries inert.
pub struct Component {
    inner: Rc<ComponentInner>,
}

impl Component {
    pub fn new(
        scheduler: &Scheduler,
        render: impl Fn(&mut Ctx<'_>) -> Result<RenderOutput, RuntimeError> + 'static,
    ) -> Component {
        let inner = Rc::new_cyclic(|weak| ComponentInner {
            id: next_instance_id(),
            render_fn: Rc::new(render),
            fallback: RefCell::new(None),
            state: RefCell::new(Record::new()),
            props: RefCell::new(Record::new()),
            pending_state: RefCell::new(Vec::new()),
            pending_props: RefCell::new(Vec::new()),
            host: RefCell::new(None),
            host_root: Cell::new(None),
            last_output: RefCell::new(Committed::Empty),
            pending_live: RefCell::new(Vec::new()),
            mounted: Cell::new(false),
            rendering: Cell::new(false),
            unmounted: Cell::new(false),
            hooks: RefCell::new(Vec::new()),
            staged_effects: RefCell::new(Vec::new()),
            effects: RefCell::new(Vec::new()),
            rules: RefCell::new(Vec::new()),
            scheduler: scheduler.handle(),
            weak_self: weak.clone(),
        });
        Component { inner }
    }

    /// Seed initial state before mounting.
    pub fn with_state(self, state: Record) -> Self {
        *self.inner.state.borrow_mut() = state;
        self
    }

    pub fn with_props(self, props: Record) -> Self {
        *self.inner.props.borrow_mut() = props;
        self
    }

    /// Replacement content rendered when the render function fails.
    pub fn with_fallback(self, fallback: impl Fn(&RuntimeError) -> VNode + 'static) -> Self {
        *self.inner.fallback.borrow_mut() = Some(Rc::new(fallback));
        self
    }

    /// Bind to the host element matching `target`, perform the first render
    /// (a pure insertion), and mark the instance mounted. Target resolution
    /// failure is the one error surfaced synchronously; the instance stays
    /// un-mounted and no retry is attempted.
    pub fn mount(&self, host: Rc<dyn HostAdapter>, target: &str) -> Result<(), RuntimeError> {
        self.bind(host, target)?;
        log::debug!("instance {}: mounted at '{}'", self.inner.id, target);
        self.inner.render_instance();
        Ok(())
    }

    /// Bind event rules to pre-existing markup without an initial patch. The
    /// first re-render replaces that markup wholesale instead of diffing
    /// against a tree the runtime never produced.
    pub fn hydrate(&self, host: Rc<dyn HostAdapter>, target: &str) -> Result<(), RuntimeError> {
        self.bind(host, target)?;
        *self.inner.last_output.borrow_mut() = Committed::Markup(String::new());
        log::debug!("instance {}: hydrated at '{}'", self.inner.id, target);
        Ok(())
    }

    fn bind(&self, host: Rc<dyn HostAdapter>, target: &str) -> Result<(), RuntimeError> {
        let inner = &self.inner;
        if inner.unmounted.get() {
            return Err(RuntimeError::host(
                "instance was unmounted; create a fresh instance to remount",
            ));
        }
        if inner.mounted.get() {
            return Err(RuntimeError::host("instance is already mounted"));
        }
        let root = host
            .select(None, target)
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::TargetNotFound {
                selector: target.to_string(),
            })?;
        *inner.host.borrow_mut() = Some(host);
        inner.host_root.set(Some(root));
        inner.mounted.set(true);
        Ok(())
    }

    /// Merge a partial record into state. Mid-render calls are queued and
    /// applied when the in-flight render completes; calls after unmount are
    /// no-ops.
    pub fn set_state(&self, partial: Record) {
        self.inner.apply_merge(partial, MergeTarget::State);
    }

    /// Updater form: the closure sees the current state and returns the
    /// partial to merge.
    pub fn set_state_with(&self, f: impl FnOnce(&Record) -> Record) {
        let partial = f(&self.inner.state.borrow());
        self.inner.apply_merge(partial, MergeTarget::State);
    }

    pub fn set_props(&self, partial: Record) {
        self.inner.apply_merge(partial, MergeTarget::Props);
    }

    pub fn set_props_with(&self, f: impl FnOnce(&Record) -> Record) {
        let partial = f(&self.inner.props.borrow());
        self.inner.apply_merge(partial, MergeTarget::Props);
    }

    /// Register a delegated event rule. `selector: None` scopes the rule to
    /// the component root.
    pub fn on(
        &self,
        event_type: impl Into<String>,
        selector: Option<&str>,
        handler: impl Fn(&Event) + 'static,
    ) {
        self.inner.rules.borrow_mut().push(EventRule {
            event_type: event_type.into(),
            selector: selector.map(String::from),
            handler: Rc::new(handler) as EventHandler,
        });
    }

    pub fn off(&self, event_type: &str, selector: Option<&str>) {
        self.inner
            .rules
            .borrow_mut()
            .retain(|r| !(r.event_type == event_type && r.selector.as_deref() == selector));
    }

    /// Route an event from the host surface through the delegation rules and
    /// any handler attributes on the committed tree. Returns the number of
    /// handlers that fired.
    pub fn dispatch(&self, event: &Event) -> usize {
        let inner = &self.inner;
        if !inner.mounted.get() || inner.unmounted.get() {
            return 0;
        }
        let Some(host) = inner.host.borrow().clone() else {
            return 0;
        };
        let Some(root) = inner.host_root.get() else {
            return 0;
        };
        // Rules are cloned out so handlers may call on()/off() reentrantly.
        let rules: Vec<EventRule> = inner.rules.borrow().clone();
        let committed = inner.last_output.borrow();
        let tree = match &*committed {
            Committed::Tree(tree) => Some(tree),
            _ => None,
        };
        events::dispatch(host.as_ref(), root, &rules, tree, event)
    }

    /// Scoped query within the mounted subtree.
    pub fn find(&self, selector: &str) -> Option<HostId> {
        self.find_all(selector).into_iter().next()
    }

    pub fn find_all(&self, selector: &str) -> Vec<HostId> {
        let inner = &self.inner;
        let (Some(host), Some(root)) = (inner.host.borrow().clone(), inner.host_root.get())
        else {
            return Vec::new();
        };
        host.select(Some(root), selector)
    }

    /// Run effect cleanups, detach event bindings, clear the hook array,
    /// detach the host subtree, and transition to the terminal state.
    pub fn unmount(&self) {
        let inner = &self.inner;
        if inner.unmounted.get() {
            return;
        }
        let scheduler = inner.scheduler.clone();
        let mut effects = std::mem::take(&mut *inner.effects.borrow_mut());
        hooks::run_cleanups(&mut effects, &|e| scheduler.report_error(e));
        inner.staged_effects.borrow_mut().clear();
        inner.rules.borrow_mut().clear();
        inner.hooks.borrow_mut().clear();
        inner.pending_state.borrow_mut().clear();
        inner.pending_props.borrow_mut().clear();
        if let (Some(host), Some(root)) = (inner.host.borrow().clone(), inner.host_root.get()) {
            if let Err(e) = clear_children(host.as_ref(), root) {
                scheduler.report_error(&e);
            }
        }
        *inner.last_output.borrow_mut() = Committed::Empty;
        inner.pending_live.borrow_mut().clear();
        *inner.host.borrow_mut() = None;
        inner.host_root.set(None);
        inner.mounted.set(false);
        inner.unmounted.set(true);
        log::debug!("instance {}: unmounted", inner.id);
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.get() && !self.inner.unmounted.get()
    }

    pub fn root(&self) -> Option<HostId> {
        self.inner.host_root.get()
    }

    pub fn state(&self) -> Record {
        self.inner.state.borrow().clone()
    }

    pub fn props(&self) -> Record {
        self.inner.props.borrow().clone()
    }
}

enum MergeTarget {
    State,
    Props,
}

impl ComponentInner {
    fn mark_dirty(&self) {
        if let Some(rc) = self.weak_self.upgrade() {
            let renderable: Rc<dyn Renderable> = rc;
            self.scheduler.mark_dirty(&renderable);
        }
    }

    fn apply_merge(&self, partial: Record, target: MergeTarget) {
        if self.unmounted.get() {
            return;
        }
        let (record, pending) = match target {
            MergeTarget::State => (&self.state, &self.pending_state),
            MergeTarget::Props => (&self.props, &self.pending_props),
        };
        if self.rendering.get() {
            pending.borrow_mut().push(partial);
            return;
        }
        merge(&mut record.borrow_mut(), partial);
        self.mark_dirty();
    }

    /// One full render cycle: focus capture, hooks-reset render, diff/patch
    /// against the committed tree, focus restore, effect-flush scheduling.
    fn render_instance(&self) {
        if !self.mounted.get() || self.unmounted.get() || self.rendering.get() {
            return;
        }
        let Some(host) = self.host.borrow().clone() else {
            return;
        };
        let Some(root) = self.host_root.get() else {
            return;
        };

        // Focus is restored by node identity, never re-derived from content.
        let focused = host.focused().filter(|f| host.contains(root, *f));
        let selection = focused.and_then(|f| host.selection(f));

        self.rendering.set(true);
        let weak = self.weak_self.clone();
        let invalidate: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.mark_dirty();
            }
        });
        let result = {
            let mut ctx = Ctx::new(
                &self.hooks,
                &self.staged_effects,
                &self.state,
                &self.props,
                invalidate,
            );
            let result = (self.render_fn)(&mut ctx);
            if result.is_ok() {
                let used = ctx.used();
                let total = self.hooks.borrow().len();
                if used != total {
                    log::warn!(
                        "instance {}: hook call count changed between renders ({} used, {} cells)",
                        self.id,
                        used,
                        total
                    );
                }
            }
            result
        };
        self.rendering.set(false);

        let render_failed = result.is_err();
        let output = match result {
            Ok(output) => output,
            Err(error) => {
                log::error!("instance {}: render failed: {}", self.id, error);
                // Effects staged by the failed render never run, and the
                // previously committed effects stay registered untouched.
                self.staged_effects.borrow_mut().clear();
                let fallback = self.fallback.borrow().clone();
                let node = match fallback {
                    Some(fallback) => fallback(&error),
                    None => error_placeholder(&error),
                };
                RenderOutput::Node(node)
            }
        };

        if let Err(error) = self.commit(host.as_ref(), root, output) {
            self.scheduler.report_error(&error);
        }

        if let Some(focused) = focused {
            if host.contains(root, focused) {
                if let Err(e) = host.set_focus(focused) {
                    log::warn!("instance {}: focus restore failed: {}", self.id, e);
                } else if let Some((start, end)) = selection {
                    if let Err(e) = host.set_selection(focused, start, end) {
                        log::warn!("instance {}: selection restore failed: {}", self.id, e);
                    }
                }
            }
        }

        // Effects run one microtask after the patch lands. Each flush gets
        // exactly the descriptors its own render staged, so an interleaved
        // follow-up render cannot double or starve them.
        if !render_failed {
            let staged = std::mem::take(&mut *self.staged_effects.borrow_mut());
            let weak = self.weak_self.clone();
            self.scheduler.enqueue_task(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.flush_staged_effects(staged);
                }
            });
        }

        // Merges queued mid-render land now and trigger a follow-up render.
        let mut queued_any = false;
        for (record, pending) in [
            (&self.state, &self.pending_state),
            (&self.props, &self.pending_props),
        ] {
            let queued = std::mem::take(&mut *pending.borrow_mut());
            if !queued.is_empty() {
                let mut record = record.borrow_mut();
                for partial in queued {
                    merge(&mut record, partial);
                }
                queued_any = true;
            }
        }
        if queued_any {
            self.mark_dirty();
        }
    }

    fn commit(
        &self,
        host: &dyn HostAdapter,
        root: HostId,
        output: RenderOutput,
    ) -> Result<(), RuntimeError> {
        let engine = DiffEngine::new(host);
        engine.carry_deferred(self.pending_live.take());
        let previous = self.last_output.replace(Committed::Empty);
        let result = match output {
            RenderOutput::Node(new_tree) => {
                let patched = match &previous {
                    Committed::Tree(old_tree) => {
                        engine.reconcile_children(root, old_tree.as_list(), new_tree.as_list())
                    }
                    Committed::Empty => engine.reconcile_children(root, &[], new_tree.as_list()),
                    Committed::Markup(_) => clear_children(host, root)
                        .and_then(|()| engine.reconcile_children(root, &[], new_tree.as_list())),
                };
                patched.map(|()| {
                    *self.last_output.borrow_mut() = Committed::Tree(new_tree);
                })
            }
            RenderOutput::Markup(markup) => {
                let applied = match &previous {
                    // Identical raw output is a committed no-op.
                    Committed::Markup(old) if *old == markup => Ok(()),
                    Committed::Empty => host.apply_markup(root, &markup),
                    _ => clear_children(host, root)
                        .and_then(|()| host.apply_markup(root, &markup)),
                };
                applied.map(|()| {
                    *self.last_output.borrow_mut() = Committed::Markup(markup);
                })
            }
        };
        if result.is_err() {
            // A patch that failed partway leaves the host and the committed
            // tree out of sync; reset both to empty so the next render
            // rebuilds from scratch instead of duplicating survivors.
            log::warn!(
                "instance {}: commit failed partway, resetting subtree",
                self.id
            );
            if let Err(e) = clear_children(host, root) {
                self.scheduler.report_error(&e);
            }
            *self.last_output.borrow_mut() = Committed::Empty;
        }
        *self.pending_live.borrow_mut() = engine.take_deferred();
        result
    }

    fn flush_staged_effects(&self, staged: Vec<StagedEffect>) {
        if self.unmounted.get() {
            return;
        }
        let mut committed = std::mem::take(&mut *self.effects.borrow_mut());
        let scheduler = self.scheduler.clone();
        hooks::flush_effects(&mut committed, staged, &|e| scheduler.report_error(e));
        if self.unmounted.get() {
            // An effect unmounted the instance; its peers' cleanups still run.
            hooks::run_cleanups(&mut committed, &|e| scheduler.report_error(e));
        } else {
            *self.effects.borrow_mut() = committed;
        }
    }
}

impl Renderable for ComponentInner {
    fn instance_id(&self) -> u64 {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.mounted.get() && !self.unmounted.get()
    }

    fn render_now(&self) {
        self.render_instance();
    }
}

fn merge(record: &mut Record, partial: Record) {
    for (key, value) in partial {
        record.insert(key, value);
    }
}

fn clear_children(host: &dyn HostAdapter, root: HostId) -> Result<(), RuntimeError> {
    for child in host.children(root) {
        host.remove_child(root, child)?;
    }
    Ok(())
}

fn error_placeholder(error: &RuntimeError) -> VNode {
    VNode::element("div")
        .with_attr("data-render-error", "true")
        .with_child(VNode::text(error.to_string()))
}
