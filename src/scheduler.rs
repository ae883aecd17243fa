//! Render scheduler: a dirty set of component instances, a reentrancy-safe
//! batching counter, and an explicit microtask queue.
//!
//! One `Scheduler` owns all process-wide scheduling state, so tests can run
//! independent schedulers side by side. Instances are held only as weak
//! membership references; draining a torn-down entry skips it.
use crate::errors::RuntimeError;
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::{Rc, Weak};

/// What the scheduler needs from a component instance. The lifecycle wrapper
/// implements this; the scheduler never sees concrete component types.
pub trait Renderable {
    fn instance_id(&self) -> u64;
    fn is_alive(&self) -> bool;
    /// Re-render now. Must contain its own failures; the flush loop never
    /// sees an error from one instance abort its siblings.
    fn render_now(&self);
}

type Task = Box<dyn FnOnce() + 'static>;
type ErrorSink = Box<dyn Fn(&RuntimeError) + 'static>;

struct SchedulerInner {
    dirty_ids: RefCell<HashSet<u64>>,
    dirty_queue: RefCell<Vec<(u64, Weak<dyn Renderable>)>>,
    batch_depth: Cell<usize>,
    flush_scheduled: Cell<bool>,
    tasks: RefCell<VecDeque<Task>>,
    error_sink: RefCell<Option<ErrorSink>>,
}

impl SchedulerInner {
    fn new() -> Self {
        SchedulerInner {
            dirty_ids: RefCell::new(HashSet::new()),
            dirty_queue: RefCell::new(Vec::new()),
            batch_depth: Cell::new(0),
            flush_scheduled: Cell::new(false),
            tasks: RefCell::new(VecDeque::new()),
            error_sink: RefCell::new(None),
        }
    }

    fn mark_dirty(self: &Rc<Self>, instance: &Rc<dyn Renderable>) {
        let id = instance.instance_id();
        // Re-adding an already-dirty instance is a no-op.
        if !self.dirty_ids.borrow_mut().insert(id) {
            return;
        }
        self.dirty_queue
            .borrow_mut()
            .push((id, Rc::downgrade(instance)));
        if !self.flush_scheduled.get() && self.batch_depth.get() == 0 {
            self.schedule_flush();
        }
    }

    fn schedule_flush(self: &Rc<Self>) {
        self.flush_scheduled.set(true);
        let weak = Rc::downgrade(self);
        self.enqueue_task(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.flush();
            }
        }));
    }

    fn flush(self: &Rc<Self>) {
        // Clear first: a render that dirties other instances must enqueue a
        // fresh flush, never recurse into this one.
        self.flush_scheduled.set(false);
        let queue = std::mem::take(&mut *self.dirty_queue.borrow_mut());
        self.dirty_ids.borrow_mut().clear();
        log::debug!("scheduler: flushing {} dirty instance(s)", queue.len());
        for (id, weak) in queue {
            match weak.upgrade() {
                Some(instance) if instance.is_alive() => instance.render_now(),
                _ => log::debug!("scheduler: skipping torn-down instance {}", id),
            }
        }
    }

    fn enqueue_task(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }

    fn run_until_idle(&self) {
        loop {
            let task = self.tasks.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    fn report_error(&self, error: &RuntimeError) {
        log::error!("runtime error: {}", error);
        if let Some(sink) = self.error_sink.borrow().as_ref() {
            sink(error);
        }
    }
}

/// Owned scheduler. Cloning shares the same dirty set and task queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Rc::new(SchedulerInner::new()),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle(Rc::downgrade(&self.inner))
    }

    /// Add an instance to the dirty set, scheduling a flush microtask when
    /// none is pending and batching depth is zero.
    pub fn mark_dirty(&self, instance: &Rc<dyn Renderable>) {
        self.inner.mark_dirty(instance);
    }

    /// Run `f` with flushes held; a single flush is scheduled afterwards if
    /// anything became dirty. Nested batches coalesce to the outermost one.
    pub fn batch(&self, f: impl FnOnce()) {
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        f();
        self.inner.batch_depth.set(self.inner.batch_depth.get() - 1);
        if self.inner.batch_depth.get() == 0
            && !self.inner.dirty_queue.borrow().is_empty()
            && !self.inner.flush_scheduled.get()
        {
            self.inner.schedule_flush();
        }
    }

    /// Defer work to the next microtask boundary.
    pub fn enqueue_task(&self, task: impl FnOnce() + 'static) {
        self.inner.enqueue_task(Box::new(task));
    }

    /// Drain the microtask queue to quiescence, including tasks enqueued by
    /// tasks. The deterministic stand-in for the host microtask source.
    pub fn run_until_idle(&self) {
        self.inner.run_until_idle();
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.inner.tasks.borrow().is_empty()
    }

    /// Top-level error channel for failures that occur outside any render
    /// call stack (effect errors, deferred host callbacks).
    pub fn set_error_sink(&self, sink: impl Fn(&RuntimeError) + 'static) {
        *self.inner.error_sink.borrow_mut() = Some(Box::new(sink));
    }

    pub fn report_error(&self, error: &RuntimeError) {
        self.inner.report_error(error);
    }
}

/// Non-owning scheduler reference held by component instances.
#[derive(Clone)]
pub struct SchedulerHandle(Weak<SchedulerInner>);

impl SchedulerHandle {
    pub fn mark_dirty(&self, instance: &Rc<dyn Renderable>) {
        if let Some(inner) = self.0.upgrade() {
            inner.mark_dirty(instance);
        }
    }

    pub fn enqueue_task(&self, task: impl FnOnce() + 'static) {
        if let Some(inner) = self.0.upgrade() {
            inner.enqueue_task(Box::new(task));
        }
    }

    pub fn report_error(&self, error: &RuntimeError) {
        if let Some(inner) = self.0.upgrade() {
            inner.report_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        id: u64,
        alive: Cell<bool>,
        renders: Cell<usize>,
    }

    impl Renderable for Probe {
        fn instance_id(&self) -> u64 {
            self.id
        }
        fn is_alive(&self) -> bool {
            self.alive.get()
        }
        fn render_now(&self) {
            self.renders.set(self.renders.get() + 1);
        }
    }

    fn probe(id: u64) -> Rc<Probe> {
        Rc::new(Probe {
            id,
            alive: Cell::new(true),
            renders: Cell::new(0),
        })
    }

    #[test]
    fn dirtying_is_idempotent_per_flush() {
        let scheduler = Scheduler::new();
        let p = probe(1);
        let r: Rc<dyn Renderable> = p.clone();
        scheduler.mark_dirty(&r);
        scheduler.mark_dirty(&r);
        scheduler.mark_dirty(&r);
        scheduler.run_until_idle();
        assert_eq!(p.renders.get(), 1);
    }

    #[test]
    fn batch_defers_flush_until_depth_zero() {
        let scheduler = Scheduler::new();
        let p = probe(1);
        let r: Rc<dyn Renderable> = p.clone();
        scheduler.batch(|| {
            scheduler.mark_dirty(&r);
            scheduler.batch(|| scheduler.mark_dirty(&r));
            assert!(!scheduler.has_pending_tasks());
        });
        assert!(scheduler.has_pending_tasks());
        scheduler.run_until_idle();
        assert_eq!(p.renders.get(), 1);
    }

    #[test]
    fn dead_entries_are_skipped() {
        let scheduler = Scheduler::new();
        let p = probe(1);
        let r: Rc<dyn Renderable> = p.clone();
        scheduler.mark_dirty(&r);
        p.alive.set(false);
        scheduler.run_until_idle();
        assert_eq!(p.renders.get(), 0);
    }

    #[test]
    fn dirtying_during_flush_enqueues_new_flush() {
        struct Chained {
            id: u64,
            scheduler: Scheduler,
            next: RefCell<Option<Rc<dyn Renderable>>>,
            renders: Cell<usize>,
        }
        impl Renderable for Chained {
            fn instance_id(&self) -> u64 {
                self.id
            }
            fn is_alive(&self) -> bool {
                true
            }
            fn render_now(&self) {
                self.renders.set(self.renders.get() + 1);
                if let Some(next) = self.next.borrow_mut().take() {
                    self.scheduler.mark_dirty(&next);
                }
            }
        }

        let scheduler = Scheduler::new();
        let second = probe(2);
        let first = Rc::new(Chained {
            id: 1,
            scheduler: scheduler.clone(),
            next: RefCell::new(Some(second.clone() as Rc<dyn Renderable>)),
            renders: Cell::new(0),
        });
        let r: Rc<dyn Renderable> = first.clone();
        scheduler.mark_dirty(&r);
        scheduler.run_until_idle();
        assert_eq!(first.renders.get(), 1);
        assert_eq!(second.renders.get(), 1);
    }
}
