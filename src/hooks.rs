//! Positional hooks runtime.
//!
//! Every render of an instance resets a call-index counter; each hook call
//! consumes the next index and either initializes or retrieves the cell at
//! that index. The sequence of cell kinds must be stable across renders —
//! a mismatch is a detected programmer error, not silent state corruption.
use crate::errors::RuntimeError;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Dependency array. `None` means "always changed".
pub type Deps = Option<Vec<Value>>;

/// Two dependency arrays are "changed" if exactly one is present, their
/// lengths differ, or any pairwise element differs.
pub(crate) fn deps_changed(old: &Deps, new: &Deps) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => old.len() != new.len() || old.iter().ne(new.iter()),
        _ => true,
    }
}

pub type EffectCleanup = Box<dyn FnOnce() -> Result<(), RuntimeError> + 'static>;
pub type EffectCreate = Box<dyn FnOnce() -> Result<Option<EffectCleanup>, RuntimeError> + 'static>;

/// Effect staged during a render, pending the post-patch flush.
pub(crate) struct StagedEffect {
    pub deps: Deps,
    pub create: EffectCreate,
}

/// Effect that ran in a previous flush; owns the cleanup for the next run.
pub(crate) struct CommittedEffect {
    pub deps: Deps,
    pub cleanup: Option<EffectCleanup>,
}

/// Ref-counted shell around a state value so setters stay valid without
/// keeping the owning instance alive.
pub(crate) struct StateCell {
    value: RefCell<Value>,
}

pub(crate) enum HookCell {
    State(Rc<StateCell>),
    Ref(Rc<RefCell<Value>>),
    Memo { value: Value, deps: Deps },
    /// Marker for call-order validation; effect data lives in the effect
    /// tables on the instance.
    Effect,
}

impl HookCell {
    fn kind(&self) -> &'static str {
        match self {
            HookCell::State(_) => "state",
            HookCell::Ref(_) => "ref",
            HookCell::Memo { .. } => "memo",
            HookCell::Effect => "effect",
        }
    }
}

fn order_violation(index: usize, expected: &'static str, cell: &HookCell) -> RuntimeError {
    RuntimeError::HookOrderViolation {
        index,
        expected,
        actual: cell.kind(),
    }
}

/// Setter returned by [`Ctx::use_state`]. Compares against the previous value
/// and marks the owning instance dirty on change; never re-renders
/// synchronously.
#[derive(Clone)]
pub struct StateSetter {
    cell: Rc<StateCell>,
    invalidate: Rc<dyn Fn()>,
}

impl StateSetter {
    pub fn set(&self, next: Value) {
        let changed = {
            let mut value = self.cell.value.borrow_mut();
            if *value == next {
                false
            } else {
                *value = next;
                true
            }
        };
        if changed {
            (self.invalidate)();
        }
    }

    /// Compute the next value from the current one.
    pub fn update(&self, f: impl FnOnce(&Value) -> Value) {
        let current = self.cell.value.borrow().clone();
        self.set(f(&current));
    }
}

/// Per-render hook context handed to the component's render function.
pub struct Ctx<'a> {
    cells: &'a RefCell<Vec<HookCell>>,
    staged: &'a RefCell<Vec<StagedEffect>>,
    state: &'a RefCell<Map<String, Value>>,
    props: &'a RefCell<Map<String, Value>>,
    invalidate: Rc<dyn Fn()>,
    cursor: usize,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(
        cells: &'a RefCell<Vec<HookCell>>,
        staged: &'a RefCell<Vec<StagedEffect>>,
        state: &'a RefCell<Map<String, Value>>,
        props: &'a RefCell<Map<String, Value>>,
        invalidate: Rc<dyn Fn()>,
    ) -> Self {
        Ctx {
            cells,
            staged,
            state,
            props,
            invalidate,
            cursor: 0,
        }
    }

    fn next_index(&mut self) -> usize {
        let index = self.cursor;
        self.cursor += 1;
        index
    }

    /// Hook calls consumed by this render; checked against the cell count
    /// for length stability once the render returns.
    pub(crate) fn used(&self) -> usize {
        self.cursor
    }

    /// Instance-level state value by key.
    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.state.borrow().get(key).cloned()
    }

    pub fn props_value(&self, key: &str) -> Option<Value> {
        self.props.borrow().get(key).cloned()
    }

    /// A closure that marks the owning instance dirty; the seam external
    /// subscriptions (e.g. the query cache listener) hang off.
    pub fn invalidate_handle(&self) -> Rc<dyn Fn()> {
        self.invalidate.clone()
    }

    pub fn use_state(&mut self, initial: Value) -> Result<(Value, StateSetter), RuntimeError> {
        let index = self.next_index();
        let mut cells = self.cells.borrow_mut();
        if index == cells.len() {
            cells.push(HookCell::State(Rc::new(StateCell {
                value: RefCell::new(initial),
            })));
        }
        let cell = match &cells[index] {
            HookCell::State(cell) => cell.clone(),
            other => return Err(order_violation(index, "state", other)),
        };
        drop(cells);
        let current = cell.value.borrow().clone();
        Ok((
            current,
            StateSetter {
                cell,
                invalidate: self.invalidate.clone(),
            },
        ))
    }

    /// Stable mutable box; identity persists for the instance's lifetime and
    /// writing it never triggers a render.
    pub fn use_ref(&mut self, initial: Value) -> Result<Rc<RefCell<Value>>, RuntimeError> {
        let index = self.next_index();
        let mut cells = self.cells.borrow_mut();
        if index == cells.len() {
            cells.push(HookCell::Ref(Rc::new(RefCell::new(initial))));
        }
        match &cells[index] {
            HookCell::Ref(boxed) => Ok(boxed.clone()),
            other => Err(order_violation(index, "ref", other)),
        }
    }

    pub fn use_memo(
        &mut self,
        deps: Deps,
        factory: impl FnOnce() -> Value,
    ) -> Result<Value, RuntimeError> {
        let index = self.next_index();
        {
            let mut cells = self.cells.borrow_mut();
            if index == cells.len() {
                cells.push(HookCell::Memo {
                    value: Value::Null,
                    deps: None,
                });
                // Fall through: None deps on the fresh cell force the first
                // computation below.
            } else if !matches!(cells[index], HookCell::Memo { .. }) {
                return Err(order_violation(index, "memo", &cells[index]));
            } else if let HookCell::Memo {
                value,
                deps: previous,
            } = &cells[index]
            {
                if !deps_changed(previous, &deps) {
                    return Ok(value.clone());
                }
            }
        }
        // Borrow released: the factory may itself read state.
        let value = factory();
        self.cells.borrow_mut()[index] = HookCell::Memo {
            value: value.clone(),
            deps,
        };
        Ok(value)
    }

    /// Stage an effect for after the current render's patch lands. `create`
    /// never runs during render; it returns an optional cleanup that runs
    /// before the next create or at teardown.
    pub fn use_effect(
        &mut self,
        deps: Deps,
        create: impl FnOnce() -> Result<Option<EffectCleanup>, RuntimeError> + 'static,
    ) -> Result<(), RuntimeError> {
        let index = self.next_index();
        let mut cells = self.cells.borrow_mut();
        if index == cells.len() {
            cells.push(HookCell::Effect);
        } else if !matches!(cells[index], HookCell::Effect) {
            return Err(order_violation(index, "effect", &cells[index]));
        }
        drop(cells);
        self.staged.borrow_mut().push(StagedEffect {
            deps,
            create: Box::new(create),
        });
        Ok(())
    }
}

/// One post-patch effect flush: pairs staged descriptors with the previously
/// committed ones index by index. Errors are reported, never propagated, so
/// one failing effect cannot block its siblings.
pub(crate) fn flush_effects(
    committed: &mut Vec<CommittedEffect>,
    staged: Vec<StagedEffect>,
    report: &dyn Fn(&RuntimeError),
) {
    let previous = std::mem::take(committed);
    let mut previous = previous.into_iter();
    let mut next = Vec::with_capacity(staged.len());

    for staged_effect in staged {
        match previous.next() {
            Some(prev) => {
                if deps_changed(&prev.deps, &staged_effect.deps) {
                    // Old cleanup strictly before new create.
                    if let Some(cleanup) = prev.cleanup {
                        if let Err(e) = cleanup() {
                            report(&e);
                        }
                    }
                    next.push(run_create(staged_effect, report));
                } else {
                    next.push(CommittedEffect {
                        deps: prev.deps,
                        cleanup: prev.cleanup,
                    });
                }
            }
            // Index present only in the new array: create unconditionally.
            None => next.push(run_create(staged_effect, report)),
        }
    }

    // Indices present only in the old array: cleanup and drop.
    for prev in previous {
        if let Some(cleanup) = prev.cleanup {
            if let Err(e) = cleanup() {
                report(&e);
            }
        }
    }

    *committed = next;
}

fn run_create(staged: StagedEffect, report: &dyn Fn(&RuntimeError)) -> CommittedEffect {
    let cleanup = match (staged.create)() {
        Ok(cleanup) => cleanup,
        Err(e) => {
            report(&e);
            None
        }
    };
    CommittedEffect {
        deps: staged.deps,
        cleanup,
    }
}

/// Teardown path: run every still-registered cleanup.
pub(crate) fn run_cleanups(committed: &mut Vec<CommittedEffect>, report: &dyn Fn(&RuntimeError)) {
    for effect in committed.drain(..) {
        if let Some(cleanup) = effect.cleanup {
            if let Err(e) = cleanup() {
                report(&e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn harness() -> (
        RefCell<Vec<HookCell>>,
        RefCell<Vec<StagedEffect>>,
        RefCell<Map<String, Value>>,
        RefCell<Map<String, Value>>,
        Rc<std::cell::Cell<usize>>,
    ) {
        (
            RefCell::new(Vec::new()),
            RefCell::new(Vec::new()),
            RefCell::new(Map::new()),
            RefCell::new(Map::new()),
            Rc::new(std::cell::Cell::new(0)),
        )
    }

    fn ctx<'a>(
        cells: &'a RefCell<Vec<HookCell>>,
        staged: &'a RefCell<Vec<StagedEffect>>,
        state: &'a RefCell<Map<String, Value>>,
        props: &'a RefCell<Map<String, Value>>,
        invalidations: &Rc<std::cell::Cell<usize>>,
    ) -> Ctx<'a> {
        let counter = invalidations.clone();
        Ctx::new(
            cells,
            staged,
            state,
            props,
            Rc::new(move || counter.set(counter.get() + 1)),
        )
    }

    #[test]
    fn deps_comparison_rules() {
        assert!(deps_changed(&None, &None));
        assert!(deps_changed(&Some(vec![json!(1)]), &None));
        assert!(deps_changed(&None, &Some(vec![json!(1)])));
        assert!(deps_changed(&Some(vec![json!(1)]), &Some(vec![])));
        assert!(deps_changed(&Some(vec![json!(1)]), &Some(vec![json!(2)])));
        assert!(!deps_changed(
            &Some(vec![json!(1), json!("a")]),
            &Some(vec![json!(1), json!("a")])
        ));
    }

    #[test]
    fn state_persists_and_setter_invalidates_on_change_only() {
        let (cells, staged, state, props, invalidations) = harness();

        let setter = {
            let mut c = ctx(&cells, &staged, &state, &props, &invalidations);
            let (value, setter) = c.use_state(json!(0)).unwrap();
            assert_eq!(value, json!(0));
            setter
        };

        setter.set(json!(0));
        assert_eq!(invalidations.get(), 0);
        setter.set(json!(1));
        assert_eq!(invalidations.get(), 1);
        setter.update(|v| json!(v.as_i64().unwrap() + 1));
        assert_eq!(invalidations.get(), 2);

        let mut c = ctx(&cells, &staged, &state, &props, &invalidations);
        let (value, _) = c.use_state(json!(0)).unwrap();
        assert_eq!(value, json!(2));
    }

    #[test]
    fn ref_box_is_identity_stable() {
        let (cells, staged, state, props, invalidations) = harness();
        let first = ctx(&cells, &staged, &state, &props, &invalidations)
            .use_ref(json!("x"))
            .unwrap();
        let second = ctx(&cells, &staged, &state, &props, &invalidations)
            .use_ref(json!("ignored"))
            .unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(invalidations.get(), 0);
    }

    #[test]
    fn memo_recomputes_only_on_dep_change() {
        let (cells, staged, state, props, invalidations) = harness();
        let runs = Rc::new(std::cell::Cell::new(0));

        for (dep, expected_runs) in [(1, 1), (1, 1), (2, 2)] {
            let mut c = ctx(&cells, &staged, &state, &props, &invalidations);
            let runs2 = runs.clone();
            let value = c
                .use_memo(Some(vec![json!(dep)]), move || {
                    runs2.set(runs2.get() + 1);
                    json!(dep * 10)
                })
                .unwrap();
            assert_eq!(value, json!(dep * 10));
            assert_eq!(runs.get(), expected_runs);
        }
    }

    #[test]
    fn kind_mismatch_is_an_order_violation() {
        let (cells, staged, state, props, invalidations) = harness();
        ctx(&cells, &staged, &state, &props, &invalidations)
            .use_state(json!(0))
            .unwrap();
        let err = ctx(&cells, &staged, &state, &props, &invalidations)
            .use_ref(json!(0))
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::HookOrderViolation {
                index: 0,
                expected: "ref",
                actual: "state",
            }
        ));
    }

    #[test]
    fn effect_flush_runs_cleanup_before_recreate() {
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let mut committed = Vec::new();
        let report = |e: &RuntimeError| panic!("unexpected: {e}");

        let o = order.clone();
        flush_effects(
            &mut committed,
            vec![StagedEffect {
                deps: Some(vec![json!(1)]),
                create: Box::new(move || {
                    o.borrow_mut().push("create-1");
                    let o2 = o.clone();
                    Ok(Some(Box::new(move || {
                        o2.borrow_mut().push("cleanup-1");
                        Ok(())
                    }) as EffectCleanup))
                }),
            }],
            &report,
        );

        // Same deps: neither cleanup nor create runs.
        let o = order.clone();
        flush_effects(
            &mut committed,
            vec![StagedEffect {
                deps: Some(vec![json!(1)]),
                create: Box::new(move || {
                    o.borrow_mut().push("create-skipped");
                    Ok(None)
                }),
            }],
            &report,
        );

        // Changed deps: old cleanup strictly before new create.
        let o = order.clone();
        flush_effects(
            &mut committed,
            vec![StagedEffect {
                deps: Some(vec![json!(2)]),
                create: Box::new(move || {
                    o.borrow_mut().push("create-2");
                    Ok(None)
                }),
            }],
            &report,
        );

        assert_eq!(*order.borrow(), vec!["create-1", "cleanup-1", "create-2"]);
    }

    #[test]
    fn effect_error_does_not_block_siblings() {
        let reported = Rc::new(std::cell::Cell::new(0));
        let ran = Rc::new(std::cell::Cell::new(false));
        let mut committed = Vec::new();
        let reported2 = reported.clone();
        let ran2 = ran.clone();
        flush_effects(
            &mut committed,
            vec![
                StagedEffect {
                    deps: None,
                    create: Box::new(|| Err(RuntimeError::effect("boom"))),
                },
                StagedEffect {
                    deps: None,
                    create: Box::new(move || {
                        ran2.set(true);
                        Ok(None)
                    }),
                },
            ],
            &move |_| reported2.set(reported2.get() + 1),
        );
        assert_eq!(reported.get(), 1);
        assert!(ran.get());
        assert_eq!(committed.len(), 2);
    }

    #[test]
    fn dropped_effect_index_runs_cleanup() {
        let cleaned = Rc::new(std::cell::Cell::new(false));
        let mut committed = Vec::new();
        let report = |e: &RuntimeError| panic!("unexpected: {e}");

        let cleaned2 = cleaned.clone();
        flush_effects(
            &mut committed,
            vec![StagedEffect {
                deps: Some(vec![]),
                create: Box::new(move || {
                    Ok(Some(Box::new(move || {
                        cleaned2.set(true);
                        Ok(())
                    }) as EffectCleanup))
                }),
            }],
            &report,
        );

        flush_effects(&mut committed, Vec::new(), &report);
        assert!(cleaned.get());
        assert!(committed.is_empty());
    }
}
