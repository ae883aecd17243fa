//! In-place UI reconciliation runtime: a render scheduler, a keyed diff/patch
//! engine over a host tree adapter, a positional hooks runtime, and a
//! component lifecycle wrapper with event delegation and a query-cache
//! boundary.
//!
//! The runtime is single-threaded by design; shared state lives behind
//! `Rc`/`RefCell` and the scheduler replaces the host's microtask source with
//! an explicit queue drained by [`Scheduler::run_until_idle`].
pub mod component;
pub mod diff;
pub mod errors;
pub mod events;
pub mod hooks;
pub mod host;
pub mod query;
pub mod scheduler;
pub mod vnode;

pub use component::{Component, Record, RenderOutput};
pub use errors::RuntimeError;
pub use events::{Event, EventHandler};
pub use hooks::{Ctx, Deps, EffectCleanup, StateSetter};
pub use host::{HostAdapter, HostId, MemoryHost, Mutation, LIVE_PROPS};
pub use query::{use_query, QueryCache, QuerySnapshot, SubscriptionId};
pub use scheduler::{Renderable, Scheduler, SchedulerHandle};
pub use vnode::{AttrValue, VNode};
