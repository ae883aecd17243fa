//! Cache/query layer boundary. The runtime only subscribes, reads snapshots,
//! and unsubscribes; it owns no cache state.
use crate::errors::RuntimeError;
use crate::hooks::{Ctx, EffectCleanup};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySnapshot {
    pub data: Option<Value>,
    pub error: Option<String>,
    pub updated_at: Option<u64>,
}

pub trait QueryCache {
    /// Register a listener invoked whenever the entry for `key` changes.
    fn subscribe(&self, key: &str, listener: Rc<dyn Fn()>) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
    fn snapshot(&self, key: &str) -> QuerySnapshot;
    fn refetch(&self, key: &str);
    fn invalidate(&self, key: &str);
}

/// Data-fetching hook: subscribes to `key` for the lifetime of the owning
/// instance (re-subscribing when the key changes), marks the instance dirty
/// on cache notifications, and returns the current snapshot.
pub fn use_query(
    ctx: &mut Ctx<'_>,
    cache: &Rc<dyn QueryCache>,
    key: &str,
) -> Result<QuerySnapshot, RuntimeError> {
    let key_owned = key.to_string();
    let cache_for_effect = cache.clone();
    let invalidate = ctx.invalidate_handle();
    ctx.use_effect(Some(vec![json!(key)]), move || {
        let listener: Rc<dyn Fn()> = Rc::new(move || invalidate());
        let id = cache_for_effect.subscribe(&key_owned, listener);
        let cache_for_cleanup = cache_for_effect.clone();
        Ok(Some(Box::new(move || {
            cache_for_cleanup.unsubscribe(id);
            Ok(())
        }) as EffectCleanup))
    })?;
    Ok(cache.snapshot(key))
}
