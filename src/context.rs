//! Request-scoped key/value store.
//!
//! A [`Context`] is created per inbound batch and shared by the middleware and
//! handlers serving it. [`run`] makes a context ambient for the duration of a
//! future, across every `.await` inside it, so handlers can reach it through
//! [`get`]/[`set`] without it being threaded through their signatures. The
//! ambient slot is task-local: concurrent batches never observe each other's
//! context.

use serde_json::Value;
use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

tokio::task_local! {
    static CURRENT: Context;
}

/// Insertion-ordered map of JSON values. Clones share the same entries.
#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let context = Self::new();
        for (key, value) in entries {
            context.set(key, value);
        }
        context
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Value)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn get_or(&self, key: &str, fallback: Value) -> Value {
        self.get(key).unwrap_or(fallback)
    }

    /// Overwrites in place, keeping the key's original position.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut entries = self.lock();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => entries.push((key, value)),
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut entries = self.lock();
        let index = entries.iter().position(|(k, _)| k == key)?;
        Some(entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries()).finish()
    }
}

/// Drive `fut` with `context` as the ambient context.
pub async fn run<F>(context: Context, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(context, fut).await
}

/// The ambient context, if any.
pub fn current() -> Option<Context> {
    CURRENT.try_with(Context::clone).ok()
}

pub fn get(key: &str) -> Option<Value> {
    CURRENT.try_with(|context| context.get(key)).ok().flatten()
}

pub fn get_or(key: &str, fallback: Value) -> Value {
    get(key).unwrap_or(fallback)
}

/// No-op outside [`run`]; returns whether the value was stored.
pub fn set(key: impl Into<String>, value: Value) -> bool {
    let key = key.into();
    CURRENT
        .try_with(|context| context.set(key, value))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn keeps_insertion_order() {
        let context = Context::create([("b", json!(1)), ("a", json!(2))]);
        context.set("c", json!(3));
        context.set("b", json!(10));
        assert_eq!(context.keys(), ["b", "a", "c"]);
        assert_eq!(context.get("b"), Some(json!(10)));
        assert_eq!(context.remove("a"), Some(json!(2)));
        assert_eq!(context.len(), 2);
    }

    #[test]
    fn fallback_outside_run() {
        assert!(current().is_none());
        assert_eq!(get("user"), None);
        assert_eq!(get_or("user", json!("anonymous")), json!("anonymous"));
        assert!(!set("user", json!("ada")));
    }

    #[tokio::test]
    async fn ambient_across_await_points() {
        let context = Context::create([("user", json!("ada"))]);
        let seen = run(context.clone(), async {
            tokio::task::yield_now().await;
            assert!(set("visits", json!(1)));
            tokio::time::sleep(Duration::from_millis(1)).await;
            get("user")
        })
        .await;

        assert_eq!(seen, Some(json!("ada")));
        assert_eq!(context.get("visits"), Some(json!(1)));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn concurrent_scopes_do_not_leak() {
        let left = Context::create([("side", json!("left"))]);
        let right = Context::create([("side", json!("right"))]);

        let (l, r) = tokio::join!(
            run(left, async {
                tokio::task::yield_now().await;
                get("side")
            }),
            run(right, async {
                tokio::task::yield_now().await;
                get("side")
            }),
        );
        assert_eq!(l, Some(json!("left")));
        assert_eq!(r, Some(json!("right")));
    }
}
