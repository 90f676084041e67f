//! Per-thread expression cache.
//!
//! Expression evaluation caches resolved values for the duration of a
//! request. The store is thread-local and must be released at every request
//! boundary, otherwise a pooled worker thread carries stale values into the
//! next request.

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::Value;

thread_local! {
    static STORE: RefCell<Option<ExpressionStore>> = const { RefCell::new(None) };
}

/// Cached expression results for the current thread.
#[derive(Debug, Default)]
pub struct ExpressionStore {
    entries: HashMap<String, Value>,
}

impl ExpressionStore {
    pub fn cache(&mut self, expression: impl Into<String>, value: Value) {
        self.entries.insert(expression.into(), value);
    }

    pub fn get(&self, expression: &str) -> Option<&Value> {
        self.entries.get(expression)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run `f` against this thread's store. Without `create`, returns `None`
/// when the thread has no store.
pub fn with_thread_store<R>(create: bool, f: impl FnOnce(&mut ExpressionStore) -> R) -> Option<R> {
    STORE.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            if !create {
                return None;
            }
            *slot = Some(ExpressionStore::default());
        }
        slot.as_mut().map(f)
    })
}

pub fn has_thread_store() -> bool {
    STORE.with(|slot| slot.borrow().is_some())
}

/// Destroy this thread's store. Returns the number of entries released, or
/// `None` when there was no store.
pub fn release_thread_store() -> Option<usize> {
    STORE.with(|slot| slot.borrow_mut().take()).map(|store| store.len())
}
