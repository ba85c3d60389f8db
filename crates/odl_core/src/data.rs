//! Shared global page data

use crate::utils::extend;
use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

/// Aggregated page/site/user/product/order state.
///
/// Cloning yields another handle to the same value, so a mutation made
/// through one handle is visible to every plugin holding another.
#[derive(Debug, Clone)]
pub struct GlobalData {
    inner: Arc<RwLock<Value>>,
}

impl Default for GlobalData {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl GlobalData {
    pub fn new(value: Value) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Clone of the current value
    pub fn snapshot(&self) -> Value {
        self.read().clone()
    }

    /// Borrow the current value for reading
    pub fn read(&self) -> RwLockReadGuard<'_, Value> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the value in place
    pub fn update<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Deep-merge `source` into the value
    pub fn merge(&self, source: &Value) {
        self.update(|value| extend(value, source));
    }

    /// Swap in a new value wholesale
    pub fn replace(&self, value: Value) {
        self.update(|current| *current = value);
    }

    /// Whether two handles share the same storage
    pub fn ptr_eq(&self, other: &GlobalData) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutation_is_shared() {
        let data = GlobalData::new(json!({"page": {"type": "home"}}));
        let other = data.clone();
        other.merge(&json!({"page": {"name": "Home"}}));
        assert_eq!(data.snapshot(), json!({"page": {"type": "home", "name": "Home"}}));
        assert!(data.ptr_eq(&other));
    }

    #[test]
    fn test_replace() {
        let data = GlobalData::default();
        data.replace(json!({"user": {}}));
        assert_eq!(data.read().get("user"), Some(&json!({})));
    }
}
