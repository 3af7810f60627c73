//! Typed per-request state.
//!
//! Middleware use extensions to hand values down the chain without widening
//! `HttpRequest`: the resolved tenant code, the host services saved before a
//! tenant pipeline runs, the continuation into the outer pipeline.
//!
//! ```
//! use tenantry_core::Extensions;
//!
//! let mut ext = Extensions::new();
//! ext.insert(42i32);
//! assert_eq!(ext.get::<i32>(), Some(&42));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Map from type to a single shared value of that type.
///
/// Cloning is shallow: values are `Arc`s, so a cloned request sees the same
/// instances as the original.
#[derive(Clone, Default)]
pub struct Extensions {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value of the same type
    #[inline]
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.insert_arc(Arc::new(value));
    }

    /// Insert an already shared value
    #[inline]
    pub fn insert_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) {
        self.map.insert(TypeId::of::<T>(), value);
    }

    #[inline]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Get a shared handle, for values that must outlive the borrow
    #[inline]
    pub fn get_arc<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.clone().downcast::<T>().ok())
    }

    #[inline]
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    /// Remove a value and return it
    #[inline]
    pub fn take<T: Send + Sync + 'static>(&mut self) -> Option<Arc<T>> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Remove a value. Returns true if one was present.
    #[inline]
    pub fn remove<T: Send + Sync + 'static>(&mut self) -> bool {
        self.map.remove(&TypeId::of::<T>()).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("count", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TenantCode(&'static str);

    #[test]
    fn test_insert_replaces() {
        let mut ext = Extensions::new();
        ext.insert(TenantCode("a"));
        ext.insert(TenantCode("b"));

        assert_eq!(ext.get::<TenantCode>(), Some(&TenantCode("b")));
        assert_eq!(ext.len(), 1);
    }

    #[test]
    fn test_take_removes() {
        let mut ext = Extensions::new();
        ext.insert(TenantCode("a"));

        let taken = ext.take::<TenantCode>().unwrap();
        assert_eq!(*taken, TenantCode("a"));
        assert!(!ext.contains::<TenantCode>());
        assert!(ext.take::<TenantCode>().is_none());
    }

    #[test]
    fn test_clone_shares_values() {
        let mut ext = Extensions::new();
        ext.insert(TenantCode("a"));

        let cloned = ext.clone();
        let a = ext.get_arc::<TenantCode>().unwrap();
        let b = cloned.get_arc::<TenantCode>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
