//! Copy-on-write property bag shared between nested builders.
//!
//! A forked bag reads through to its parent until it is written to. The first
//! write creates a local overlay; later writes and removals land in the
//! overlay and are never visible to the parent. Keys the child has not
//! touched keep reading through, so markers the parent sets after the fork
//! are still observed.
//!
//! ```
//! use tenantry_core::PropertyBag;
//!
//! let parent = PropertyBag::new();
//! parent.insert("theme", "dark".to_string());
//!
//! let child = parent.fork();
//! assert_eq!(child.get_as::<String>("theme").as_deref().map(String::as_str), Some("dark"));
//!
//! child.insert("theme", "light".to_string());
//! assert_eq!(parent.get_as::<String>("theme").as_deref().map(String::as_str), Some("dark"));
//! ```

use parking_lot::RwLock;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A shared, type-erased property value
pub type PropertyValue = Arc<dyn Any + Send + Sync>;

/// `None` in the overlay marks a key removed locally
type Overlay = HashMap<String, Option<PropertyValue>>;

struct BagInner {
    parent: Option<PropertyBag>,
    overlay: Option<Overlay>,
}

/// String-keyed bag of shared values with copy-on-write forking.
///
/// Cloning a `PropertyBag` aliases it: both handles see the same values.
/// Use [`fork`](PropertyBag::fork) for an isolated child.
#[derive(Clone)]
pub struct PropertyBag {
    inner: Arc<RwLock<BagInner>>,
}

impl PropertyBag {
    /// A root bag that owns its values
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BagInner {
                parent: None,
                overlay: Some(HashMap::new()),
            })),
        }
    }

    /// A child that reads through to this bag until it is written to
    pub fn fork(&self) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BagInner {
                parent: Some(self.clone()),
                overlay: None,
            })),
        }
    }

    /// Whether this bag holds local values (always true for a root)
    pub fn is_detached(&self) -> bool {
        self.inner.read().overlay.is_some()
    }

    pub fn get(&self, key: &str) -> Option<PropertyValue> {
        let inner = self.inner.read();
        if let Some(local) = inner.overlay.as_ref().and_then(|o| o.get(key)) {
            return local.clone();
        }
        inner.parent.as_ref().and_then(|parent| parent.get(key))
    }

    /// Typed read; `None` when missing or of another type
    pub fn get_as<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key).and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn insert<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.insert_value(key, Arc::new(value));
    }

    pub fn insert_value(&self, key: impl Into<String>, value: PropertyValue) {
        let mut inner = self.inner.write();
        inner
            .overlay
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), Some(value));
    }

    /// Record a presence marker
    pub fn set_flag(&self, key: impl Into<String>) {
        self.insert(key, true);
    }

    /// Remove a key and return the value this bag saw for it
    pub fn remove(&self, key: &str) -> Option<PropertyValue> {
        let previous = self.get(key);
        let mut inner = self.inner.write();
        if inner.parent.is_none() {
            return inner.overlay.as_mut().and_then(|o| o.remove(key)).flatten();
        }
        if previous.is_some() {
            inner
                .overlay
                .get_or_insert_with(HashMap::new)
                .insert(key.to_string(), None);
        }
        previous
    }

    /// Every key visible through this bag
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut keys: HashSet<String> = inner
            .parent
            .as_ref()
            .map(|parent| parent.keys().into_iter().collect())
            .unwrap_or_default();
        if let Some(overlay) = &inner.overlay {
            for (key, value) in overlay {
                if value.is_some() {
                    keys.insert(key.clone());
                } else {
                    keys.remove(key);
                }
            }
        }
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles alias the same bag
    pub fn ptr_eq(&self, other: &PropertyBag) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for PropertyBag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PropertyBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBag")
            .field("keys", &self.keys())
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_reads_parent_until_written() {
        let parent = PropertyBag::new();
        let child = parent.fork();
        assert!(!child.is_detached());

        parent.set_flag("auth");
        assert!(child.contains("auth"));

        child.set_flag("routing");
        assert!(child.is_detached());
        assert!(child.contains("routing"));
        assert!(!parent.contains("routing"));

        // Untouched keys keep reading through after the fork
        parent.set_flag("late");
        assert!(child.contains("late"));
    }

    #[test]
    fn test_child_write_shadows_parent() {
        let parent = PropertyBag::new();
        parent.insert("name", 1u32);
        let child = parent.fork();
        child.insert("name", 2u32);

        assert_eq!(*parent.get_as::<u32>("name").unwrap(), 1);
        assert_eq!(*child.get_as::<u32>("name").unwrap(), 2);
    }

    #[test]
    fn test_remove_in_child_is_local() {
        let parent = PropertyBag::new();
        parent.set_flag("route-builder");
        let child = parent.fork();

        assert!(child.remove("route-builder").is_some());
        assert!(!child.contains("route-builder"));
        assert!(parent.contains("route-builder"));
        assert_eq!(child.keys(), Vec::<String>::new());
        assert!(child.remove("route-builder").is_none());
    }

    #[test]
    fn test_remove_in_root() {
        let bag = PropertyBag::new();
        bag.insert("k", 7i64);
        assert_eq!(*bag.remove("k").unwrap().downcast::<i64>().unwrap(), 7);
        assert!(bag.is_empty());
    }

    #[test]
    fn test_grandchild_reads_through_chain() {
        let root = PropertyBag::new();
        let child = root.fork();
        let grandchild = child.fork();

        root.set_flag("a");
        child.set_flag("b");
        assert!(grandchild.contains("a"));
        assert!(grandchild.contains("b"));
        assert_eq!(grandchild.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_clone_aliases() {
        let bag = PropertyBag::new();
        let alias = bag.clone();
        alias.set_flag("x");
        assert!(bag.contains("x"));
        assert!(bag.ptr_eq(&alias));
        assert!(!bag.ptr_eq(&bag.fork()));
    }

    #[test]
    fn test_get_as_wrong_type() {
        let bag = PropertyBag::new();
        bag.insert("n", 1u8);
        assert!(bag.get_as::<String>("n").is_none());
    }
}
