//! Storage size notifications

use std::sync::Arc;

use parking_lot::RwLock;

use super::storage_id::StorageId;

/// Logical size of a storage after a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeChange {
    pub storage_id: StorageId,
    pub num_entries: u64,
    pub num_bytes: u64,
    /// Last notification before the storage goes down
    pub is_shutdown: bool,
}

/// Receives size changes of a storage.
///
/// Invoked after the storage released its lock, so a listener may call back
/// into the storage.
pub trait StorageSizeListener: Send + Sync {
    fn storage_size_changed(&self, change: &SizeChange);
}

/// Registered size listeners; identity is pointer equality
#[derive(Default)]
pub struct SizeListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn StorageSizeListener>>>,
}

impl SizeListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if already registered
    pub fn add(&self, listener: Arc<dyn StorageSizeListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Returns false if not registered
    pub fn remove(&self, listener: &Arc<dyn StorageSizeListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before != listeners.len()
    }

    /// With `None`: whether any listener is registered
    pub fn contains(&self, listener: Option<&Arc<dyn StorageSizeListener>>) -> bool {
        let listeners = self.listeners.read();
        match listener {
            Some(l) => listeners.iter().any(|x| Arc::ptr_eq(x, l)),
            None => !listeners.is_empty(),
        }
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `change` to every listener
    pub fn notify(&self, change: &SizeChange) {
        // snapshot so listeners can (un)register from the callback
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.storage_size_changed(change);
        }
    }
}

impl std::fmt::Debug for SizeListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<SizeChange>>,
    }

    impl StorageSizeListener for Recorder {
        fn storage_size_changed(&self, change: &SizeChange) {
            self.seen.lock().push(change.clone());
        }
    }

    fn change(num_entries: u64) -> SizeChange {
        SizeChange {
            storage_id: StorageId::new("cache", "test"),
            num_entries,
            num_bytes: num_entries * 10,
            is_shutdown: false,
        }
    }

    #[test]
    fn test_notify_reaches_all_listeners() {
        let registry = SizeListenerRegistry::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        registry.add(a.clone());
        registry.add(b.clone());

        registry.notify(&change(3));

        assert_eq!(a.seen.lock().len(), 1);
        assert_eq!(b.seen.lock()[0].num_bytes, 30);
    }

    #[test]
    fn test_add_remove_contains() {
        let registry = SizeListenerRegistry::new();
        let a: Arc<dyn StorageSizeListener> = Arc::new(Recorder::default());
        assert!(!registry.contains(None));

        assert!(registry.add(a.clone()));
        assert!(!registry.add(a.clone()));
        assert!(registry.contains(Some(&a)));
        assert!(registry.contains(None));

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert!(registry.is_empty());
    }
}
