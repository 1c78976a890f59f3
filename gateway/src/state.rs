use parking_lot::RwLock;
use std::sync::Arc;

/// Read-only value that can be replaced wholesale.
///
/// Readers take an `Arc` to the current value and keep it for as long as they
/// need; a `replace` never mutates what they hold.
#[derive(Debug)]
pub struct Snapshot<T> {
    current: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self { current: Arc::clone(&self.current) }
    }
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self { current: Arc::new(RwLock::new(Arc::new(value))) }
    }

    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.current.read())
    }

    /// Swaps in a new value and returns the previous one
    pub fn replace(&self, value: T) -> Arc<T> {
        std::mem::replace(&mut *self.current.write(), Arc::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_keeps_old_readers_consistent() {
        let snap = Snapshot::new(vec![1, 2, 3]);
        let held = snap.load();
        let old = snap.replace(vec![4]);

        assert_eq!(*held, vec![1, 2, 3]);
        assert!(Arc::ptr_eq(&held, &old));
        assert_eq!(*snap.load(), vec![4]);
        assert_eq!(*snap.clone().load(), vec![4]);
    }
}
