use std::sync::Arc;

use parking_lot::RwLock;

/// Holder of a process-wide service instance.
///
/// The slot is owned by the host and passed to whoever needs the service.
/// It can be initialized only once until the instance is shut down.
pub struct InstanceSlot<T: ?Sized> {
    instance: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> Default for InstanceSlot<T> {
    fn default() -> Self {
        InstanceSlot::new()
    }
}

impl<T: ?Sized> InstanceSlot<T> {
    pub fn new() -> Self {
        InstanceSlot {
            instance: RwLock::new(None),
        }
    }

    /// Creates slot already holding the instance.
    pub fn with_instance(instance: Arc<T>) -> Self {
        InstanceSlot {
            instance: RwLock::new(Some(instance)),
        }
    }

    /// Puts instance into the slot.
    /// Returns false and leaves the slot intact if it is occupied.
    pub fn initialize(&self, instance: Arc<T>) -> bool {
        self.initialize_with(|| instance)
    }

    /// Constructs instance and puts it into the slot.
    /// `make` is not called if the slot is occupied.
    pub fn initialize_with(&self, make: impl FnOnce() -> Arc<T>) -> bool {
        let mut slot = self.instance.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(make());
        true
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.instance.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.instance.read().is_some()
    }

    /// Takes instance out of the slot allowing it to be initialized again.
    pub fn shutdown(&self) -> Option<Arc<T>> {
        self.instance.write().take()
    }
}
