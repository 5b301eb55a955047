use parking_lot::RwLock;

/// An append-mostly list behind a reader-writer lock
pub struct MutexSlice<T> {
    items: RwLock<Vec<T>>,
}

impl<T> Default for MutexSlice<T> {
    fn default() -> Self {
        MutexSlice { items: RwLock::new(Vec::new()) }
    }
}

impl<T: Clone> MutexSlice<T> {
    pub fn new() -> MutexSlice<T> {
        Default::default()
    }

    pub fn add(&self, item: T) {
        self.items.write().push(item);
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.items.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// A copy of the current contents. Callers iterate the snapshot so that no lock is held
    ///  while they await.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.read().clone()
    }

    pub fn clear(&self) {
        self.items.write().clear();
    }
}

impl<T: Clone + PartialEq> MutexSlice<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.items.read().contains(item)
    }

    /// removes the first occurrence, returning `true` if there was one
    pub fn remove(&self, item: &T) -> bool {
        let mut items = self.items.write();
        match items.iter().position(|i| i == item) {
            Some(idx) => {
                items.remove(idx);
                true
            }
            None => false,
        }
    }
}
