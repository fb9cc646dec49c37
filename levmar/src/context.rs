use std::ffi::c_void;
use std::fmt::{Debug, Formatter};
use std::num::NonZeroUsize;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

/// Caller data carried through the solver as an integer token.
///
/// The token rides in the native `void *adata` slot. It is never dereferenced,
/// so the object it names may move or be rebuilt between callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ContextHandle(NonZeroUsize);

impl ContextHandle {
    pub fn new(token: usize) -> Option<Self> {
        NonZeroUsize::new(token).map(Self)
    }

    pub fn token(self) -> usize {
        self.0.get()
    }

    /// Native form of an optional handle; `None` becomes null.
    pub fn into_raw(handle: Option<Self>) -> *mut c_void {
        handle.map_or(0, Self::token) as *mut c_void
    }

    pub fn from_raw(raw: *mut c_void) -> Option<Self> {
        Self::new(raw as usize)
    }
}

/// Side table mapping handles to caller objects.
pub struct ContextTable<T> {
    inner: Mutex<TableInner<T>>,
}

struct TableInner<T> {
    next_token: usize,
    entries: HashMap<ContextHandle, Arc<T>>,
}

impl<T> Default for ContextTable<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_token: 1,
                entries: HashMap::new(),
            }),
        }
    }
}

impl<T> ContextTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under a handle not issued before by this table.
    pub fn insert(&self, value: T) -> ContextHandle {
        let mut inner = self.inner.lock();
        let handle = ContextHandle::new(inner.next_token)
            .expect("context handle tokens start at one and never wrap");
        inner.next_token = inner
            .next_token
            .checked_add(1)
            .expect("context handle space exhausted");
        inner.entries.insert(handle, Arc::new(value));
        handle
    }

    pub fn get(&self, handle: ContextHandle) -> Option<Arc<T>> {
        self.inner.lock().entries.get(&handle).cloned()
    }

    pub fn remove(&self, handle: ContextHandle) -> Option<Arc<T>> {
        self.inner.lock().entries.remove(&handle)
    }

    pub fn contains(&self, handle: ContextHandle) -> bool {
        self.inner.lock().entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

impl<T> Debug for ContextTable<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTable")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip_keeps_token() {
        let handle = ContextHandle::new(0xdead_beef).unwrap();
        let raw = ContextHandle::into_raw(Some(handle));

        assert_eq!(raw as usize, 0xdead_beef);
        assert_eq!(ContextHandle::from_raw(raw), Some(handle));
        assert!(ContextHandle::into_raw(None).is_null());
        assert_eq!(ContextHandle::from_raw(std::ptr::null_mut()), None);
    }

    #[test]
    fn table_issues_unique_handles() {
        let table = ContextTable::new();
        let a = table.insert("a");
        let b = table.insert("b");

        assert_ne!(a, b);
        assert_eq!(*table.get(a).unwrap(), "a");
        assert_eq!(*table.get(b).unwrap(), "b");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removed_handle_is_not_reissued() {
        let table = ContextTable::new();
        let a = table.insert(1);
        assert_eq!(table.remove(a).as_deref(), Some(&1));
        assert!(!table.contains(a));
        assert!(table.is_empty());

        let b = table.insert(2);
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
    }
}
