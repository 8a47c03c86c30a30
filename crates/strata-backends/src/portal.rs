//! Index accessors over [`Storage`] bound to one residency.
//!
//! A portal holds a reference-counted pointer to the storage it reads, so it
//! stays valid even if the owning array handle reallocates afterwards; it just
//! stops observing the handle's newer contents.

use std::fmt;
use std::sync::Arc;

use crate::adapter::{Id, Value};
use crate::memory::Storage;

#[inline]
#[track_caller]
fn checked(index: Id, len: usize) -> usize {
    match usize::try_from(index) {
        Ok(i) if i < len => i,
        _ => panic!("portal index {index} out of range for length {len}"),
    }
}

/// Read-only accessor
pub struct ReadPortal<T: Value> {
    storage: Arc<Storage<T>>,
    len: usize,
}

impl<T: Value> ReadPortal<T> {
    /// View the first `len` elements of `storage`.
    ///
    /// # Panics
    ///
    /// If `len` exceeds the storage length.
    pub fn new(storage: Arc<Storage<T>>, len: usize) -> Self {
        assert!(len <= storage.len(), "portal length {len} exceeds storage length {}", storage.len());
        Self { storage, len }
    }

    /// A zero-length portal over fresh host storage
    pub fn empty() -> Self {
        Self::new(Arc::new(Storage::host_zeroed(0)), 0)
    }

    #[inline]
    #[track_caller]
    pub fn get(&self, index: Id) -> T {
        self.storage.get(checked(index, self.len))
    }

    pub fn len(&self) -> Id {
        self.len as Id
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.storage.get(i))
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.storage.to_vec(self.len)
    }

    pub fn storage(&self) -> &Arc<Storage<T>> {
        &self.storage
    }

    /// Whether both portals read the same allocation.
    pub fn shares_storage(&self, other: &Arc<Storage<T>>) -> bool {
        Arc::ptr_eq(&self.storage, other)
    }
}

impl<T: Value> Clone for ReadPortal<T> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            len: self.len,
        }
    }
}

impl<T: Value> fmt::Debug for ReadPortal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadPortal")
            .field("len", &self.len)
            .field("space", &self.storage.space())
            .finish()
    }
}

/// Read/write accessor
pub struct WritePortal<T: Value> {
    storage: Arc<Storage<T>>,
    len: usize,
}

impl<T: Value> WritePortal<T> {
    /// # Panics
    ///
    /// If `len` exceeds the storage length.
    pub fn new(storage: Arc<Storage<T>>, len: usize) -> Self {
        assert!(len <= storage.len(), "portal length {len} exceeds storage length {}", storage.len());
        Self { storage, len }
    }

    #[inline]
    #[track_caller]
    pub fn get(&self, index: Id) -> T {
        self.storage.get(checked(index, self.len))
    }

    #[inline]
    #[track_caller]
    pub fn set(&self, index: Id, value: T) {
        self.storage.set(checked(index, self.len), value)
    }

    /// Raw pointer to element `index`, for atomic operations.
    #[inline]
    #[track_caller]
    pub fn cell_ptr(&self, index: Id) -> *mut T {
        self.storage.cell_ptr(checked(index, self.len))
    }

    pub fn len(&self) -> Id {
        self.len as Id
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.storage.to_vec(self.len)
    }

    /// A read portal over the same elements
    pub fn as_read(&self) -> ReadPortal<T> {
        ReadPortal {
            storage: Arc::clone(&self.storage),
            len: self.len,
        }
    }

    pub fn storage(&self) -> &Arc<Storage<T>> {
        &self.storage
    }
}

impl<T: Value> Clone for WritePortal<T> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            len: self.len,
        }
    }
}

impl<T: Value> fmt::Debug for WritePortal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritePortal")
            .field("len", &self.len)
            .field("space", &self.storage.space())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_through_shared_storage() {
        let storage = Arc::new(Storage::from_vec(vec![1_u32, 2, 3, 4]));
        let write = WritePortal::new(Arc::clone(&storage), 3);
        write.set(0, 10);
        let read = write.as_read();
        assert_eq!(read.to_vec(), vec![10, 2, 3]);
        assert_eq!(read.len(), 3);
        assert!(read.shares_storage(&storage));
    }

    #[test]
    fn iter_respects_logical_length() {
        let read = ReadPortal::new(Arc::new(Storage::from_vec(vec![5_i16, 6, 7])), 2);
        assert_eq!(read.iter().collect::<Vec<_>>(), vec![5, 6]);
        assert!(ReadPortal::<i16>::empty().is_empty());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn get_past_logical_length_panics() {
        let read = ReadPortal::new(Arc::new(Storage::from_vec(vec![1_i32, 2, 3])), 2);
        read.get(2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn negative_index_panics() {
        let write = WritePortal::new(Arc::new(Storage::<i32>::host_zeroed(2)), 2);
        write.set(-1, 0);
    }
}
