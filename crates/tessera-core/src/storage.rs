use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// Storage — The backing buffer of an array
//
// Storage is a shared, lockable, contiguous f32 buffer. Cloning a Storage
// clones the handle, not the data: every NDArray view and every pending
// kernel that touches the buffer holds one, so the memory is released only
// when the last array and the last queued operation are gone.
//
// The engine guarantees that a writer never runs concurrently with any other
// operation on the same resource, so the lock is never contended by kernels.
// It exists so that the type system can see that, and so that a caller
// reading materialized data cannot observe a half-written buffer.

/// Shared handle to a contiguous f32 buffer.
#[derive(Clone, Debug, Default)]
pub struct Storage {
    data: Arc<RwLock<Vec<f32>>>,
}

impl Storage {
    /// Allocate a zero-filled buffer of `len` elements.
    pub fn zeros(len: usize) -> Self {
        Self::from_vec(vec![0.0; len])
    }

    /// Take ownership of an existing buffer.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Storage {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared read access. Recursive, so one kernel may hold two guards on
    /// the same buffer (`x * x`).
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.data.read_recursive()
    }

    /// Exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.data.write()
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.read().clone()
    }

    /// Whether two handles refer to the same buffer.
    pub fn ptr_eq(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
