//! Collection type aliases that switch between gxhash and std collections
//! based on feature flags. The path interner and the reverse-loader entry
//! maps sit on hot lookup paths; systems with AES-NI/SSE2 get the faster
//! hasher, everything else falls back to the standard library.

#[cfg(feature = "gxhash")]
pub use gxhash::{HashMap, HashMapExt, HashSet, HashSetExt};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::{HashMap, HashSet};

/// Extension trait for creating HashMap instances
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Creates a new HashMap with default capacity
    fn new() -> Self;

    /// Creates a new HashMap with specified capacity
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for HashMap<K, V> {
    fn new() -> Self {
        HashMap::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity(capacity)
    }
}

/// Extension trait for creating HashSet instances
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Creates a new HashSet with default capacity
    fn new() -> Self;

    /// Creates a new HashSet with specified capacity
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for HashSet<T> {
    fn new() -> Self {
        HashSet::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashSet::with_capacity(capacity)
    }
}
