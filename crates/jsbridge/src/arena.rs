//! Handle Arena
//!
//! Maps guest handles that crossed into host ownership to stable keys.
//! Each distinct guest object gets at most one entry; the entry holds a
//! strong reference (a pinned handle) for as long as its reference count
//! is non-zero, which keeps the guest collector away from it.
//!
//! The arena is generic over the handle type so that identity is whatever
//! the handle's `Eq`/`Hash` say it is. For QuickJS persistent values that
//! is the object pointer, not value equality.

use std::collections::HashMap;
use std::hash::Hash;

/// Key for an arena entry. Never reused within one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaKey(u64);

impl ArenaKey {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ArenaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry<H> {
    handle: H,
    refs: usize,
}

/// Outcome of [`Arena::release`]
#[derive(Debug)]
pub enum Released<H> {
    /// The count dropped but other holders remain.
    Retained,
    /// The last reference went away; the pinned handle is handed back so the
    /// caller can drop it outside any borrow.
    Freed(H),
    /// Unknown or already freed key.
    Unknown,
}

/// Identity-deduplicating handle registry
pub struct Arena<H> {
    entries: HashMap<ArenaKey, Entry<H>>,
    index: HashMap<H, ArenaKey>,
    next: u64,
}

impl<H: Eq + Hash + Clone> Default for Arena<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Eq + Hash + Clone> Arena<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            index: HashMap::new(),
            next: 1,
        }
    }

    /// Register a handle, or add a reference to the existing entry for the
    /// same underlying object.
    pub fn register(&mut self, handle: H) -> ArenaKey {
        if let Some(&key) = self.index.get(&handle) {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.refs += 1;
                return key;
            }
        }

        let key = ArenaKey(self.next);
        self.next += 1;
        self.index.insert(handle.clone(), key);
        self.entries.insert(key, Entry { handle, refs: 1 });
        key
    }

    /// The pinned handle for a key, or `None` once released or cleared.
    pub fn resolve(&self, key: ArenaKey) -> Option<&H> {
        self.entries.get(&key).map(|entry| &entry.handle)
    }

    /// Drop one reference. Releasing an unknown key is a no-op.
    pub fn release(&mut self, key: ArenaKey) -> Released<H> {
        let Some(entry) = self.entries.get_mut(&key) else {
            return Released::Unknown;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return Released::Retained;
        }

        match self.entries.remove(&key) {
            Some(entry) => {
                self.index.remove(&entry.handle);
                Released::Freed(entry.handle)
            }
            None => Released::Unknown,
        }
    }

    pub fn refs(&self, key: ArenaKey) -> usize {
        self.entries.get(&key).map_or(0, |entry| entry.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry and hand back the pinned handles.
    pub fn drain(&mut self) -> Vec<H> {
        self.index.clear();
        self.entries.drain().map(|(_, entry)| entry.handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_dedups_by_identity() {
        let mut arena = Arena::new();
        let a = arena.register("object-a");
        let b = arena.register("object-b");
        let again = arena.register("object-a");

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.refs(a), 2);
        assert_eq!(arena.resolve(b), Some(&"object-b"));
    }

    #[test]
    fn test_release_counts_down_and_frees() {
        let mut arena = Arena::new();
        let key = arena.register(7u32);
        arena.register(7u32);

        assert!(matches!(arena.release(key), Released::Retained));
        assert_eq!(arena.resolve(key), Some(&7));
        assert!(matches!(arena.release(key), Released::Freed(7)));
        assert_eq!(arena.resolve(key), None);
        assert_ne!(arena.register(7u32), key);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut arena = Arena::new();
        let key = arena.register("x");
        assert!(matches!(arena.release(key), Released::Freed("x")));
        assert!(matches!(arena.release(key), Released::Unknown));
        assert!(matches!(arena.release(key), Released::Unknown));
        assert!(arena.is_empty());
    }

    #[test]
    fn test_keys_not_reused_after_free() {
        let mut arena = Arena::new();
        let first = arena.register("x");
        arena.release(first);
        let second = arena.register("x");
        assert_ne!(first, second);
        assert_eq!(arena.resolve(first), None);
    }

    #[test]
    fn test_drain() {
        let mut arena = Arena::new();
        let key = arena.register(1);
        arena.register(2);
        let mut drained = arena.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(arena.is_empty());
        assert!(matches!(arena.release(key), Released::Unknown));
    }
}
