//! Bounded path → object-id cache for id-addressed backends.
//!
//! Id-addressed stores need one lookup per path segment to resolve a path.
//! The cache keeps the most recently used resolutions; it lives for one
//! destination session and is never persisted.

use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_CAPACITY: usize = 1024;

struct Slot {
    id: String,
    used: u64,
}

/// Least-recently-used map. Every hit moves the entry to a fresh position in
/// `recency`, so lookups and evictions are O(log n).
pub struct PathCache {
    capacity: usize,
    slots: HashMap<String, Slot>,
    /// Use stamp → path, oldest first.
    recency: BTreeMap<u64, String>,
    clock: u64,
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
        }
    }

    pub fn get(&mut self, path: &str) -> Option<String> {
        let stamp = self.next_stamp();
        let slot = self.slots.get_mut(path)?;
        self.recency.remove(&slot.used);
        slot.used = stamp;
        self.recency.insert(stamp, path.to_string());
        Some(slot.id.clone())
    }

    pub fn insert(&mut self, path: &str, id: &str) {
        let stamp = self.next_stamp();
        let previous = self.slots.insert(path.to_string(), Slot { id: id.to_string(), used: stamp });
        if let Some(previous) = previous {
            self.recency.remove(&previous.used);
        }
        self.recency.insert(stamp, path.to_string());

        while self.slots.len() > self.capacity {
            match self.recency.pop_first() {
                Some((_, oldest)) => {
                    self.slots.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Forget `path` and everything below it.
    pub fn invalidate(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        let recency = &mut self.recency;
        self.slots.retain(|p, slot| {
            let keep = p != path && !p.starts_with(&prefix);
            if !keep {
                recency.remove(&slot.used);
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
