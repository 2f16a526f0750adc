use std::collections::HashMap;

use tessera_core::TaskKey;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: usize,
    generation: u64,
}

/// Live futures per key, as held by one client.
///
/// Each hold is tagged with the generation of the entry it joined. When a
/// key is cancelled or the cluster restarts the entry goes away, so
/// releases from futures created before that are ignored.
#[derive(Debug, Default)]
pub struct RefTable {
    entries: HashMap<TaskKey, Entry>,
    next_generation: u64,
}

impl RefTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference. Returns the generation the caller must release with.
    pub fn acquire(&mut self, key: &TaskKey) -> u64 {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.count += 1;
            return entry.generation;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(
            key.clone(),
            Entry {
                count: 1,
                generation,
            },
        );
        generation
    }

    /// Add a reference to an existing hold, as when cloning a future.
    /// Returns false if that hold is gone.
    pub fn retain(&mut self, key: &TaskKey, generation: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.count += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop a reference. Returns true if it was the last one.
    pub fn release(&mut self, key: &TaskKey, generation: u64) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.generation != generation {
            return false;
        }
        entry.count = entry.count.saturating_sub(1);
        if entry.count == 0 {
            self.entries.remove(key);
            return true;
        }
        false
    }

    /// Drop every reference to `key` at once.
    pub fn forget(&mut self, key: &TaskKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Whether a hold taken at `generation` is still in effect.
    pub fn is_live(&self, key: &TaskKey, generation: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.generation == generation)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn count(&self, key: &TaskKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.count)
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_release_is_reported_once() {
        let mut refs = RefTable::new();
        let key = TaskKey::from("a");
        let g1 = refs.acquire(&key);
        let g2 = refs.acquire(&key);
        assert_eq!(g1, g2);
        assert_eq!(refs.count(&key), 2);

        assert!(!refs.release(&key, g1));
        assert!(refs.release(&key, g2));
        assert!(!refs.contains(&key));
        assert!(!refs.release(&key, g2));
    }

    #[test]
    fn releases_from_before_a_cancel_are_ignored() {
        let mut refs = RefTable::new();
        let key = TaskKey::from("a");
        let old = refs.acquire(&key);
        assert!(refs.forget(&key));

        let new = refs.acquire(&key);
        assert_ne!(old, new);
        assert!(!refs.release(&key, old));
        assert!(!refs.is_live(&key, old));
        assert!(refs.is_live(&key, new));
        assert_eq!(refs.count(&key), 1);
        assert!(!refs.retain(&key, old));
        assert!(refs.retain(&key, new));
        assert_eq!(refs.count(&key), 2);
    }

    #[test]
    fn clear_drops_everything() {
        let mut refs = RefTable::new();
        let g = refs.acquire(&TaskKey::from("a"));
        refs.acquire(&TaskKey::from("b"));
        refs.clear();
        assert!(refs.keys().is_empty());
        assert!(!refs.release(&TaskKey::from("a"), g));
    }
}
