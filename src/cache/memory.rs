use crate::core::models::RefinedModule;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_MEMORY_BUDGET: usize = 1024 * 1024 * 1024;
pub const DEFAULT_IDLE_EXPIRY: Duration = Duration::from_secs(20 * 60);

#[derive(Debug)]
struct Entry {
    module: Arc<RefinedModule>,
    refcount: usize,
    /// Set by `expire` while referenced; the final release drops instead of
    /// enqueueing.
    doomed: bool,
    /// Stamp of the idle-queue slot that currently owns this entry.
    idle_stamp: u64,
}

/// Reference-counted LRU over refined modules, bounded by an approximate
/// byte budget with idle expiry. Pure data structure; callers lock it.
#[derive(Debug)]
pub struct MemoryCache {
    entries: HashMap<u32, Entry>,
    /// Unreferenced entries in release order: (id, stamp, expiry deadline).
    idle: VecDeque<(u32, u64, Instant)>,
    total_size: usize,
    maximum: usize,
    idle_expiry: Duration,
    stamp: u64,
}

impl MemoryCache {
    pub fn new(maximum: usize, idle_expiry: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            idle: VecDeque::new(),
            total_size: 0,
            maximum,
            idle_expiry,
            stamp: 0,
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts with refcount 1. Oversized artifacts are never cached; the
    /// caller keeps its own `Arc` either way.
    pub fn register(&mut self, id: u32, module: Arc<RefinedModule>) {
        if module.size > self.maximum {
            return;
        }
        if let Some(old) = self.entries.remove(&id) {
            self.total_size -= old.module.size;
        }
        self.total_size += module.size;
        self.entries.insert(
            id,
            Entry {
                module,
                refcount: 1,
                doomed: false,
                idle_stamp: 0,
            },
        );
        self.sweep(Instant::now());
        self.evict_over_budget();
    }

    /// Increments the refcount and returns the artifact.
    pub fn take(&mut self, id: u32) -> Option<Arc<RefinedModule>> {
        let entry = self.entries.get_mut(&id)?;
        entry.refcount += 1;
        // Any idle slot it held is now stale.
        entry.idle_stamp = 0;
        Some(entry.module.clone())
    }

    /// Decrements the refcount; the last release parks the entry on the LRU
    /// tail (or drops it when doomed).
    pub fn release(&mut self, id: u32) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }
        if entry.doomed {
            let removed = self.entries.remove(&id).unwrap();
            self.total_size -= removed.module.size;
            return;
        }
        self.stamp += 1;
        entry.idle_stamp = self.stamp;
        self.idle
            .push_back((id, self.stamp, Instant::now() + self.idle_expiry));
    }

    /// Drops now if unreferenced, otherwise arranges for the final release
    /// to drop.
    pub fn expire(&mut self, id: u32) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.refcount == 0 {
            let removed = self.entries.remove(&id).unwrap();
            self.total_size -= removed.module.size;
        } else {
            entry.doomed = true;
        }
    }

    /// Removes idle entries whose expiry deadline has passed.
    pub fn sweep(&mut self, now: Instant) {
        while let Some((id, stamp, deadline)) = self.idle.front().copied() {
            if deadline > now {
                break;
            }
            self.idle.pop_front();
            self.drop_if_idle_slot(id, stamp);
        }
    }

    fn evict_over_budget(&mut self) {
        while self.total_size > self.maximum {
            let Some((id, stamp, _)) = self.idle.pop_front() else {
                // Everything left is referenced; nothing to evict.
                break;
            };
            self.drop_if_idle_slot(id, stamp);
        }
    }

    /// Drops the entry only when the queue slot is still its live one;
    /// stale slots from a take/release cycle are ignored.
    fn drop_if_idle_slot(&mut self, id: u32, stamp: u64) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if entry.refcount == 0 && entry.idle_stamp == stamp {
            let removed = self.entries.remove(&id).unwrap();
            self.total_size -= removed.module.size;
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_BUDGET, DEFAULT_IDLE_EXPIRY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_of_size(size: usize) -> Arc<RefinedModule> {
        let mut module = RefinedModule {
            content: "x".repeat(size),
            ..Default::default()
        };
        module.compute_size();
        Arc::new(module)
    }

    #[test]
    fn register_take_release() {
        let mut cache = MemoryCache::new(1000, Duration::from_secs(60));
        cache.register(1, module_of_size(10));
        assert_eq!(cache.total_size(), 10);

        let taken = cache.take(1).unwrap();
        assert_eq!(taken.size, 10);
        // refcount 2: registration + take
        cache.release(1);
        cache.release(1);
        // Still cached, parked idle.
        assert!(cache.take(1).is_some());
    }

    #[test]
    fn oversized_entries_are_not_cached() {
        let mut cache = MemoryCache::new(5, Duration::from_secs(60));
        cache.register(1, module_of_size(10));
        assert!(cache.is_empty());
        assert!(cache.take(1).is_none());
    }

    #[test]
    fn budget_evicts_oldest_idle_first() {
        let mut cache = MemoryCache::new(25, Duration::from_secs(60));
        for id in 1..=3u32 {
            cache.register(id, module_of_size(10));
            cache.release(id);
        }
        // Only the oldest idle entry goes to fit 3.
        assert!(cache.take(1).is_none());
        assert!(cache.take(2).is_some());
        assert!(cache.take(3).is_some());
        assert!(cache.total_size() <= 25);
    }

    #[test]
    fn referenced_entries_survive_pressure() {
        let mut cache = MemoryCache::new(15, Duration::from_secs(60));
        cache.register(1, module_of_size(10));
        // Never released: still referenced.
        cache.register(2, module_of_size(10));
        cache.release(2);
        assert!(cache.take(1).is_some());
    }

    #[test]
    fn expire_unreferenced_drops_now() {
        let mut cache = MemoryCache::new(1000, Duration::from_secs(60));
        cache.register(1, module_of_size(10));
        cache.release(1);
        cache.expire(1);
        assert!(cache.take(1).is_none());
        assert_eq!(cache.total_size(), 0);
    }

    #[test]
    fn expire_referenced_drops_on_final_release() {
        let mut cache = MemoryCache::new(1000, Duration::from_secs(60));
        cache.register(1, module_of_size(10));
        cache.expire(1);
        // Registration reference still holds it.
        assert!(cache.take(1).is_some());
        cache.release(1);
        cache.release(1);
        assert!(cache.take(1).is_none());
    }

    #[test]
    fn idle_expiry_sweeps() {
        let mut cache = MemoryCache::new(1000, Duration::ZERO);
        cache.register(1, module_of_size(10));
        cache.release(1);
        cache.sweep(Instant::now() + Duration::from_millis(1));
        assert!(cache.take(1).is_none());
    }

    #[test]
    fn retake_invalidates_idle_slot() {
        let mut cache = MemoryCache::new(1000, Duration::ZERO);
        cache.register(1, module_of_size(10));
        cache.release(1);
        // Back in use before the sweep runs; the stale slot must not drop it.
        let _held = cache.take(1).unwrap();
        cache.sweep(Instant::now() + Duration::from_millis(1));
        assert!(cache.take(1).is_some());
    }

    #[test]
    fn reregister_replaces_size_accounting() {
        let mut cache = MemoryCache::new(1000, Duration::from_secs(60));
        cache.register(1, module_of_size(10));
        cache.register(1, module_of_size(20));
        assert_eq!(cache.total_size(), 20);
        assert_eq!(cache.len(), 1);
    }
}
