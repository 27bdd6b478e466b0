//! Bounded object cache shared by every repository handle in a pool.
//!
//! Decoded commits and tree entry lists are cached by (repository, hash) so
//! a squashed walk does not decode the same object once per join stage. The
//! cache is invisible to correctness: entries are immutable snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::repository::{CommitData, TreeEntryData};

/// Default cache budget: 512 MiB.
pub const DEFAULT_CACHE_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    repository: String,
    hash: String,
}

#[derive(Clone)]
pub enum CachedObject {
    Commit(Arc<CommitData>),
    Tree(Arc<Vec<TreeEntryData>>),
}

impl CachedObject {
    /// Approximate heap cost in bytes, used for the eviction budget.
    fn cost(&self) -> usize {
        match self {
            CachedObject::Commit(c) => {
                128 + c.message.len() + c.author_name.len() + c.author_email.len() + c.parents.len() * 40
            }
            CachedObject::Tree(entries) => 32 + entries.iter().map(|e| 96 + e.name.len()).sum::<usize>(),
        }
    }
}

struct CacheInner {
    map: HashMap<CacheKey, (CachedObject, u64)>,
    // Recency queue with lazy invalidation: a key is live only under its
    // latest generation.
    order: VecDeque<(CacheKey, u64)>,
    generation: u64,
    cost: usize,
}

/// LRU object cache with a byte budget.
pub struct ObjectCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                generation: 0,
                cost: 0,
            }),
            capacity,
        }
    }

    pub fn get(&self, repository: &str, hash: &str) -> Option<CachedObject> {
        let key = CacheKey {
            repository: repository.to_string(),
            hash: hash.to_string(),
        };
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;
        let obj = match inner.map.get_mut(&key) {
            Some((obj, gen)) => {
                *gen = generation;
                obj.clone()
            }
            None => return None,
        };
        inner.order.push_back((key, generation));
        Some(obj)
    }

    pub fn put(&self, repository: &str, hash: &str, obj: CachedObject) {
        let key = CacheKey {
            repository: repository.to_string(),
            hash: hash.to_string(),
        };
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;
        let cost = obj.cost();
        if let Some((old, _)) = inner.map.insert(key.clone(), (obj, generation)) {
            inner.cost -= old.cost();
        }
        inner.cost += cost;
        inner.order.push_back((key, generation));
        self.evict(&mut inner);
    }

    fn evict(&self, inner: &mut CacheInner) {
        while inner.cost > self.capacity {
            let (key, gen) = match inner.order.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            let live = matches!(inner.map.get(&key), Some((_, g)) if *g == gen);
            if live {
                if let Some((obj, _)) = inner.map.remove(&key) {
                    inner.cost -= obj.cost();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
