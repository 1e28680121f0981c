use std::collections::{ HashMap, VecDeque };
use std::sync::Mutex;

use crate::models::Conversation;

/// Process-local conversation cache. Bounded, evicts oldest-inserted first,
/// guarded by a single mutex. No TTL: entries live at most as long as the
/// process and are invalidated explicitly on writes and deletes.
pub struct LocalCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Conversation>,
    // Insertion order, oldest first. Kept in step with the map, or removals
    // would leave it growing without bound.
    order: VecDeque<String>,
}

impl LocalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.lock().map.get(id).cloned()
    }

    pub fn put(&self, conversation: Conversation) {
        let mut inner = self.lock();
        let id = conversation.id.clone();
        if inner.map.insert(id.clone(), conversation).is_some() {
            // Replacement keeps the original insertion position.
            return;
        }
        while inner.map.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(id);
    }

    pub fn remove(&self, id: &str) -> Option<Conversation> {
        let mut inner = self.lock();
        let removed = inner.map.remove(id);
        if removed.is_some() {
            inner.order.retain(|queued| queued != id);
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            owner: "owner-1".to_string(),
            title: "New Conversation".to_string(),
            parent_id: None,
            created_at: 0,
            updated_at: 0,
            inherit_context: false,
            depth: 0,
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache = LocalCache::new(3);
        for id in ["a", "b", "c", "d"] {
            cache.put(conversation(id));
        }
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn replacement_does_not_grow_or_evict() {
        let cache = LocalCache::new(2);
        cache.put(conversation("a"));
        cache.put(conversation("b"));
        let mut updated = conversation("a");
        updated.title = "renamed".to_string();
        cache.put(updated);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").map(|c| c.title).as_deref(), Some("renamed"));
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn eviction_targets_the_oldest_live_entry() {
        let cache = LocalCache::new(2);
        cache.put(conversation("a"));
        cache.put(conversation("b"));
        cache.remove("a");
        cache.put(conversation("c"));
        cache.put(conversation("d"));
        // "a" was already gone; "b" is the oldest live entry.
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
    }

    #[test]
    fn put_remove_churn_leaves_no_residue() {
        let cache = LocalCache::new(4);
        for i in 0..64 {
            let id = format!("c{}", i);
            cache.put(conversation(&id));
            assert!(cache.remove(&id).is_some());
        }
        assert!(cache.is_empty());
        assert!(cache.lock().order.is_empty());
    }
}
