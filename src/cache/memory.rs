use async_trait::async_trait;
use chrono::Utc;
use std::collections::{ HashMap, VecDeque };
use std::sync::Mutex;
use std::sync::atomic::{ AtomicBool, Ordering };

use crate::cache::{ CacheOp, DistributedCache };

/// In-process `DistributedCache` backend. Mirrors the Redis semantics the
/// crate relies on (TTLs, head-first lists, glob deletion) closely enough to
/// run the full service against it in tests and single-node deployments.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry<String>>,
    lists: HashMap<String, Entry<VecDeque<String>>>,
}

struct Entry<T> {
    value: T,
    expires_at: Option<i64>,
}

impl<T> Entry<T> {
    fn expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<u64>) -> Option<i64> {
    ttl.map(|secs| now_ms() + (secs as i64) * 1000)
}

/// Redis-style glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Resolves Redis list indexes (negative counts from the tail) into an
/// inclusive absolute range; `None` when the range selects nothing.
fn resolve_range(start: isize, stop: isize, len: usize) -> Option<(usize, usize)> {
    let len = len as isize;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an unreachable backend: every operation fails soft until
    /// re-enabled. Test hook, not part of the trait.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Drops all state, as a restarted empty backend would.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.strings.clear();
        inner.lists.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn down(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    fn apply(&self, op: &CacheOp) -> bool {
        match op {
            CacheOp::Set { key, value, ttl } => self.set_sync(key, value, *ttl),
            CacheOp::Delete { key } => {
                self.delete_sync(std::slice::from_ref(key));
                true
            }
            CacheOp::ListPush { key, value } => self.list_push_sync(key, value),
            CacheOp::ListTrim { key, start, stop } => self.list_trim_sync(key, *start, *stop),
            CacheOp::Expire { key, ttl } => self.set_ttl_sync(key, *ttl),
        }
    }

    fn set_sync(&self, key: &str, value: &str, ttl: Option<u64>) -> bool {
        let mut inner = self.lock();
        inner.lists.remove(key);
        inner.strings.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: expiry(ttl) }
        );
        true
    }

    fn set_ttl_sync(&self, key: &str, ttl: u64) -> bool {
        let now = now_ms();
        let expires_at = expiry(Some(ttl));
        let mut inner = self.lock();
        if let Some(entry) = inner.strings.get_mut(key) {
            if !entry.expired(now) {
                entry.expires_at = expires_at;
                return true;
            }
        }
        if let Some(entry) = inner.lists.get_mut(key) {
            if !entry.expired(now) {
                entry.expires_at = expires_at;
                return true;
            }
        }
        false
    }

    fn delete_sync(&self, keys: &[String]) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        for key in keys {
            if inner.strings.remove(key).is_some() {
                removed += 1;
            } else if inner.lists.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    fn list_push_sync(&self, key: &str, value: &str) -> bool {
        let mut inner = self.lock();
        let now = now_ms();
        let entry = inner.lists
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: VecDeque::new(), expires_at: None });
        if entry.expired(now) {
            entry.value.clear();
            entry.expires_at = None;
        }
        entry.value.push_front(value.to_string());
        true
    }

    fn list_trim_sync(&self, key: &str, start: isize, stop: isize) -> bool {
        let mut inner = self.lock();
        let now = now_ms();
        let keep = match inner.lists.get(key) {
            None => {
                return true;
            }
            Some(entry) if entry.expired(now) => None,
            Some(entry) => resolve_range(start, stop, entry.value.len()),
        };
        match keep {
            Some((from, to)) => {
                if let Some(entry) = inner.lists.get_mut(key) {
                    entry.value.truncate(to + 1);
                    entry.value.drain(..from);
                }
            }
            None => {
                inner.lists.remove(key);
            }
        }
        true
    }
}

#[async_trait]
impl DistributedCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        if self.down() {
            return None;
        }
        let now = now_ms();
        let mut inner = self.lock();
        let expired = matches!(inner.strings.get(key), Some(entry) if entry.expired(now));
        if expired {
            inner.strings.remove(key);
            return None;
        }
        inner.strings.get(key).map(|entry| entry.value.clone())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> bool {
        if self.down() {
            return false;
        }
        self.set_sync(key, value, ttl)
    }

    async fn set_ttl(&self, key: &str, ttl: u64) -> bool {
        if self.down() {
            return false;
        }
        self.set_ttl_sync(key, ttl)
    }

    async fn delete(&self, keys: &[String]) -> usize {
        if self.down() {
            return 0;
        }
        self.delete_sync(keys)
    }

    async fn delete_matching(&self, pattern: &str) -> usize {
        if self.down() {
            return 0;
        }
        let mut inner = self.lock();
        let string_keys: Vec<String> = inner.strings
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        let list_keys: Vec<String> = inner.lists
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        let mut removed = 0;
        for key in &string_keys {
            if inner.strings.remove(key).is_some() {
                removed += 1;
            }
        }
        for key in &list_keys {
            if inner.lists.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    async fn list_push(&self, key: &str, value: &str) -> bool {
        if self.down() {
            return false;
        }
        self.list_push_sync(key, value)
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Vec<String> {
        if self.down() {
            return Vec::new();
        }
        let now = now_ms();
        let mut inner = self.lock();
        let expired = matches!(inner.lists.get(key), Some(entry) if entry.expired(now));
        if expired {
            inner.lists.remove(key);
            return Vec::new();
        }
        match inner.lists.get(key) {
            Some(entry) => match resolve_range(start, stop, entry.value.len()) {
                Some((from, to)) => entry.value
                    .iter()
                    .skip(from)
                    .take(to - from + 1)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> bool {
        if self.down() {
            return false;
        }
        self.list_trim_sync(key, start, stop)
    }

    async fn pipeline(&self, ops: Vec<CacheOp>) -> Vec<bool> {
        if self.down() {
            return vec![false; ops.len()];
        }
        ops.iter().map(|op| self.apply(op)).collect()
    }

    async fn health_check(&self) -> bool {
        !self.down()
    }
}
