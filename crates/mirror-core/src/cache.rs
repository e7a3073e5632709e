//! Small time-bounded cache for expensive lookups.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use anyhow::Result;

/// How long cached identity records stay valid. Users can change their
/// email address on the remote service, so entries must expire; five
/// minutes is a guess with no data behind it, chosen small enough that a
/// stale address self-corrects quickly.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A map whose entries expire after a fixed TTL.
///
/// Interior mutability keeps lookup call sites read-only. The cache is
/// process-local and unsynchronized: safe under the single-threaded
/// sequential sync model, not safe to share across threads.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RefCell<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RefCell::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key` if still fresh, otherwise compute
    /// it with `fetch` and cache the result. Errors are not cached.
    pub fn lookup(&self, key: &K, fetch: impl FnOnce() -> Result<V>) -> Result<V> {
        if let Some((inserted, value)) = self.entries.borrow().get(key) {
            if inserted.elapsed() < self.ttl {
                return Ok(value.clone());
            }
        }
        let value = fetch()?;
        self.entries
            .borrow_mut()
            .insert(key.clone(), (Instant::now(), value.clone()));
        Ok(value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for TtlCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
