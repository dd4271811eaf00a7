//! The process-wide prepared-statement cache (spec §3). Shared across every
//! `ClientHandler`, bounded capacity with LRU eviction; eviction is visible
//! to clients only as a synthesized `Unprepared` error (§9 design note), so
//! the eviction policy is correctness-safe by construction.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use bytes::Bytes;
use lru::LruCache;

use crate::protocol::Intent;

/// What the cache remembers about a prepared statement: enough to route a
/// later `EXECUTE` for the same id the way its originating `PREPARE` would
/// have been routed.
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub intent: Intent,
    pub cql: String,
}

/// Maps prepared-query identifiers to their originating prepare context.
/// Multi-reader/multi-writer: a `Mutex`-guarded LRU is sufficient here since
/// entries are small and lookups are not on a latency-critical path
/// shared with the hot forwarding loop (the hot path only touches this
/// cache on `PREPARE` success and `EXECUTE` lookup, both already off the
/// wire-copy fast path).
pub struct PreparedStatementCache {
    entries: Mutex<LruCache<Bytes, PreparedEntry>>,
}

impl PreparedStatementCache {
    pub fn new(capacity: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1) as usize)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Idempotent insert: re-inserting the same id with the same content is
    /// a no-op observationally (§3 invariant: "cache writes are idempotent
    /// for a given id").
    pub fn insert(&self, prepared_id: Bytes, entry: PreparedEntry) {
        self.entries
            .lock()
            .expect("prepared cache mutex poisoned")
            .put(prepared_id, entry);
    }

    /// Looks up the originating prepare context for a given id. Touches LRU
    /// recency on hit.
    pub fn lookup(&self, prepared_id: &[u8]) -> Option<PreparedEntry> {
        self.entries
            .lock()
            .expect("prepared cache mutex poisoned")
            .get(prepared_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("prepared cache mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
