//! Expiring record store: lifetime-aware key-value storage with secondary
//! indexing and callback-driven scans.
//!
//! Every record carries two clocks: a **lifetime** (absolute wall-clock
//! deadline after which the local copy must be purged) and an
//! **expiration** (the relative duration the record may be cached by
//! others, always capped by the remaining lifetime). The store garbage
//! collects on demand; reads filter expired records live so callers never
//! observe a record past its lifetime even between sweeps.
//!
//! Secondary indices map `(index name, value)` pairs to record positions.
//! A record and its index entries are always mutated under the same lock,
//! so concurrent queries never observe a record without its index entries
//! or vice versa.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A stored record: opaque payload plus its two clocks.
#[derive(Clone, Debug)]
pub struct Record {
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Absolute purge deadline in ms since the Unix epoch.
    pub lifetime: u64,
    /// Relative cache-duration cap advertised to other peers, in ms.
    pub expiration: u64,
}

impl Record {
    /// The expiration other peers may be told: the remaining lifetime
    /// capped by the declared expiration. Zero means already expired.
    pub fn effective_expiration(&self, now: u64) -> u64 {
        self.lifetime.saturating_sub(now).min(self.expiration)
    }

    fn is_expired(&self, now: u64) -> bool {
        self.effective_expiration(now) == 0
    }
}

/// Outcome of a successful [`ExpiringStore::put`].
#[derive(Clone, Copy, Debug)]
pub struct PutReceipt {
    /// Position of the record in the store, usable with
    /// [`ExpiringStore::get_at`].
    pub position: u64,
    /// The absolute lifetime actually stored. May exceed the requested
    /// lifetime when an existing record already had a longer one: a put
    /// never shortens a record's life, and callers observe the override
    /// through this field.
    pub lifetime: u64,
}

/// An entry in a named secondary index: `(index name, value)` referencing
/// a set of record positions. Multiple entries may reference the same
/// value when an attribute is multi-valued.
#[derive(Default)]
struct SecondaryIndex {
    /// value -> positions, in value order for deterministic scans.
    entries: BTreeMap<String, BTreeSet<u64>>,
}

struct StoreInner {
    /// key -> (position, record).
    records: HashMap<String, (u64, Record)>,
    /// position -> key, for position-based reads out of index scans.
    positions: HashMap<u64, String>,
    /// index name -> secondary index.
    indices: HashMap<String, SecondaryIndex>,
    /// position -> index entries referencing it, so deletion can unlink
    /// without scanning every index.
    backrefs: HashMap<u64, Vec<(String, String)>>,
    next_position: u64,
}

impl StoreInner {
    fn unlink(&mut self, position: u64) {
        if let Some(refs) = self.backrefs.remove(&position) {
            for (index, value) in refs {
                if let Some(secondary) = self.indices.get_mut(&index) {
                    if let Some(set) = secondary.entries.get_mut(&value) {
                        set.remove(&position);
                        if set.is_empty() {
                            secondary.entries.remove(&value);
                        }
                    }
                }
            }
        }
    }

    fn remove_record(&mut self, key: &str) -> Option<Record> {
        let (position, record) = self.records.remove(key)?;
        self.positions.remove(&position);
        self.unlink(position);
        Some(record)
    }
}

/// Generic per-record lifetime-aware key-value storage with secondary
/// indexing, callback scans, and garbage collection.
///
/// All operations run under a single per-store async mutex. That is the
/// coarse-locking concession the design allows: no partial record/index
/// state is ever observable, at the price of serializing store access.
pub struct ExpiringStore {
    inner: Mutex<StoreInner>,
}

impl Default for ExpiringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiringStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                records: HashMap::new(),
                positions: HashMap::new(),
                indices: HashMap::new(),
                backrefs: HashMap::new(),
                next_position: 1,
            }),
        }
    }

    /// Store a record under `key`, registering it under each
    /// `(index name, value)` pair in `indexables`.
    ///
    /// `lifetime_rel` and `expiration_rel` are relative durations in ms.
    /// Fails with [`StoreError::InvalidArgument`] if the lifetime is zero
    /// or the expiration exceeds the lifetime. When the key already
    /// exists, the stored lifetime is `max(existing, requested)` — a put
    /// never shortens a record's life — and the old index entries are
    /// replaced by the new ones atomically.
    pub async fn put(
        &self,
        key: &str,
        indexables: &[(String, String)],
        payload: Vec<u8>,
        lifetime_rel: u64,
        expiration_rel: u64,
    ) -> Result<PutReceipt, StoreError> {
        if lifetime_rel == 0 {
            return Err(StoreError::InvalidArgument(
                "lifetime must be positive".into(),
            ));
        }
        if expiration_rel > lifetime_rel {
            return Err(StoreError::InvalidArgument(format!(
                "expiration {expiration_rel}ms exceeds lifetime {lifetime_rel}ms"
            )));
        }

        let now = now_ms();
        let requested_lifetime = now.saturating_add(lifetime_rel);

        let mut inner = self.inner.lock().await;

        let existing = inner
            .records
            .get(key)
            .map(|(position, record)| (*position, record.lifetime));
        let (position, lifetime) = match existing {
            Some((position, existing_lifetime)) => {
                // Lifetime monotonicity: an existing longer lifetime wins
                // over a later, shorter request.
                let lifetime = existing_lifetime.max(requested_lifetime);
                if lifetime > requested_lifetime {
                    debug!(
                        key,
                        kept = lifetime,
                        requested = requested_lifetime,
                        "put kept existing longer lifetime"
                    );
                }
                inner.unlink(position);
                (position, lifetime)
            }
            None => {
                let position = inner.next_position;
                inner.next_position += 1;
                (position, requested_lifetime)
            }
        };

        let record = Record {
            payload,
            lifetime,
            expiration: expiration_rel,
        };
        inner.records.insert(key.to_string(), (position, record));
        inner.positions.insert(position, key.to_string());

        let mut refs = Vec::with_capacity(indexables.len());
        for (index, value) in indexables {
            inner
                .indices
                .entry(index.clone())
                .or_default()
                .entries
                .entry(value.clone())
                .or_default()
                .insert(position);
            refs.push((index.clone(), value.clone()));
        }
        inner.backrefs.insert(position, refs);

        Ok(PutReceipt { position, lifetime })
    }

    /// Fetch a live record by key.
    ///
    /// A record observed past its lifetime is removed on the spot and
    /// reported as absent.
    pub async fn get(&self, key: &str) -> Option<Record> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        let found = inner
            .records
            .get(key)
            .map(|(_, record)| (record.is_expired(now), record.clone()));
        match found {
            Some((false, record)) => Some(record),
            Some((true, _)) => {
                debug!(key, "purging expired record observed by get");
                inner.remove_record(key);
                None
            }
            None => None,
        }
    }

    /// Fetch a live record by its store position.
    pub async fn get_at(&self, position: u64) -> Option<(String, Record)> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        let key = inner.positions.get(&position)?.clone();
        let found = inner
            .records
            .get(&key)
            .map(|(_, record)| (record.is_expired(now), record.clone()));
        match found {
            Some((false, record)) => Some((key, record)),
            Some((true, _)) => {
                inner.remove_record(&key);
                None
            }
            None => None,
        }
    }

    /// Remove a record and its index entries.
    pub async fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        inner.remove_record(key);
    }

    /// Apply `visit` to each `(value, position)` pair in `index`, in value
    /// order, until the callback returns `false` or entries run out.
    ///
    /// Entries referencing expired records are skipped (and noted for the
    /// next sweep), so a scan between garbage collections never surfaces
    /// a dead record.
    pub async fn scan<F>(&self, index: &str, mut visit: F)
    where
        F: FnMut(&str, u64) -> bool,
    {
        let now = now_ms();
        let inner = self.inner.lock().await;
        let Some(secondary) = inner.indices.get(index) else {
            return;
        };
        'outer: for (value, positions) in &secondary.entries {
            for position in positions {
                let live = inner
                    .positions
                    .get(position)
                    .and_then(|key| inner.records.get(key))
                    .map(|(_, record)| !record.is_expired(now))
                    .unwrap_or(false);
                if !live {
                    continue;
                }
                if !visit(value, *position) {
                    break 'outer;
                }
            }
        }
    }

    /// Names of all indices that currently hold entries.
    pub async fn index_names(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.indices.keys().cloned().collect()
    }

    /// Number of live records. Expired-but-unswept records are excluded.
    pub async fn len(&self) -> usize {
        let now = now_ms();
        let inner = self.inner.lock().await;
        inner
            .records
            .values()
            .filter(|(_, r)| !r.is_expired(now))
            .count()
    }

    /// Whether the store holds no live records.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of all live record keys.
    pub async fn keys(&self) -> Vec<String> {
        let now = now_ms();
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .filter(|(_, (_, r))| !r.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Sweep every record whose effective expiration has reached zero,
    /// unlinking its index entries. Returns the number of records removed.
    ///
    /// Storage faults during the sweep are logged and skipped per record;
    /// a bad record never aborts the pass.
    pub async fn garbage_collect(&self) -> usize {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        let dead: Vec<String> = inner
            .records
            .iter()
            .filter(|(_, (_, record))| record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for key in dead {
            if inner.remove_record(&key).is_some() {
                removed += 1;
            } else {
                // Key vanished between the collection pass and removal;
                // nothing to do, but worth a trace in case it recurs.
                warn!(%key, "record disappeared during garbage collection");
            }
        }
        if removed > 0 {
            debug!(removed, "garbage collection removed expired records");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3_600_000;

    fn no_index() -> Vec<(String, String)> {
        Vec::new()
    }

    #[tokio::test]
    async fn put_rejects_zero_lifetime() {
        let store = ExpiringStore::new();
        let err = store
            .put("k", &no_index(), b"v".to_vec(), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn put_rejects_expiration_exceeding_lifetime() {
        let store = ExpiringStore::new();
        let err = store
            .put("k", &no_index(), b"v".to_vec(), 100, 200)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn lifetime_never_shortens_regardless_of_order() {
        let store = ExpiringStore::new();
        let long = store
            .put("k", &no_index(), b"v1".to_vec(), 2 * HOUR, HOUR)
            .await
            .unwrap();
        let short = store
            .put("k", &no_index(), b"v2".to_vec(), HOUR, HOUR)
            .await
            .unwrap();
        // The later, shorter request is overridden and the receipt says so.
        assert_eq!(short.lifetime, long.lifetime);

        let record = store.get("k").await.expect("record present");
        assert_eq!(record.lifetime, long.lifetime);
        assert_eq!(record.payload, b"v2");
    }

    #[tokio::test]
    async fn lifetime_extends_when_second_put_is_longer() {
        let store = ExpiringStore::new();
        let short = store
            .put("k", &no_index(), b"v1".to_vec(), HOUR, HOUR)
            .await
            .unwrap();
        let long = store
            .put("k", &no_index(), b"v2".to_vec(), 2 * HOUR, HOUR)
            .await
            .unwrap();
        assert!(long.lifetime > short.lifetime);
    }

    #[tokio::test]
    async fn effective_expiration_is_capped_by_remaining_lifetime() {
        let store = ExpiringStore::new();
        store
            .put("k", &no_index(), b"v".to_vec(), HOUR, HOUR / 2)
            .await
            .unwrap();
        let record = store.get("k").await.unwrap();
        let now = now_ms();
        assert!(record.effective_expiration(now) <= HOUR / 2);
        assert!(record.effective_expiration(now) <= record.lifetime.saturating_sub(now));
    }

    #[tokio::test]
    async fn expired_record_is_absent_before_gc_and_removed_by_get() {
        let store = ExpiringStore::new();
        store
            .put("k", &no_index(), b"v".to_vec(), 1, 1)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(store.get("k").await.is_none());
        // get already purged it; gc finds nothing left to do.
        assert_eq!(store.garbage_collect().await, 0);
    }

    #[tokio::test]
    async fn garbage_collect_removes_expired_and_keeps_live() {
        let store = ExpiringStore::new();
        store
            .put("dead", &no_index(), b"v".to_vec(), 1, 1)
            .await
            .unwrap();
        store
            .put("live", &no_index(), b"v".to_vec(), HOUR, HOUR)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(store.garbage_collect().await, 1);
        assert!(store.get("dead").await.is_none());
        assert!(store.get("live").await.is_some());
    }

    #[tokio::test]
    async fn scan_visits_entries_in_value_order_and_stops_early() {
        let store = ExpiringStore::new();
        for value in ["BRAVO", "ALPHA", "CHARLIE"] {
            store
                .put(
                    &format!("key-{value}"),
                    &[("attr".to_string(), value.to_string())],
                    value.as_bytes().to_vec(),
                    HOUR,
                    HOUR,
                )
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        store
            .scan("attr", |value, _position| {
                seen.push(value.to_string());
                seen.len() < 2
            })
            .await;
        assert_eq!(seen, vec!["ALPHA", "BRAVO"]);
    }

    #[tokio::test]
    async fn scan_skips_expired_entries() {
        let store = ExpiringStore::new();
        store
            .put(
                "dead",
                &[("attr".to_string(), "X".to_string())],
                b"v".to_vec(),
                1,
                1,
            )
            .await
            .unwrap();
        store
            .put(
                "live",
                &[("attr".to_string(), "Y".to_string())],
                b"v".to_vec(),
                HOUR,
                HOUR,
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut seen = Vec::new();
        store
            .scan("attr", |value, _| {
                seen.push(value.to_string());
                true
            })
            .await;
        assert_eq!(seen, vec!["Y"]);
    }

    #[tokio::test]
    async fn delete_unlinks_index_entries() {
        let store = ExpiringStore::new();
        store
            .put(
                "k",
                &[("attr".to_string(), "V".to_string())],
                b"v".to_vec(),
                HOUR,
                HOUR,
            )
            .await
            .unwrap();
        store.delete("k").await;

        let mut seen = 0;
        store
            .scan("attr", |_, _| {
                seen += 1;
                true
            })
            .await;
        assert_eq!(seen, 0);
        assert!(store.get("k").await.is_none());
    }

    #[tokio::test]
    async fn two_attributes_sharing_a_value_do_not_collide() {
        let store = ExpiringStore::new();
        store
            .put(
                "k1",
                &[("ns-a".to_string(), "SAME".to_string())],
                b"a".to_vec(),
                HOUR,
                HOUR,
            )
            .await
            .unwrap();
        store
            .put(
                "k2",
                &[("ns-b".to_string(), "SAME".to_string())],
                b"b".to_vec(),
                HOUR,
                HOUR,
            )
            .await
            .unwrap();

        let mut positions = Vec::new();
        store
            .scan("ns-a", |_, pos| {
                positions.push(pos);
                true
            })
            .await;
        assert_eq!(positions.len(), 1);
        let (key, _) = store.get_at(positions[0]).await.unwrap();
        assert_eq!(key, "k1");
    }
}
