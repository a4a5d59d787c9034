//! SRDI index: maps (primary key, attribute, value) triples to the set of
//! peers claiming to hold a matching resource, each claim with its own
//! expiration.
//!
//! The index is a summary directory, not the resource itself: a query
//! answers "which peers say they have this", never the resource payload.
//! Claims are upserted per peer, filtered live on every query, masked
//! immediately when a peer is removed, and physically swept by
//! [`SrdiIndex::garbage_collect`].
//!
//! Attribute values are stored uppercased so case-insensitive matching is
//! a plain string comparison. The index namespace is the concatenation of
//! primary key and attribute; record-store keys prepend that namespace to
//! the value so two attributes sharing a value string never collide.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::id::PeerId;
use crate::store::{now_ms, ExpiringStore};

/// One peer's claim inside an index record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SrdiPeerEntry {
    /// The peer claiming to hold the resource.
    pub peer: PeerId,
    /// Absolute expiration of the claim in ms since the Unix epoch.
    pub expiration: u64,
}

/// Stored payload of one index record: the claims for a single
/// (namespace, value) pair, plus the pair itself so sweeps can rewrite
/// the record without losing its index entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SrdiRecord {
    index: String,
    value: String,
    entries: Vec<SrdiPeerEntry>,
}

/// The distributed-index summary table for locally indexed resources.
pub struct SrdiIndex {
    store: ExpiringStore,
    /// Peers masked from query results and scheduled for physical removal
    /// at the next garbage-collection pass.
    removed: Mutex<HashSet<PeerId>>,
    /// Serializes read-modify-write cycles on index records; queries run
    /// without it.
    write_gate: Mutex<()>,
}

impl Default for SrdiIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn namespace(primary_key: &str, attribute: &str) -> String {
    format!("{primary_key}{attribute}")
}

fn record_key(ns: &str, value_upper: &str) -> String {
    format!("{ns}{value_upper}")
}

/// Case-insensitive wildcard match against an uppercased value.
///
/// `*x` matches a suffix, `x*` a prefix, `*x*` a substring, and a bare
/// pattern matches exactly. The pattern must already be uppercased.
fn value_matches(pattern_upper: &str, value_upper: &str) -> bool {
    let leading = pattern_upper.starts_with('*');
    let trailing = pattern_upper.ends_with('*') && pattern_upper.len() > 1;
    match (leading, trailing) {
        (true, true) => {
            let needle = &pattern_upper[1..pattern_upper.len() - 1];
            needle.is_empty() || value_upper.contains(needle)
        }
        (true, false) => value_upper.ends_with(&pattern_upper[1..]),
        (false, true) => value_upper.starts_with(&pattern_upper[..pattern_upper.len() - 1]),
        (false, false) => value_upper == pattern_upper,
    }
}

impl SrdiIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            store: ExpiringStore::new(),
            removed: Mutex::new(HashSet::new()),
            write_gate: Mutex::new(()),
        }
    }

    /// Upsert a claim: peer `peer` holds a resource with `value` under
    /// `(primary_key, attribute)` for another `expiration_rel` ms.
    ///
    /// A claim already present for the same peer is replaced, bumping its
    /// expiration. An `add` for a peer that was marked for removal clears
    /// the mark first — the peer reappeared, so its pending purge must not
    /// swallow the fresh claim.
    ///
    /// Returns the absolute expiration stored for the claim.
    pub async fn add(
        &self,
        primary_key: &str,
        attribute: &str,
        value: &str,
        peer: PeerId,
        expiration_rel: u64,
    ) -> Result<u64, StoreError> {
        if expiration_rel == 0 {
            return Err(StoreError::InvalidArgument(
                "expiration must be positive".into(),
            ));
        }

        {
            let mut removed = self.removed.lock().await;
            if removed.remove(&peer) {
                debug!(peer = %hex::encode(&peer[..6]), "peer reappeared; cleared removal mark");
            }
        }

        let ns = namespace(primary_key, attribute);
        let value_upper = value.to_uppercase();
        let key = record_key(&ns, &value_upper);
        let now = now_ms();
        let expiration_abs = now.saturating_add(expiration_rel);

        let _gate = self.write_gate.lock().await;
        let mut entries = self
            .load_record(&key)
            .await
            .map(|r| r.entries)
            .unwrap_or_default();
        entries.retain(|e| e.peer != peer && e.expiration > now);
        entries.push(SrdiPeerEntry {
            peer,
            expiration: expiration_abs,
        });

        let record = SrdiRecord {
            index: ns.clone(),
            value: value_upper.clone(),
            entries,
        };
        let payload = serde_json::to_vec(&record)
            .map_err(|err| StoreError::Storage(format!("serializing index record: {err}")))?;
        self.store
            .put(
                &key,
                &[(ns, value_upper)],
                payload,
                expiration_rel,
                expiration_rel,
            )
            .await?;
        Ok(expiration_abs)
    }

    /// Query for peers claiming a resource matching `value` under
    /// `(primary_key, attribute)`, bounded to `threshold` results.
    ///
    /// `value` supports the wildcard forms documented on the module; all
    /// matching is case-insensitive. Expired claims and removal-marked
    /// peers are filtered out even before garbage collection runs. The
    /// result preserves index order and is deduplicated.
    pub async fn query(
        &self,
        primary_key: &str,
        attribute: &str,
        value: &str,
        threshold: usize,
    ) -> Vec<PeerId> {
        let ns = namespace(primary_key, attribute);
        let pattern = value.to_uppercase();

        let mut positions = Vec::new();
        self.store
            .scan(&ns, |candidate, position| {
                if value_matches(&pattern, candidate) {
                    positions.push(position);
                }
                true
            })
            .await;

        self.collect_peers(&positions, threshold).await
    }

    /// Blind query: peers with any claim under `primary_key`, across all
    /// attributes, bounded to `threshold` results.
    pub async fn query_any(&self, primary_key: &str, threshold: usize) -> Vec<PeerId> {
        let mut positions = Vec::new();
        for index in self.store.index_names().await {
            if !index.starts_with(primary_key) {
                continue;
            }
            self.store
                .scan(&index, |_, position| {
                    positions.push(position);
                    true
                })
                .await;
        }
        self.collect_peers(&positions, threshold).await
    }

    /// Mask `peer` from all future query results immediately and schedule
    /// its claims for physical removal at the next garbage collection.
    pub async fn remove(&self, peer: PeerId) {
        let mut removed = self.removed.lock().await;
        removed.insert(peer);
    }

    /// Physically sweep claims that are expired or whose peer is marked
    /// for removal. Records left without claims are deleted. The removal
    /// mask is cleared afterward (only of the peers this pass observed, so
    /// a concurrent `remove` is not lost).
    pub async fn garbage_collect(&self) {
        let _gate = self.write_gate.lock().await;
        let marked: HashSet<PeerId> = {
            let removed = self.removed.lock().await;
            removed.clone()
        };
        let now = now_ms();

        for key in self.store.keys().await {
            let Some(record) = self.load_record(&key).await else {
                continue;
            };
            let kept: Vec<SrdiPeerEntry> = record
                .entries
                .iter()
                .filter(|e| e.expiration > now && !marked.contains(&e.peer))
                .cloned()
                .collect();

            if kept.len() == record.entries.len() {
                continue;
            }
            if kept.is_empty() {
                self.store.delete(&key).await;
                continue;
            }

            let remaining = kept
                .iter()
                .map(|e| e.expiration.saturating_sub(now))
                .max()
                .unwrap_or(0);
            if remaining == 0 {
                self.store.delete(&key).await;
                continue;
            }
            let rewritten = SrdiRecord {
                index: record.index.clone(),
                value: record.value.clone(),
                entries: kept,
            };
            match serde_json::to_vec(&rewritten) {
                Ok(payload) => {
                    if let Err(err) = self
                        .store
                        .put(
                            &key,
                            &[(record.index, record.value)],
                            payload,
                            remaining,
                            remaining,
                        )
                        .await
                    {
                        warn!(%key, %err, "failed to rewrite index record during gc");
                    }
                }
                Err(err) => warn!(%key, %err, "failed to serialize index record during gc"),
            }
        }

        {
            let mut removed = self.removed.lock().await;
            for peer in &marked {
                removed.remove(peer);
            }
        }
        self.store.garbage_collect().await;
    }

    /// Total number of live claims across all records.
    pub async fn entry_count(&self) -> usize {
        let now = now_ms();
        let marked: HashSet<PeerId> = {
            let removed = self.removed.lock().await;
            removed.clone()
        };
        let mut count = 0;
        for key in self.store.keys().await {
            if let Some(record) = self.load_record(&key).await {
                count += record
                    .entries
                    .iter()
                    .filter(|e| e.expiration > now && !marked.contains(&e.peer))
                    .count();
            }
        }
        count
    }

    async fn load_record(&self, key: &str) -> Option<SrdiRecord> {
        let record = self.store.get(key).await?;
        match serde_json::from_slice(&record.payload) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                // A corrupt record is treated as absent; the next write or
                // sweep replaces it.
                warn!(key, %err, "discarding unreadable index record");
                None
            }
        }
    }

    async fn collect_peers(&self, positions: &[u64], threshold: usize) -> Vec<PeerId> {
        let marked: HashSet<PeerId> = {
            let removed = self.removed.lock().await;
            removed.clone()
        };
        let now = now_ms();

        let mut peers = Vec::new();
        let mut seen: HashSet<PeerId> = HashSet::new();
        'outer: for position in positions {
            let Some((_, stored)) = self.store.get_at(*position).await else {
                continue;
            };
            let record: SrdiRecord = match serde_json::from_slice(&stored.payload) {
                Ok(record) => record,
                Err(_) => continue,
            };
            for entry in record.entries {
                if entry.expiration <= now || marked.contains(&entry.peer) {
                    continue;
                }
                if seen.insert(entry.peer) {
                    peers.push(entry.peer);
                    if peers.len() >= threshold {
                        break 'outer;
                    }
                }
            }
        }
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> PeerId {
        let mut id = [0u8; 32];
        id[0] = byte;
        id
    }

    const HOUR: u64 = 3_600_000;

    #[tokio::test]
    async fn add_then_query_exact_is_case_insensitive() {
        let index = SrdiIndex::new();
        index.add("res", "color", "Red", peer(1), HOUR).await.unwrap();

        assert_eq!(index.query("res", "color", "red", 10).await, vec![peer(1)]);
        assert_eq!(index.query("res", "color", "RED", 10).await, vec![peer(1)]);
        assert!(index.query("res", "color", "blue", 10).await.is_empty());
    }

    #[tokio::test]
    async fn add_is_idempotent_per_peer() {
        let index = SrdiIndex::new();
        index.add("res", "name", "x", peer(1), HOUR).await.unwrap();
        index.add("res", "name", "x", peer(1), HOUR).await.unwrap();

        assert_eq!(index.query("res", "name", "x", 10).await, vec![peer(1)]);
        assert_eq!(index.entry_count().await, 1);
    }

    #[tokio::test]
    async fn zero_expiration_is_rejected() {
        let index = SrdiIndex::new();
        let err = index.add("res", "name", "x", peer(1), 0).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn suffix_wildcard_matches_ends_with() {
        let index = SrdiIndex::new();
        index.add("res", "color", "red", peer(1), HOUR).await.unwrap();
        index.add("res", "color", "bed", peer(2), HOUR).await.unwrap();
        index.add("res", "color", "reds", peer(3), HOUR).await.unwrap();

        let mut found = index.query("res", "color", "*ed", 10).await;
        found.sort();
        let mut expected = vec![peer(1), peer(2)];
        expected.sort();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn prefix_and_contains_wildcards() {
        let index = SrdiIndex::new();
        index.add("res", "name", "alpha", peer(1), HOUR).await.unwrap();
        index.add("res", "name", "beta", peer(2), HOUR).await.unwrap();
        index.add("res", "name", "alphabet", peer(3), HOUR).await.unwrap();

        let mut prefixed = index.query("res", "name", "alph*", 10).await;
        prefixed.sort();
        assert_eq!(prefixed, {
            let mut v = vec![peer(1), peer(3)];
            v.sort();
            v
        });

        let mut containing = index.query("res", "name", "*lph*", 10).await;
        containing.sort();
        assert_eq!(containing, {
            let mut v = vec![peer(1), peer(3)];
            v.sort();
            v
        });
    }

    #[tokio::test]
    async fn threshold_bounds_results() {
        let index = SrdiIndex::new();
        for b in 1..=5 {
            index.add("res", "kind", "thing", peer(b), HOUR).await.unwrap();
        }
        assert_eq!(index.query("res", "kind", "thing", 2).await.len(), 2);
    }

    #[tokio::test]
    async fn blind_query_spans_attributes() {
        let index = SrdiIndex::new();
        index.add("res", "color", "red", peer(1), HOUR).await.unwrap();
        index.add("res", "size", "large", peer(2), HOUR).await.unwrap();
        index.add("other", "color", "red", peer(3), HOUR).await.unwrap();

        let mut found = index.query_any("res", 10).await;
        found.sort();
        assert_eq!(found, {
            let mut v = vec![peer(1), peer(2)];
            v.sort();
            v
        });
    }

    #[tokio::test]
    async fn removed_peer_is_masked_before_gc_and_purged_after() {
        let index = SrdiIndex::new();
        index.add("res", "name", "x", peer(1), HOUR).await.unwrap();
        index.add("res", "name", "x", peer(2), HOUR).await.unwrap();

        index.remove(peer(1)).await;
        assert_eq!(index.query("res", "name", "x", 10).await, vec![peer(2)]);

        index.garbage_collect().await;
        assert_eq!(index.query("res", "name", "x", 10).await, vec![peer(2)]);
        assert_eq!(index.entry_count().await, 1);
    }

    #[tokio::test]
    async fn removal_mask_is_cleared_after_gc() {
        let index = SrdiIndex::new();
        index.add("res", "name", "x", peer(1), HOUR).await.unwrap();
        index.remove(peer(1)).await;
        index.garbage_collect().await;

        // After the sweep the mask is gone, so a fresh claim is visible.
        index.add("res", "name", "x", peer(1), HOUR).await.unwrap();
        assert_eq!(index.query("res", "name", "x", 10).await, vec![peer(1)]);
    }

    #[tokio::test]
    async fn reappearing_peer_survives_pending_removal() {
        let index = SrdiIndex::new();
        index.add("res", "name", "x", peer(1), HOUR).await.unwrap();
        index.remove(peer(1)).await;
        // Peer reconnects and republishes before the sweep runs.
        index.add("res", "name", "x", peer(1), HOUR).await.unwrap();

        index.garbage_collect().await;
        assert_eq!(index.query("res", "name", "x", 10).await, vec![peer(1)]);
    }

    #[tokio::test]
    async fn expired_claim_is_filtered_live_and_swept_by_gc() {
        let index = SrdiIndex::new();
        index.add("res", "name", "x", peer(1), 1).await.unwrap();
        index.add("res", "name", "y", peer(2), HOUR).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(index.query("res", "name", "x", 10).await.is_empty());
        index.garbage_collect().await;
        assert!(index.query("res", "name", "x", 10).await.is_empty());
        assert_eq!(index.query("res", "name", "y", 10).await, vec![peer(2)]);
    }

    #[tokio::test]
    async fn gc_rewrite_preserves_queryability_of_survivors() {
        let index = SrdiIndex::new();
        index.add("res", "name", "x", peer(1), HOUR).await.unwrap();
        index.add("res", "name", "x", peer(2), HOUR).await.unwrap();
        index.remove(peer(1)).await;
        index.garbage_collect().await;

        // The record was rewritten without peer 1; peer 2 must still be
        // reachable through the secondary index.
        assert_eq!(index.query("res", "name", "x", 10).await, vec![peer(2)]);
        assert_eq!(index.query("res", "name", "*X*", 10).await, vec![peer(2)]);
    }

    #[tokio::test]
    async fn repeated_add_bumps_expiration() {
        let index = SrdiIndex::new();
        let first = index.add("res", "name", "x", peer(1), HOUR).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = index.add("res", "name", "x", peer(1), HOUR).await.unwrap();
        assert!(second >= first);
    }

    #[test]
    fn wildcard_semantics() {
        assert!(value_matches("*ED", "RED"));
        assert!(value_matches("*ED", "BED"));
        assert!(!value_matches("*ED", "REDS"));
        assert!(value_matches("RE*", "REDS"));
        assert!(!value_matches("RE*", "BED"));
        assert!(value_matches("*E*", "BED"));
        assert!(value_matches("RED", "RED"));
        assert!(!value_matches("RED", "REDS"));
    }
}
