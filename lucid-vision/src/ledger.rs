//! Signal Ledger
//!
//! Append-only, multi-writer store of every signal produced for one image.
//!
//! Keys are hashed into independent shards, each behind its own lock, so
//! concurrent waves appending under different keys do not contend and readers
//! never block writers of keys in other shards. A global sequence number
//! gives a total insertion order across shards.
//!
//! `best_signal` resolutions are memoized per key. A memo entry records the
//! candidate count it was computed from and is discarded on every insert under
//! that key.

use crate::aggregation::{self, AggregationConfig, ConflictReport, Resolution};
use crate::types::{keys, tags, Signal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::trace;

const SHARD_COUNT: usize = 16;

/// Signal plus its global insertion sequence
#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    signal: Arc<Signal>,
}

#[derive(Debug, Clone)]
struct Memo {
    len: usize,
    resolution: Resolution,
}

#[derive(Debug, Default)]
struct Shard {
    entries: RwLock<HashMap<String, Vec<Entry>>>,
    memo: Mutex<HashMap<String, Memo>>,
}

/// Per-image accumulation of all signals
#[derive(Debug)]
pub struct SignalLedger {
    shards: Vec<Shard>,
    seq: AtomicU64,
    contributors: RwLock<BTreeSet<String>>,
    aggregation: Arc<AggregationConfig>,
    content_hash: String,
}

/// Immutable copy of a ledger handed to callers and the result cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// SHA-256 of the raw input bytes (hex)
    pub content_hash: String,
    /// Every signal in insertion order
    pub signals: Vec<Signal>,
    pub contributors: BTreeSet<String>,
    /// Conflicts found when the ledger was finalized
    pub conflicts: Vec<ConflictReport>,
    pub created_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    /// Signals under `key` in insertion order
    pub fn signals_for<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Signal> + 'a {
        self.signals.iter().filter(move |s| s.key == key)
    }

    /// Resolve `key` with the given aggregation settings
    pub fn best_signal(&self, key: &str, config: &AggregationConfig) -> Option<Signal> {
        let candidates: Vec<Arc<Signal>> = self
            .signals_for(key)
            .cloned()
            .map(Arc::new)
            .collect();
        aggregation::resolve(key, &candidates, config).map(|r| Signal::clone(&r.signal))
    }
}

fn shard_index(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

impl SignalLedger {
    pub fn new(content_hash: impl Into<String>, aggregation: Arc<AggregationConfig>) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
            seq: AtomicU64::new(0),
            contributors: RwLock::new(BTreeSet::new()),
            aggregation,
            content_hash: content_hash.into(),
        }
    }

    /// Rebuild a ledger from a snapshot (cache hit path)
    pub fn from_snapshot(snapshot: &LedgerSnapshot, aggregation: Arc<AggregationConfig>) -> Self {
        let ledger = Self::new(snapshot.content_hash.clone(), aggregation);
        for signal in &snapshot.signals {
            ledger.insert(signal.clone());
        }
        ledger
            .contributors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(snapshot.contributors.iter().cloned());
        ledger
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn aggregation(&self) -> &AggregationConfig {
        &self.aggregation
    }

    fn shard(&self, key: &str) -> &Shard {
        &self.shards[shard_index(key)]
    }

    fn insert(&self, signal: Signal) {
        let shard = self.shard(&signal.key);
        let key = signal.key.clone();
        {
            let mut entries = shard.entries.write().unwrap_or_else(PoisonError::into_inner);
            // Sequence is taken under the shard lock so per-key order matches seq order
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            entries.entry(key.clone()).or_default().push(Entry {
                seq,
                signal: Arc::new(signal),
            });
        }
        shard
            .memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    /// Append one signal on behalf of `wave`
    pub fn record(&self, wave: &str, signal: Signal) {
        trace!(wave = %wave, key = %signal.key, confidence = signal.confidence, "Recording signal");
        self.insert(signal);
        self.contributors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(wave.to_string());
    }

    /// Append a wave's full output
    pub fn record_all(&self, wave: &str, signals: impl IntoIterator<Item = Signal>) -> usize {
        let mut count = 0;
        for signal in signals {
            self.insert(signal);
            count += 1;
        }
        self.contributors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(wave.to_string());
        count
    }

    /// Resolve `key` through its configured strategy, with conflict diagnostics
    pub fn resolve(&self, key: &str) -> Option<Resolution> {
        let shard = self.shard(key);
        let entries = shard.entries.read().unwrap_or_else(PoisonError::into_inner);
        let list = entries.get(key)?;

        // The read guard keeps `list` stable while the memo is checked and stored
        let mut memo = shard.memo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = memo.get(key) {
            if cached.len == list.len() {
                return Some(cached.resolution.clone());
            }
        }

        let candidates: Vec<Arc<Signal>> = list.iter().map(|e| Arc::clone(&e.signal)).collect();
        let resolution = aggregation::resolve(key, &candidates, &self.aggregation)?;
        memo.insert(
            key.to_string(),
            Memo {
                len: list.len(),
                resolution: resolution.clone(),
            },
        );
        Some(resolution)
    }

    /// Single best signal for `key`
    pub fn best_signal(&self, key: &str) -> Option<Arc<Signal>> {
        self.resolve(key).map(|r| r.signal)
    }

    /// Numeric value of the best signal for `key`
    pub fn best_f64(&self, key: &str) -> Option<f64> {
        self.best_signal(key).and_then(|s| s.value.as_f64())
    }

    /// Boolean value of the best signal for `key`
    pub fn best_bool(&self, key: &str) -> Option<bool> {
        self.best_signal(key).and_then(|s| s.value.as_bool())
    }

    /// Every candidate under `key`, insertion order
    pub fn all_signals(&self, key: &str) -> Vec<Arc<Signal>> {
        let entries = self
            .shard(key)
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|list| list.iter().map(|e| Arc::clone(&e.signal)).collect())
            .unwrap_or_default()
    }

    /// Every signal carrying `tag`, insertion order
    pub fn signals_by_tag(&self, tag: &str) -> Vec<Arc<Signal>> {
        let mut found: Vec<(u64, Arc<Signal>)> = Vec::new();
        for shard in &self.shards {
            let entries = shard.entries.read().unwrap_or_else(PoisonError::into_inner);
            found.extend(
                entries
                    .values()
                    .flatten()
                    .filter(|e| e.signal.has_tag(tag))
                    .map(|e| (e.seq, Arc::clone(&e.signal))),
            );
        }
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, s)| s).collect()
    }

    pub fn has_signal(&self, key: &str) -> bool {
        self.shard(key)
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|list| !list.is_empty())
    }

    /// Distinct keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .entries
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    /// Names of waves that have contributed at least once
    pub fn contributors(&self) -> BTreeSet<String> {
        self.contributors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Total number of signals
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .entries
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .map(Vec::len)
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current conflicts across all keys
    pub fn conflicts(&self) -> Vec<ConflictReport> {
        self.keys()
            .iter()
            .filter_map(|key| self.resolve(key)?.conflict)
            .collect()
    }

    /// Record one `conflict.unresolved` signal per unresolved conflict and
    /// return every conflict report
    ///
    /// Called once after the last wave so diagnostics are never dropped.
    pub fn finalize(&self) -> Vec<ConflictReport> {
        let conflicts = self.conflicts();
        for report in conflicts.iter().filter(|r| !r.resolved) {
            let record = serde_json::to_value(report).unwrap_or(serde_json::Value::Null);
            let signal = Signal::new(
                keys::CONFLICT_UNRESOLVED,
                crate::types::SignalValue::Record(record),
                0.0,
                "ledger",
            )
            .with_tag(tags::CONFLICT)
            .with_meta("conflict_key", report.key.clone())
            .with_meta("candidates", report.candidates.len());
            self.insert(signal);
        }
        conflicts
    }

    /// Immutable copy of the current contents
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut all: Vec<(u64, Signal)> = Vec::new();
        for shard in &self.shards {
            let entries = shard.entries.read().unwrap_or_else(PoisonError::into_inner);
            all.extend(
                entries
                    .values()
                    .flatten()
                    .map(|e| (e.seq, Signal::clone(&e.signal))),
            );
        }
        all.sort_by_key(|(seq, _)| *seq);

        LedgerSnapshot {
            content_hash: self.content_hash.clone(),
            signals: all.into_iter().map(|(_, s)| s).collect(),
            contributors: self.contributors(),
            conflicts: self.conflicts(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregationStrategy, ConflictPolicy};
    use crate::types::SignalValue;

    fn ledger() -> SignalLedger {
        SignalLedger::new("abc", Arc::new(AggregationConfig::default()))
    }

    #[test]
    fn test_best_signal_highest_confidence() {
        let ledger = ledger();
        ledger.record("a", Signal::new("k", 1.0, 0.3, "a"));
        ledger.record("b", Signal::new("k", 1.0, 0.9, "b"));
        ledger.record("c", Signal::new("k", 1.0, 0.5, "c"));

        assert_eq!(ledger.best_signal("k").unwrap().source, "b");
        assert_eq!(ledger.all_signals("k").len(), 3);
        assert_eq!(
            ledger.contributors().into_iter().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_memo_invalidated_on_insert() {
        let ledger = ledger();
        ledger.record("a", Signal::new("k", 1.0, 0.5, "a"));
        assert_eq!(ledger.best_signal("k").unwrap().source, "a");
        // Second read is served from the memo
        assert_eq!(ledger.best_signal("k").unwrap().source, "a");

        ledger.record("b", Signal::new("k", 1.0, 0.9, "b"));
        assert_eq!(ledger.best_signal("k").unwrap().source, "b");
    }

    #[test]
    fn test_signals_by_tag_in_insertion_order() {
        let ledger = ledger();
        ledger.record("w", Signal::new("color.mean_luma", 0.5, 1.0, "w").with_tag("color"));
        ledger.record("w", Signal::new("quality.sharpness", 0.5, 1.0, "w").with_tag("quality"));
        ledger.record("w", Signal::new("color.flat_ratio", 0.1, 1.0, "w").with_tag("color"));

        let color: Vec<String> = ledger
            .signals_by_tag("color")
            .iter()
            .map(|s| s.key.clone())
            .collect();
        assert_eq!(color, vec!["color.mean_luma", "color.flat_ratio"]);
        assert!(ledger.signals_by_tag("ocr").is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let ledger = ledger();
        ledger.record("w1", Signal::new("a.b", true, 1.0, "w1").with_meta("n", 3i64));
        ledger.record("w2", Signal::new("c.d", "text", 0.4, "w2").with_tag("text"));

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.signals.len(), 2);
        assert_eq!(snapshot.signals[0].key, "a.b");

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);

        let restored = SignalLedger::from_snapshot(&back, Arc::new(AggregationConfig::default()));
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.contributors(), ledger.contributors());
        assert_eq!(restored.snapshot().signals, snapshot.signals);
    }

    #[test]
    fn test_finalize_records_unresolved_conflicts() {
        let ledger = ledger(); // default policy: Unspecified
        ledger.record("a", Signal::new("content.label", "cat", 0.8, "a"));
        ledger.record("b", Signal::new("content.label", "dog", 0.78, "b"));

        let conflicts = ledger.finalize();
        assert_eq!(conflicts.len(), 1);
        assert!(!conflicts[0].resolved);

        let unresolved = ledger.all_signals(keys::CONFLICT_UNRESOLVED);
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].confidence, 0.0);
        assert!(unresolved[0].has_tag(tags::CONFLICT));
    }

    #[test]
    fn test_finalize_with_policy_adds_nothing() {
        let config = AggregationConfig {
            conflict_policy: ConflictPolicy::TrustNewer,
            ..AggregationConfig::default()
        };
        let ledger = SignalLedger::new("abc", Arc::new(config));
        ledger.record("a", Signal::new("content.label", "cat", 0.8, "a"));
        ledger.record("b", Signal::new("content.label", "dog", 0.78, "b"));

        let conflicts = ledger.finalize();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].resolved);
        assert!(!ledger.has_signal(keys::CONFLICT_UNRESOLVED));
        assert_eq!(ledger.best_signal("content.label").unwrap().source, "b");
    }

    #[test]
    fn test_concurrent_appends_are_all_visible() {
        let mut config = AggregationConfig::default();
        config.set_strategy("*", AggregationStrategy::Collect);
        let ledger = Arc::new(SignalLedger::new("abc", Arc::new(config)));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("k.{}", i % 5);
                        ledger.record(
                            &format!("w{t}"),
                            Signal::new(key, SignalValue::Number(i as f64), 0.5, format!("w{t}")),
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(ledger.len(), 400);
        assert_eq!(ledger.keys().len(), 5);
        assert_eq!(ledger.contributors().len(), 8);
        assert_eq!(ledger.all_signals("k.0").len(), 80);
    }
}
