//! Signal aggregation and conflict resolution
//!
//! When several waves emit under the same key, the ledger resolves them to one
//! signal with a strategy chosen per key pattern. Contradicting values of
//! similar confidence are settled by a single global [`ConflictPolicy`]; with no
//! policy the conflict is reported as unresolved instead of silently picked.

use crate::types::{Confidence, Signal, SignalValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source name used for synthesized (aggregated) signals
pub const AGGREGATE_SOURCE: &str = "aggregate";

/// How to reduce many signals under one key to one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Max confidence, ties broken by most recent
    #[default]
    HighestConfidence,
    /// Last inserted
    MostRecent,
    /// Confidence-weighted mean of numeric values
    WeightedAverage,
    /// Mode of values, ties broken by aggregate confidence
    MajorityVote,
    /// All candidates as one record; the caller aggregates
    Collect,
}

/// Global rule for genuinely contradicting values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    TrustNewer,
    TrustHigherConfidence,
    /// No policy: conflicts surface as `conflict.unresolved`
    #[default]
    Unspecified,
}

/// Key-pattern → strategy mapping plus conflict policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Exact keys, `prefix.*` globs or `*`
    pub strategies: BTreeMap<String, AggregationStrategy>,
    pub default_strategy: AggregationStrategy,
    pub conflict_policy: ConflictPolicy,
    /// Confidences within this distance of the leader count as "similar"
    pub conflict_margin: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            strategies: BTreeMap::new(),
            default_strategy: AggregationStrategy::HighestConfidence,
            conflict_policy: ConflictPolicy::Unspecified,
            conflict_margin: 0.10,
        }
    }
}

impl AggregationConfig {
    pub fn set_strategy(&mut self, pattern: impl Into<String>, strategy: AggregationStrategy) {
        self.strategies.insert(pattern.into(), strategy);
    }

    /// Strategy for a concrete key: exact match, then the longest matching
    /// `prefix.*` glob, then `*`, then the default.
    pub fn strategy_for(&self, key: &str) -> AggregationStrategy {
        if let Some(strategy) = self.strategies.get(key) {
            return *strategy;
        }

        let glob = self
            .strategies
            .iter()
            .filter_map(|(pattern, strategy)| {
                let prefix = pattern.strip_suffix(".*")?;
                let matches = key
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'));
                matches.then_some((prefix.len(), *strategy))
            })
            .max_by_key(|(len, _)| *len);

        if let Some((_, strategy)) = glob {
            return strategy;
        }

        self.strategies
            .get("*")
            .copied()
            .unwrap_or(self.default_strategy)
    }
}

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCandidate {
    pub source: String,
    pub value: String,
    pub confidence: Confidence,
}

/// Diagnostic for contradicting values under one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub key: String,
    pub candidates: Vec<ConflictCandidate>,
    pub policy: ConflictPolicy,
    /// False when no policy decided the outcome
    pub resolved: bool,
    pub chosen_source: String,
    /// Normalized Levenshtein similarity of the two leading text values
    pub similarity: Option<f64>,
}

/// Outcome of resolving one key
#[derive(Debug, Clone)]
pub struct Resolution {
    pub signal: Arc<Signal>,
    pub strategy: AggregationStrategy,
    pub conflict: Option<ConflictReport>,
}

/// Resolve insertion-ordered candidates for `key`
///
/// Returns `None` only for an empty candidate list.
pub fn resolve(
    key: &str,
    candidates: &[Arc<Signal>],
    config: &AggregationConfig,
) -> Option<Resolution> {
    if candidates.is_empty() {
        return None;
    }
    let strategy = config.strategy_for(key);

    let (signal, conflict) = match strategy {
        AggregationStrategy::HighestConfidence => highest_confidence(key, candidates, config),
        AggregationStrategy::MostRecent => (most_recent(candidates), None),
        AggregationStrategy::WeightedAverage => (weighted_average(key, candidates), None),
        AggregationStrategy::MajorityVote => majority_vote(key, candidates, config),
        AggregationStrategy::Collect => (collect(key, candidates), None),
    };

    if let Some(report) = &conflict {
        if report.resolved {
            debug!(
                key = %key,
                policy = ?report.policy,
                chosen = %report.chosen_source,
                "Conflict resolved by policy"
            );
        } else {
            warn!(
                key = %key,
                candidates = report.candidates.len(),
                "Conflict unresolved: no conflict policy configured"
            );
        }
    }

    Some(Resolution {
        signal,
        strategy,
        conflict,
    })
}

fn most_recent(candidates: &[Arc<Signal>]) -> Arc<Signal> {
    Arc::clone(&candidates[candidates.len() - 1])
}

/// Index of max confidence; later entries win ties
fn leader_index(candidates: &[Arc<Signal>]) -> usize {
    let mut best = 0;
    for (i, s) in candidates.iter().enumerate().skip(1) {
        if s.confidence >= candidates[best].confidence {
            best = i;
        }
    }
    best
}

fn highest_confidence(
    key: &str,
    candidates: &[Arc<Signal>],
    config: &AggregationConfig,
) -> (Arc<Signal>, Option<ConflictReport>) {
    let leader = leader_index(candidates);
    let best = &candidates[leader];

    let contenders: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(i, s)| {
            *i != leader
                && s.value != best.value
                && s.confidence >= best.confidence - config.conflict_margin
        })
        .map(|(i, _)| i)
        .collect();

    if contenders.is_empty() {
        return (Arc::clone(best), None);
    }

    let mut group = contenders;
    group.push(leader);
    group.sort_unstable();

    let chosen = match config.conflict_policy {
        ConflictPolicy::TrustHigherConfidence | ConflictPolicy::Unspecified => leader,
        ConflictPolicy::TrustNewer => group[group.len() - 1],
    };

    settle(key, candidates, &group, chosen, config.conflict_policy)
}

fn majority_vote(
    key: &str,
    candidates: &[Arc<Signal>],
    config: &AggregationConfig,
) -> (Arc<Signal>, Option<ConflictReport>) {
    struct Bucket<'a> {
        value: &'a SignalValue,
        count: usize,
        total_confidence: f64,
        members: Vec<usize>,
    }

    let mut buckets: Vec<Bucket> = Vec::new();
    for (i, s) in candidates.iter().enumerate() {
        match buckets.iter_mut().find(|b| *b.value == s.value) {
            Some(bucket) => {
                bucket.count += 1;
                bucket.total_confidence += s.confidence;
                bucket.members.push(i);
            }
            None => buckets.push(Bucket {
                value: &s.value,
                count: 1,
                total_confidence: s.confidence,
                members: vec![i],
            }),
        }
    }

    fn last_member(b: &Bucket<'_>) -> usize {
        b.members[b.members.len() - 1]
    }

    let winner = buckets
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.count
                .cmp(&b.count)
                .then(
                    a.total_confidence
                        .partial_cmp(&b.total_confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(last_member(a).cmp(&last_member(b)))
        })
        .map(|(i, _)| i)
        .unwrap_or(0);

    let winning = &buckets[winner];
    let tied: Vec<usize> = buckets
        .iter()
        .enumerate()
        .filter(|(i, b)| {
            *i != winner
                && b.count == winning.count
                && b.total_confidence >= winning.total_confidence - config.conflict_margin
        })
        .map(|(i, _)| i)
        .collect();

    let representative = last_member(winning);
    if tied.is_empty() {
        return (Arc::clone(&candidates[representative]), None);
    }

    // One representative per tied bucket, compared like single candidates
    let mut group: Vec<usize> = tied.iter().map(|&b| last_member(&buckets[b])).collect();
    group.push(representative);
    group.sort_unstable();

    let chosen = match config.conflict_policy {
        ConflictPolicy::TrustHigherConfidence | ConflictPolicy::Unspecified => representative,
        ConflictPolicy::TrustNewer => group[group.len() - 1],
    };

    settle(key, candidates, &group, chosen, config.conflict_policy)
}

/// Build the conflict report and final signal for a contested key
fn settle(
    key: &str,
    candidates: &[Arc<Signal>],
    group: &[usize],
    chosen: usize,
    policy: ConflictPolicy,
) -> (Arc<Signal>, Option<ConflictReport>) {
    let chosen_signal = &candidates[chosen];
    let resolved = policy != ConflictPolicy::Unspecified;

    let similarity = {
        let mut texts = group
            .iter()
            .rev()
            .filter_map(|&i| candidates[i].value.as_text());
        match (texts.next(), texts.next()) {
            (Some(a), Some(b)) => Some(strsim::normalized_levenshtein(a, b)),
            _ => None,
        }
    };

    let report = ConflictReport {
        key: key.to_string(),
        candidates: group
            .iter()
            .map(|&i| ConflictCandidate {
                source: candidates[i].source.clone(),
                value: candidates[i].value.display_value(),
                confidence: candidates[i].confidence,
            })
            .collect(),
        policy,
        resolved,
        chosen_source: chosen_signal.source.clone(),
        similarity,
    };

    let signal = if resolved {
        Arc::clone(chosen_signal)
    } else {
        // Surface as a low-confidence answer rather than an authoritative one
        let mut degraded = Signal::clone(chosen_signal);
        degraded.confidence *= 0.5;
        let degraded = degraded
            .with_meta("conflict", true)
            .with_meta("conflict_policy", "unspecified");
        Arc::new(degraded)
    };

    (signal, Some(report))
}

fn weighted_average(key: &str, candidates: &[Arc<Signal>]) -> Arc<Signal> {
    if candidates.len() == 1 {
        return Arc::clone(&candidates[0]);
    }

    let numbers: Option<Vec<(f64, f64)>> = candidates
        .iter()
        .map(|s| s.value.as_f64().map(|v| (v, s.confidence)))
        .collect();

    let Some(numbers) = numbers else {
        debug!(key = %key, "Non-numeric candidate, weighted average falls back to most recent");
        return most_recent(candidates);
    };

    let weight_sum: f64 = numbers.iter().map(|(_, c)| c).sum();
    let (value, confidence) = if weight_sum > 0.0 {
        (
            numbers.iter().map(|(v, c)| v * c).sum::<f64>() / weight_sum,
            numbers.iter().map(|(_, c)| c * c).sum::<f64>() / weight_sum,
        )
    } else {
        (
            numbers.iter().map(|(v, _)| v).sum::<f64>() / numbers.len() as f64,
            0.0,
        )
    };

    Arc::new(synthesized(key, SignalValue::Number(value), confidence, candidates, "weighted_average"))
}

fn collect(key: &str, candidates: &[Arc<Signal>]) -> Arc<Signal> {
    let values: Vec<serde_json::Value> = candidates
        .iter()
        .map(|s| {
            serde_json::json!({
                "source": s.source,
                "value": s.value.to_json(),
                "confidence": s.confidence,
            })
        })
        .collect();
    let confidence = candidates
        .iter()
        .map(|s| s.confidence)
        .fold(0.0, f64::max);

    Arc::new(synthesized(
        key,
        SignalValue::Record(serde_json::Value::Array(values)),
        confidence,
        candidates,
        "collect",
    ))
}

fn synthesized(
    key: &str,
    value: SignalValue,
    confidence: Confidence,
    candidates: &[Arc<Signal>],
    method: &str,
) -> Signal {
    let sources: Vec<&str> = candidates.iter().map(|s| s.source.as_str()).collect();
    Signal::new(key, value, confidence, AGGREGATE_SOURCE)
        .with_tags(candidates.iter().flat_map(|s| s.tags.iter().cloned()))
        .with_meta("aggregation", method)
        .with_meta("contributors", sources.join(","))
        .with_meta("count", candidates.len())
}
