use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{CrossPolicy, KeepPolicy, SourcesConfig};
use crate::models::{Item, MergeRecord};
use crate::similarity::{fingerprint64, hamming64, normalize};

/// Result of one greedy dedup pass: survivors plus an audit record for every
/// dropped near-duplicate.
#[derive(Debug)]
pub struct DedupOutcome {
    pub kept: Vec<Item>,
    pub dropped: Vec<MergeRecord>,
}

/// Precomputed per-item fields the scans sort and compare on. Items are
/// addressed by arena index throughout; membership never relies on object
/// identity.
struct Enriched {
    idx: usize,
    fingerprint: u64,
    published_at: Option<DateTime<Utc>>,
    text_len: usize,
}

fn enrich(items: &[Item], use_body_fallback: bool) -> Vec<Enriched> {
    items
        .iter()
        .enumerate()
        .map(|(idx, it)| {
            let text = if use_body_fallback && it.summary_raw.is_empty() {
                it.body.as_str()
            } else {
                it.summary_raw.as_str()
            };
            Enriched {
                idx,
                fingerprint: fingerprint64(&normalize(&it.title, text)),
                published_at: it.published_at,
                text_len: text.chars().count(),
            }
        })
        .collect()
}

/// Sort key placing missing timestamps last when scanning oldest-first.
fn ts_or_max(ts: Option<DateTime<Utc>>) -> DateTime<Utc> {
    ts.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Sort key placing missing timestamps last when scanning newest-first.
fn ts_or_min(ts: Option<DateTime<Utc>>) -> DateTime<Utc> {
    ts.unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn sort_for_policy(group: &mut [Enriched], policy: KeepPolicy) {
    match policy {
        KeepPolicy::Earliest => group.sort_by_key(|e| ts_or_max(e.published_at)),
        KeepPolicy::Latest => {
            group.sort_by_key(|e| std::cmp::Reverse(ts_or_min(e.published_at)))
        }
        KeepPolicy::Longest => group.sort_by_key(|e| std::cmp::Reverse(e.text_len)),
    }
}

/// Greedy keep/drop scan over an already-sorted group. The scan order IS the
/// policy: an item is dropped the moment its fingerprint sits within
/// `threshold` bits of any already-kept fingerprint.
fn greedy_scan(
    items: &[Item],
    sorted: &[Enriched],
    threshold: u32,
    reason_prefix: &str,
    kept_idx: &mut BTreeSet<usize>,
    records: &mut Vec<MergeRecord>,
) {
    let mut used: Vec<(u64, usize)> = Vec::new();
    for e in sorted {
        let collision = used
            .iter()
            .find(|(fp, _)| hamming64(e.fingerprint, *fp) <= threshold)
            .copied();
        match collision {
            Some((fp, keeper_idx)) => {
                let keeper = &items[keeper_idx];
                let dropped = &items[e.idx];
                records.push(MergeRecord {
                    kept_uid: keeper.uid().unwrap_or_default(),
                    kept_title: keeper.title.clone(),
                    dropped_uid: dropped.uid().unwrap_or_default(),
                    dropped_title: dropped.title.clone(),
                    reason: format!(
                        "{} (hamming={})",
                        reason_prefix,
                        hamming64(e.fingerprint, fp)
                    ),
                });
            }
            None => {
                kept_idx.insert(e.idx);
                used.push((e.fingerprint, e.idx));
            }
        }
    }
}

/// Within-source pass: each source's items are sorted by the keep-policy and
/// greedily scanned; survivors come back in the original input order.
pub fn drop_near_duplicates_within_source(
    items: Vec<Item>,
    threshold: u32,
    policy: KeepPolicy,
) -> DedupOutcome {
    let enriched = enrich(&items, false);

    let mut by_source: BTreeMap<&str, Vec<Enriched>> = BTreeMap::new();
    for e in enriched {
        by_source
            .entry(items[e.idx].source_id.as_str())
            .or_default()
            .push(e);
    }

    let mut kept_idx: BTreeSet<usize> = BTreeSet::new();
    let mut records = Vec::new();

    for (_sid, mut group) in by_source {
        if group.len() <= 1 {
            kept_idx.insert(group[0].idx);
            continue;
        }
        sort_for_policy(&mut group, policy);
        greedy_scan(
            &items,
            &group,
            threshold,
            "near-duplicate within source",
            &mut kept_idx,
            &mut records,
        );
    }

    if !records.is_empty() {
        info!(
            "Within-source dedup - dropped={} (policy={:?}, hamming_threshold={})",
            records.len(),
            policy,
            threshold
        );
    }

    let kept = items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| kept_idx.contains(i))
        .map(|(_, it)| it)
        .collect();
    DedupOutcome {
        kept,
        dropped: records,
    }
}

/// Cross-source pass over the survivors of the within-source pass. The
/// default policy scans higher-trust sources first, so their copy of a story
/// is the one that survives; survivors come back in scan order.
pub fn drop_near_duplicates_across_sources(
    items: Vec<Item>,
    sources: &SourcesConfig,
    threshold: u32,
    policy: CrossPolicy,
) -> DedupOutcome {
    let mut enriched = enrich(&items, true);

    match policy {
        CrossPolicy::Earliest => enriched.sort_by_key(|e| ts_or_max(e.published_at)),
        CrossPolicy::Latest => {
            enriched.sort_by_key(|e| std::cmp::Reverse(ts_or_min(e.published_at)))
        }
        CrossPolicy::Longest => enriched.sort_by_key(|e| std::cmp::Reverse(e.text_len)),
        CrossPolicy::PreferWeightThenEarliest => enriched.sort_by(|a, b| {
            let wa = sources.priors_for(&items[a.idx].source_id).0;
            let wb = sources.priors_for(&items[b.idx].source_id).0;
            wb.partial_cmp(&wa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ts_or_max(a.published_at).cmp(&ts_or_max(b.published_at)))
        }),
    }

    let mut kept_idx: BTreeSet<usize> = BTreeSet::new();
    let mut records = Vec::new();
    greedy_scan(
        &items,
        &enriched,
        threshold,
        "near-duplicate across sources",
        &mut kept_idx,
        &mut records,
    );

    if !records.is_empty() {
        info!(
            "Cross-source dedup - dropped={} (policy={:?}, hamming_threshold={})",
            records.len(),
            policy,
            threshold
        );
    }

    // Survivors in scan order, i.e. the policy's priority order.
    let scan_order: Vec<usize> = enriched
        .iter()
        .map(|e| e.idx)
        .filter(|i| kept_idx.contains(i))
        .collect();
    let mut slots: Vec<Option<Item>> = items.into_iter().map(Some).collect();
    let kept = scan_order
        .into_iter()
        .map(|i| slots[i].take().expect("kept index visited once"))
        .collect();

    DedupOutcome {
        kept,
        dropped: records,
    }
}
