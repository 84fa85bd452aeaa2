use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::KeepPolicy;
use crate::models::MergeRecord;
use crate::similarity::{fingerprint64, hamming64, jaccard, normalize, shingles, DEFAULT_SHINGLE_K};

/// Best-effort semantic confirmation for an ambiguous candidate pair. The
/// clustering algorithm only sees this interface; any failure is treated as
/// "not a duplicate" so both items survive.
#[async_trait]
pub trait DuplicateOracle: Send + Sync {
    async fn confirm(&self, a: &str, b: &str) -> Result<(bool, String)>;
}

/// One entry of an already-rendered collection, prepared for batch
/// clustering.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub uid: String,
    pub title: String,
    pub text: String,
    pub url: String,
    /// Display date fragment; survivor ordering compares these as strings.
    pub date: String,
    pub source_id: String,
    /// The untouched input line, echoed verbatim for survivors.
    pub raw: String,

    norm: String,
    fingerprint: u64,
    shingles: BTreeSet<String>,
}

impl BatchItem {
    pub fn new(
        uid: String,
        title: String,
        text: String,
        url: String,
        date: String,
        source_id: String,
        raw: String,
    ) -> BatchItem {
        let norm = normalize(&title, &text);
        let fingerprint = fingerprint64(&norm);
        let shingles = shingles(&norm, DEFAULT_SHINGLE_K);
        BatchItem {
            uid,
            title,
            text,
            url,
            date,
            source_id,
            raw,
            norm,
            fingerprint,
            shingles,
        }
    }

    fn host(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct BatchParams {
    pub jaccard_threshold: f64,
    pub hamming_threshold: u32,
    /// Candidate pairs must not differ in normalized length by more than this.
    pub max_len_diff: usize,
    /// Below this many items a global all-pairs round backs up host bucketing.
    pub global_cap: usize,
    /// Same host plus at least this much overlap auto-confirms an edge.
    pub strong_jaccard: f64,
    pub max_oracle_calls: usize,
    pub keep_policy: KeepPolicy,
}

impl Default for BatchParams {
    fn default() -> Self {
        BatchParams {
            jaccard_threshold: 0.62,
            hamming_threshold: 8,
            max_len_diff: 200,
            global_cap: 400,
            strong_jaccard: 0.8,
            max_oracle_calls: 200,
            keep_policy: KeepPolicy::Earliest,
        }
    }
}

#[derive(Debug, Default)]
pub struct ClusterOutcome {
    /// Arena indices of the surviving items, ascending.
    pub kept: Vec<usize>,
    pub records: Vec<MergeRecord>,
    pub candidate_pairs: usize,
    pub oracle_calls: usize,
    pub oracle_failures: usize,
}

/// Union-find over arena indices, path-halving find.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> UnionFind {
        UnionFind {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Candidate recall: all pairs inside each URL-host bucket, plus one global
/// all-pairs round when the collection is small enough. A pair survives only
/// if the length gate, the shingle overlap and the fingerprint distance all
/// agree — the conjunction keeps either metric's false positives out.
fn candidate_pairs(items: &[BatchItem], params: &BatchParams) -> Vec<(usize, usize)> {
    let mut raw_pairs: BTreeSet<(usize, usize)> = BTreeSet::new();

    let mut buckets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, it) in items.iter().enumerate() {
        buckets.entry(it.host()).or_default().push(i);
    }
    for idxs in buckets.values() {
        if idxs.len() > 1 {
            for a in 0..idxs.len() {
                for b in a + 1..idxs.len() {
                    raw_pairs.insert((idxs[a], idxs[b]));
                }
            }
        }
    }
    if items.len() <= params.global_cap {
        for a in 0..items.len() {
            for b in a + 1..items.len() {
                raw_pairs.insert((a, b));
            }
        }
    }

    let raw: Vec<(usize, usize)> = raw_pairs.into_iter().collect();
    // The gate is order-independent, so the pair filter is the one stage
    // that may run in parallel; everything downstream stays sequential.
    raw.par_iter()
        .filter(|(a, b)| {
            let x = &items[*a];
            let y = &items[*b];
            let la = x.norm.chars().count() as i64;
            let lb = y.norm.chars().count() as i64;
            if (la - lb).unsigned_abs() as usize > params.max_len_diff {
                return false;
            }
            if jaccard(&x.shingles, &y.shingles) < params.jaccard_threshold {
                return false;
            }
            hamming64(x.fingerprint, y.fingerprint) <= params.hamming_threshold
        })
        .copied()
        .collect()
}

fn clip_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Batch/offline clustering of an already-rendered collection. Candidate
/// pairs become confirmed edges either through the same-host strong rule or
/// through the injected semantic oracle (bounded call budget, fail-open);
/// edges merge transitively via union-find and each cluster keeps one
/// survivor per the keep-policy, recording a merge reason for the rest.
pub async fn cluster_batch(
    items: &[BatchItem],
    params: &BatchParams,
    oracle: Option<&dyn DuplicateOracle>,
) -> ClusterOutcome {
    let pairs = candidate_pairs(items, params);
    debug!(
        "Candidate recall - items={}, pairs={}",
        items.len(),
        pairs.len()
    );

    let mut edges: Vec<(usize, usize, String)> = Vec::new();
    let mut oracle_calls = 0usize;
    let mut oracle_failures = 0usize;

    for &(ia, ib) in &pairs {
        let a = &items[ia];
        let b = &items[ib];
        if !a.host().is_empty()
            && a.host() == b.host()
            && jaccard(&a.shingles, &b.shingles) >= params.strong_jaccard
        {
            edges.push((ia, ib, "same-host high similarity".to_string()));
            continue;
        }
        let Some(oracle) = oracle else { continue };
        if oracle_calls >= params.max_oracle_calls {
            continue;
        }
        oracle_calls += 1;
        let text_a = clip_chars(&format!("{}。{}", a.title, a.text), 500);
        let text_b = clip_chars(&format!("{}。{}", b.title, b.text), 500);
        match oracle.confirm(&text_a, &text_b).await {
            Ok((true, reason)) => {
                let reason = if reason.is_empty() {
                    "oracle confirmed duplicate".to_string()
                } else {
                    reason
                };
                edges.push((ia, ib, reason));
            }
            Ok((false, _)) => {}
            Err(e) => {
                // Fail open: an unreachable or unparseable oracle never
                // merges anything.
                oracle_failures += 1;
                warn!(
                    "Duplicate oracle failed, keeping both - a={}, b={}, error={}",
                    a.uid, b.uid, e
                );
            }
        }
    }

    let mut uf = UnionFind::new(items.len());
    for (ia, ib, _) in &edges {
        uf.union(*ia, *ib);
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..items.len() {
        let root = uf.find(i);
        clusters.entry(root).or_default().push(i);
    }

    let mut kept = Vec::new();
    let mut records = Vec::new();
    for (_root, mut members) in clusters {
        if members.len() == 1 {
            kept.push(members[0]);
            continue;
        }
        match params.keep_policy {
            KeepPolicy::Earliest => members.sort_by(|a, b| items[*a].date.cmp(&items[*b].date)),
            KeepPolicy::Latest => members.sort_by(|a, b| items[*b].date.cmp(&items[*a].date)),
            KeepPolicy::Longest => members.sort_by_key(|i| {
                std::cmp::Reverse(items[*i].norm.chars().count())
            }),
        }
        let keep_idx = members[0];
        kept.push(keep_idx);
        for &i in &members[1..] {
            let reason = edges
                .iter()
                .find(|(a, b, _)| {
                    (*a == keep_idx && *b == i) || (*b == keep_idx && *a == i)
                })
                .map(|(_, _, r)| r.clone())
                .unwrap_or_else(|| "merged via cluster".to_string());
            records.push(MergeRecord {
                kept_uid: items[keep_idx].uid.clone(),
                kept_title: items[keep_idx].title.clone(),
                dropped_uid: items[i].uid.clone(),
                dropped_title: items[i].title.clone(),
                reason,
            });
        }
    }
    kept.sort_unstable();

    info!(
        "Batch clustering - kept={}/{}, edges={}, oracle_calls={}, oracle_failures={}",
        kept.len(),
        items.len(),
        edges.len(),
        oracle_calls,
        oracle_failures
    );

    ClusterOutcome {
        kept,
        records,
        candidate_pairs: pairs.len(),
        oracle_calls,
        oracle_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    const STORY_A: &str =
        "国内某大厂宣布旗下新游戏将于下月正式开启公测并同步推出多项联动活动吸引玩家回流";
    const STORY_B: &str = "海外手游市场第三季度收入统计报告显示头部产品集中度进一步上升";

    fn bi(uid: &str, title: &str, text: &str, url: &str, date: &str) -> BatchItem {
        BatchItem::new(
            uid.to_string(),
            title.to_string(),
            text.to_string(),
            url.to_string(),
            date.to_string(),
            "weekly".to_string(),
            format!("- {}，{}", date, text),
        )
    }

    struct YesOracle;
    #[async_trait]
    impl DuplicateOracle for YesOracle {
        async fn confirm(&self, _a: &str, _b: &str) -> Result<(bool, String)> {
            Ok((true, "同一事件".to_string()))
        }
    }

    struct FailingOracle;
    #[async_trait]
    impl DuplicateOracle for FailingOracle {
        async fn confirm(&self, _a: &str, _b: &str) -> Result<(bool, String)> {
            bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn strong_rule_merges_same_host_copies() {
        let items = vec![
            bi("u1", "新游公测", STORY_A, "https://news.example/a", "09月18日"),
            bi("u2", "新游公测", STORY_A, "https://news.example/b", "09月19日"),
            bi("u3", "市场报告", STORY_B, "https://news.example/c", "09月18日"),
        ];
        let out = cluster_batch(&items, &BatchParams::default(), None).await;
        assert_eq!(out.kept, vec![0, 2]);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].kept_uid, "u1");
        assert_eq!(out.records[0].dropped_uid, "u2");
        assert_eq!(out.records[0].reason, "same-host high similarity");
    }

    #[tokio::test]
    async fn cross_host_pair_needs_the_oracle() {
        let items = vec![
            bi("u1", "新游公测", STORY_A, "https://a.example/1", "09月18日"),
            bi("u2", "新游公测", STORY_A, "https://b.example/1", "09月19日"),
        ];
        // Without an oracle nothing merges.
        let out = cluster_batch(&items, &BatchParams::default(), None).await;
        assert_eq!(out.kept, vec![0, 1]);
        assert!(out.candidate_pairs >= 1);

        // With a confirming oracle the pair merges and carries its reason.
        let out = cluster_batch(&items, &BatchParams::default(), Some(&YesOracle)).await;
        assert_eq!(out.kept, vec![0]);
        assert_eq!(out.oracle_calls, 1);
        assert_eq!(out.records[0].reason, "同一事件");
    }

    #[tokio::test]
    async fn oracle_failure_keeps_both_items() {
        let items = vec![
            bi("u1", "新游公测", STORY_A, "https://a.example/1", "09月18日"),
            bi("u2", "新游公测", STORY_A, "https://b.example/1", "09月19日"),
        ];
        let out = cluster_batch(&items, &BatchParams::default(), Some(&FailingOracle)).await;
        assert_eq!(out.kept, vec![0, 1]);
        assert_eq!(out.oracle_failures, 1);
        assert!(out.records.is_empty());
    }

    #[tokio::test]
    async fn transitive_edges_form_one_cluster() {
        // Three same-host copies: edges (0,1) and (1,2) exist even if (0,2)
        // were missed; union-find still puts all three in one cluster.
        let items = vec![
            bi("u1", "新游公测", STORY_A, "https://news.example/a", "09月17日"),
            bi("u2", "新游公测", STORY_A, "https://news.example/b", "09月18日"),
            bi("u3", "新游公测", STORY_A, "https://news.example/c", "09月19日"),
        ];
        let out = cluster_batch(&items, &BatchParams::default(), None).await;
        assert_eq!(out.kept, vec![0]);
        assert_eq!(out.records.len(), 2);
        // Every item is accounted for exactly once: survivor or record.
        let dropped: BTreeSet<&str> =
            out.records.iter().map(|r| r.dropped_uid.as_str()).collect();
        assert_eq!(dropped, BTreeSet::from(["u2", "u3"]));
    }

    #[tokio::test]
    async fn latest_policy_survivor_is_reproducible() {
        for _ in 0..3 {
            let items = vec![
                bi("u1", "新游公测", STORY_A, "https://news.example/a", "09月17日"),
                bi("u2", "新游公测", STORY_A, "https://news.example/b", "09月19日"),
            ];
            let params = BatchParams {
                keep_policy: KeepPolicy::Latest,
                ..BatchParams::default()
            };
            let out = cluster_batch(&items, &params, None).await;
            assert_eq!(out.kept, vec![1]);
            assert_eq!(out.records[0].kept_uid, "u2");
        }
    }

    #[tokio::test]
    async fn unrelated_texts_are_not_candidates() {
        let items = vec![
            bi("u1", "新游公测", STORY_A, "https://news.example/a", "09月18日"),
            bi("u2", "市场报告", STORY_B, "https://news.example/b", "09月18日"),
        ];
        let out = cluster_batch(&items, &BatchParams::default(), Some(&YesOracle)).await;
        assert_eq!(out.candidate_pairs, 0);
        assert_eq!(out.oracle_calls, 0);
        assert_eq!(out.kept, vec![0, 1]);
    }

    #[tokio::test]
    async fn length_gate_rejects_very_uneven_pairs() {
        let long_tail: String = std::iter::repeat(STORY_B).take(8).collect();
        let padded = format!("{}{}", STORY_A, long_tail);
        let items = vec![
            bi("u1", "新游公测", STORY_A, "https://news.example/a", "09月18日"),
            bi("u2", "新游公测", &padded, "https://news.example/b", "09月18日"),
        ];
        let out = cluster_batch(&items, &BatchParams::default(), None).await;
        assert_eq!(out.candidate_pairs, 0);
        assert_eq!(out.kept, vec![0, 1]);
    }
}
