use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use xxhash_rust::xxh3::xxh3_64;

/// Default shingle width. Similarity operates on character n-grams, so the
/// same width works for Han text and Latin text alike.
pub const DEFAULT_SHINGLE_K: usize = 8;

static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static PAREN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"（.*?）|\(.*?\)").unwrap());
// Fixed punctuation class, ASCII plus the common CJK marks. Everything in it
// becomes a space; Han characters pass through untouched.
static PUNCT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[\s~!@#$%^&*()_+=\[\]{}|;:'",.<>/?，。！、；：‘’“”…（）【】—％？·\-]+"#).unwrap()
});

/// Canonical text representation for similarity: markup stripped, whitespace
/// collapsed, parenthetical asides removed, lower-cased, punctuation class
/// removed. Deterministic and locale-stable; no word segmentation.
pub fn normalize(title: &str, text: &str) -> String {
    let s: String = format!("{} {}", title, text).nfc().collect();
    let s = BR_RE.replace_all(&s, " ");
    let s = TAG_RE.replace_all(&s, " ");
    let s = WS_RE.replace_all(&s, " ");
    let s = PAREN_RE.replace_all(&s, " ");
    let s = s.to_lowercase();
    let s = PUNCT_RE.replace_all(&s, " ");
    WS_RE.replace_all(&s, " ").trim().to_string()
}

/// Sliding character n-grams of width `k` over the whitespace-stripped
/// string. A string no longer than `k` yields itself as the only shingle;
/// empty input yields the empty set.
pub fn shingles(s: &str, k: usize) -> BTreeSet<String> {
    let stripped: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.is_empty() {
        return BTreeSet::new();
    }
    if stripped.len() <= k {
        return BTreeSet::from([stripped.iter().collect()]);
    }
    stripped
        .windows(k)
        .map(|w| w.iter().collect::<String>())
        .collect()
}

/// Shingle overlap in [0, 1]; defined as 0 when either set is empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    if inter == 0 {
        return 0.0;
    }
    inter as f64 / a.union(b).count() as f64
}

/// 64-bit locality-sensitive fingerprint over overlapping 2-character
/// tokens: each token's frequency is added to or subtracted from 64 weight
/// accumulators according to the bits of its stable hash; output bit i is
/// set iff accumulator i ends positive. Collisions are expected — this is a
/// similarity hash, not a cryptographic one.
pub fn fingerprint64(s: &str) -> u64 {
    let chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        return 0;
    }
    let mut counts: HashMap<String, i64> = HashMap::new();
    if chars.len() < 2 {
        counts.insert(chars.iter().collect(), 1);
    } else {
        for w in chars.windows(2) {
            *counts.entry(w.iter().collect()).or_insert(0) += 1;
        }
    }
    let mut v = [0i64; 64];
    for (tok, weight) in &counts {
        let h = xxh3_64(tok.as_bytes());
        for (i, acc) in v.iter_mut().enumerate() {
            if (h >> i) & 1 == 1 {
                *acc += weight;
            } else {
                *acc -= weight;
            }
        }
    }
    let mut out = 0u64;
    for (i, acc) in v.iter().enumerate() {
        if *acc > 0 {
            out |= 1 << i;
        }
    }
    out
}

pub fn hamming64(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}
