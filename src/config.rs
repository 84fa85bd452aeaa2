use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// Survivor-selection rule for the greedy dedup scans and the offline batch
/// clusterer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepPolicy {
    Earliest,
    Latest,
    Longest,
}

impl KeepPolicy {
    pub fn parse(s: &str) -> KeepPolicy {
        match s.trim().to_lowercase().as_str() {
            "latest" => KeepPolicy::Latest,
            "longest" => KeepPolicy::Longest,
            _ => KeepPolicy::Earliest,
        }
    }
}

/// Cross-source ordering additionally supports the weight-preferring policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossPolicy {
    Earliest,
    Latest,
    Longest,
    PreferWeightThenEarliest,
}

impl CrossPolicy {
    pub fn parse(s: &str) -> CrossPolicy {
        match s.trim().to_lowercase().as_str() {
            "earliest" => CrossPolicy::Earliest,
            "latest" => CrossPolicy::Latest,
            "longest" => CrossPolicy::Longest,
            _ => CrossPolicy::PreferWeightThenEarliest,
        }
    }
}

/// All engine tunables, read from the environment exactly once at startup.
/// Clustering and classification code never consults the environment itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Similarity / dedup.
    pub jaccard_threshold: f64,
    pub within_hamming: u32,
    pub cross_hamming: u32,
    pub batch_hamming: u32,
    pub within_policy: KeepPolicy,
    pub cross_policy: CrossPolicy,
    pub batch_policy: KeepPolicy,
    pub enable_near_dup_drop: bool,
    pub enable_cross_dup_drop: bool,
    pub batch_global_cap: usize,
    pub max_oracle_calls: usize,

    // Posterior classifier.
    pub hard_override_weight: f64,
    pub confidence_bias: f64,
    pub expertise_bias: f64,

    // Gates.
    pub min_text_len: usize,
    pub ad_score_threshold: i64,
    pub enable_ad_filter: bool,
    pub enable_ignore_gate: bool,

    // Store refreshes.
    pub agg_lookback_days: i64,
    pub ranked_lookback_days: i64,
    pub per_week_cap: i64,

    // Collection window and rendering.
    pub days_back: i64,
    pub timezone: String,
    pub base_feed: String,
    pub site_title: String,

    // Classifier oracle.
    pub use_llm: bool,
    pub text_maxlen: usize,
    pub cache_enabled: bool,
    pub cache_dir: PathBuf,
    pub cache_ttl_hours: u64,
}

fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    env_or(name, "").parse().unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env_or(name, "").parse().unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env_or(name, "").parse().unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        _ => default,
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineConfig {
        let within_hamming = env_i64("SIMHASH_HAMMING_THRESHOLD", 4).max(0) as u32;
        EngineConfig {
            jaccard_threshold: env_f64("JACCARD_TH", 0.62),
            within_hamming,
            cross_hamming: env_i64("CROSS_SIMHASH_HAMMING_THRESHOLD", within_hamming as i64)
                .max(0) as u32,
            batch_hamming: env_i64("BATCH_SIMHASH_HAMMING_THRESHOLD", 8).max(0) as u32,
            within_policy: KeepPolicy::parse(&env_or("NEAR_DUP_KEEP_POLICY", "earliest")),
            cross_policy: CrossPolicy::parse(&env_or(
                "CROSS_KEEP_POLICY",
                "prefer_weight_then_earliest",
            )),
            batch_policy: KeepPolicy::parse(&env_or("BATCH_KEEP_POLICY", "earliest")),
            enable_near_dup_drop: env_bool("ENABLE_NEAR_DUP_DROP", true),
            enable_cross_dup_drop: env_bool("ENABLE_CROSS_SOURCE_DUP_DROP", true),
            batch_global_cap: env_usize("BATCH_GLOBAL_CAP", 400),
            max_oracle_calls: env_usize("MAX_PAIRS", 200),
            hard_override_weight: env_f64("HARD_WEIGHT", 3.0),
            confidence_bias: env_f64("POSTERIOR_CONFIDENCE_BIAS", 0.15),
            expertise_bias: env_f64("POSTERIOR_EXPERTISE_BIAS", 0.12),
            min_text_len: env_usize("MIN_TEXT_LENGTH", 200),
            ad_score_threshold: env_i64("AD_SCORE_THRESHOLD", 5),
            enable_ad_filter: env_bool("ENABLE_AD_SCORE_FILTER", true),
            enable_ignore_gate: env_bool("ENABLE_LLM_IGNORE", true),
            agg_lookback_days: env_i64("AGG_LOOKBACK_DAYS", 60),
            ranked_lookback_days: env_i64("RANKED_LOOKBACK_DAYS", 30),
            per_week_cap: env_i64("PER_WEEK_CAP", 2000),
            days_back: env_i64("DAYS_BACK", 7),
            timezone: env_or("TIMEZONE", "Asia/Shanghai"),
            base_feed: env_or("BASE_FEED", "http://127.0.0.1:8001/feed"),
            site_title: env_or("SITE_TITLE", "行业周报"),
            use_llm: env_bool("USE_LLM", true),
            text_maxlen: env_usize("TEXT_MAXLEN", 1600),
            cache_enabled: env_bool("CACHE_ENABLED", false),
            cache_dir: PathBuf::from(env_or("CACHE_DIR", ".cache")),
            cache_ttl_hours: env_i64("CACHE_TTL_HOURS", 24).max(0) as u64,
        }
    }
}

/// Connection settings for the OpenAI-compatible classifier endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

impl LlmConfig {
    /// Provider selection mirrors the report generator's env contract:
    /// `LLM_PROVIDER=deepseek` prefers the DeepSeek key and base URL,
    /// anything else goes through the OpenAI defaults. A missing key is a
    /// fatal configuration error — raised before any network work.
    pub fn from_env() -> Result<LlmConfig> {
        let provider = env_or("LLM_PROVIDER", "openai").to_lowercase();
        let (api_key, api_base, model) = if provider == "deepseek" {
            (
                env_or("DEEPSEEK_API_KEY", &env_or("OPENAI_API_KEY", "")),
                env_or("OPENAI_BASE_URL", "https://api.deepseek.com"),
                env_or("MODEL", "deepseek-chat"),
            )
        } else {
            (
                env_or("OPENAI_API_KEY", ""),
                env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
                env_or("MODEL", "gpt-4o-mini"),
            )
        };
        if api_key.is_empty() {
            bail!("no API key configured (set DEEPSEEK_API_KEY or OPENAI_API_KEY, or run with USE_LLM=false)");
        }
        Ok(LlmConfig {
            api_base,
            api_key,
            model,
        })
    }
}

/// Declared priors for one source.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SourcePrior {
    pub weight: Option<f64>,
    pub rank: Option<u32>,
    #[serde(default)]
    pub official: bool,
    #[serde(default)]
    pub expertise: Vec<String>,
}

/// Source configuration, loaded once per run from `sources.toml` and
/// immutable thereafter.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub weights: BTreeMap<String, SourcePrior>,
}

/// Weight tier derived from a source's rank when no explicit weight is set.
/// Rank 1 is the most important; from rank 6 on the weight eases down and
/// never goes below 0.95.
pub fn tier_weight(rank: Option<u32>) -> f64 {
    match rank {
        None => 1.0,
        Some(r) if r <= 1 => 1.35,
        Some(2) => 1.30,
        Some(3) => 1.25,
        Some(4) => 1.20,
        Some(5) => 1.15,
        Some(r) => (1.15 - 0.03 * (r as f64 - 5.0)).max(0.95),
    }
}

const WEIGHT_MIN: f64 = 0.5;
const WEIGHT_MAX: f64 = 5.0;

impl SourcesConfig {
    /// Load and validate the source map. An unreadable or empty file halts
    /// the run before any network or classification work happens.
    pub fn load(path: &Path) -> Result<SourcesConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read source configuration {}", path.display()))?;
        let cfg: SourcesConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse source configuration {}", path.display()))?;
        if cfg.weights.is_empty() {
            bail!(
                "source configuration {} contains no sources under [weights]",
                path.display()
            );
        }
        let official = cfg.weights.values().filter(|p| p.official).count();
        info!(
            "Loaded source configuration - sources={}, official={}",
            cfg.weights.len(),
            official
        );
        Ok(cfg)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    /// Effective trust weight and expertise tags for a source. Absent
    /// sources get the neutral defaults; weights are clamped to a sane band.
    pub fn priors_for(&self, source_id: &str) -> (f64, &[String]) {
        match self.weights.get(source_id) {
            Some(p) => {
                let w = p.weight.unwrap_or_else(|| tier_weight(p.rank));
                (w.clamp(WEIGHT_MIN, WEIGHT_MAX), p.expertise.as_slice())
            }
            None => {
                debug!("No priors declared for source - source_id={}", source_id);
                (1.0, &[])
            }
        }
    }

}
