use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cluster::DuplicateOracle;
use crate::config::LlmConfig;
use crate::models::{Category, Confidence, PlatformType, Region};
use crate::textnorm::fallback_summarize;

/// Raw label space of the classifier oracle: the four categories plus the
/// gatekeeper's "irrelevant" verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    News,
    Product,
    Market,
    Method,
    Ignore,
}

impl Label {
    pub fn category(self) -> Option<Category> {
        match self {
            Label::News => Some(Category::News),
            Label::Product => Some(Category::Product),
            Label::Market => Some(Category::Market),
            Label::Method => Some(Category::Method),
            Label::Ignore => None,
        }
    }
}

/// Validated result of one classification call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub label: Label,
    pub region: Region,
    pub summary: String,
    pub confidence: Confidence,
    pub tags: Vec<String>,
    pub reason: String,
    pub platform_type: PlatformType,
    pub game_type: String,
}

/// External classification oracle. Implementations must be safe to call
/// concurrently; the pipeline fans per-item calls out in small batches.
#[async_trait]
pub trait ClassifierOracle: Send + Sync {
    async fn classify(
        &self,
        title: &str,
        body: &str,
        source_id: &str,
        prior_note: &str,
    ) -> Result<Verdict>;
}

const MARKET_TAG: &str = "市场数据";

fn haystack(title: &str, body: &str) -> String {
    format!("{} {}", title, body).to_lowercase()
}

/// Keyword platform inference, used when the oracle returns unknown.
pub fn infer_platform(title: &str, body: &str) -> PlatformType {
    let t = haystack(title, body);
    const MOBILE: &[&str] = &[
        "ios", "android", "手游", "mobile", "taptap", "app store", "google play", "测试服手游",
    ];
    const PC: &[&str] = &["steam", "epic", "pc 版", "pc版", "windows", "macos", "mac os", "mac"];
    const CONSOLE: &[&str] = &[
        "switch", "ns版", "ns 版", "ps5", "ps4", "playstation", "xbox", "主机版",
    ];
    if MOBILE.iter().any(|k| t.contains(k)) {
        return PlatformType::Mobile;
    }
    if PC.iter().any(|k| t.contains(k)) {
        return PlatformType::Pc;
    }
    if CONSOLE.iter().any(|k| t.contains(k)) {
        return PlatformType::Console;
    }
    PlatformType::Unknown
}

/// Deterministic keyword classification: the fail-soft substitute when the
/// oracle is disabled, unreachable, or keeps returning garbage.
pub fn fallback_verdict(title: &str, body: &str) -> Verdict {
    let t = haystack(title, body);
    const NEWS: &[&str] = &[
        "政策", "合规", "规则", "调整", "发布", "更新", "报告", "榜单", "隐私", "税", "抽成",
        "分成", "dma", "数据", "趋势",
    ];
    const PRODUCT: &[&str] = &[
        "玩法", "版本", "上线", "新作", "demo", "评测", "测评", "分析", "定位",
    ];
    const CN: &[&str] = &[
        "中国", "国内", "广州", "上海", "北京", "字节", "腾讯", "米哈游", "taptap",
    ];
    const OVERSEAS: &[&str] = &[
        "overseas", "欧美", "美国", "欧洲", "日本", "韩国", "全球", "海外", "google", "apple",
        "steam",
    ];

    let label = if NEWS.iter().any(|k| t.contains(k)) {
        Label::News
    } else if PRODUCT.iter().any(|k| t.contains(k)) {
        Label::Product
    } else {
        Label::Method
    };
    let region = if CN.iter().any(|k| t.contains(k)) {
        Region::Cn
    } else if OVERSEAS.iter().any(|k| t.contains(k)) {
        Region::Overseas
    } else {
        Region::None
    };

    Verdict {
        label,
        region,
        summary: fallback_summarize(body, 60, 90),
        confidence: Confidence {
            category: 0.55,
            region: 0.5,
        },
        tags: Vec::new(),
        reason: String::new(),
        platform_type: infer_platform(title, body),
        game_type: String::new(),
    }
}

/// Bounded-retry wrapper: up to `max_attempts` oracle calls, then the
/// deterministic fallback. Returns whether the fallback was substituted for
/// a failing oracle (a disabled oracle is not a failure).
pub async fn classify_with_fallback(
    oracle: Option<&dyn ClassifierOracle>,
    title: &str,
    body: &str,
    source_id: &str,
    prior_note: &str,
    max_attempts: usize,
) -> (Verdict, bool) {
    let Some(oracle) = oracle else {
        return (fallback_verdict(title, body), false);
    };
    for attempt in 1..=max_attempts.max(1) {
        match oracle.classify(title, body, source_id, prior_note).await {
            Ok(v) => return (v, false),
            Err(e) => {
                warn!(
                    "Classifier oracle failed - attempt={}/{}, source_id={}, error={}",
                    attempt, max_attempts, source_id, e
                );
            }
        }
    }
    (fallback_verdict(title, body), true)
}

// =========================================================================
// OpenAI-compatible client
// =========================================================================

/// Minimal chat-completions client against any OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    cfg: LlmConfig,
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> Result<LlmClient> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build LLM HTTP client")?;
        Ok(LlmClient { http, cfg })
    }

    pub async fn chat(
        &self,
        system: &str,
        user: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String> {
        let start = std::time::Instant::now();
        debug!("LLM call starting - prompt_length={} chars", user.chars().count());

        let url = format!(
            "{}/chat/completions",
            self.cfg.api_base.trim_end_matches('/')
        );
        let body = json!({
            "model": self.cfg.model,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("request failed for {}", url))?
            .error_for_status()
            .with_context(|| format!("HTTP error for {}", url))?;
        let payload: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("decoding JSON for {}", url))?;
        let answer = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("no message content in completion response"))?
            .trim()
            .to_string();

        info!(
            "LLM call completed - duration={:.2}s, response_length={} chars",
            start.elapsed().as_secs_f32(),
            answer.chars().count()
        );
        Ok(answer)
    }
}

/// Cut a model answer down to the outermost JSON object. Models love to wrap
/// the payload in prose or code fences.
pub fn extract_json(s: &str) -> &str {
    match (s.find('{'), s.rfind('}')) {
        (Some(first), Some(last)) if last > first => &s[first..=last],
        _ => s,
    }
}

// =========================================================================
// LLM-backed classifier
// =========================================================================

/// Loosely-typed payload as the model emits it; every field is optional and
/// validated into a `Verdict` at the boundary.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    category: Option<String>,
    region: Option<String>,
    summary: Option<String>,
    confidence: Option<Confidence>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    reason: String,
    platform_type: Option<serde_json::Value>,
    game_type: Option<String>,
}

/// Validate a raw model answer into a `Verdict`. Unknown categories map to
/// market when a market-data tag is present, else to method; everything else
/// gets an explicit default. Malformed JSON is an error — the caller falls
/// back.
pub fn parse_verdict(answer: &str, enable_ignore: bool, title: &str, body: &str) -> Result<Verdict> {
    let raw: RawVerdict = serde_json::from_str(extract_json(answer))
        .context("classifier answer is not the expected JSON object")?;

    let cat = raw.category.unwrap_or_default().trim().to_lowercase();
    let label = match cat.as_str() {
        "news" => Label::News,
        "product" => Label::Product,
        "market" => Label::Market,
        "method" => Label::Method,
        "ignore" if enable_ignore => Label::Ignore,
        _ => {
            if raw.tags.iter().any(|t| t == MARKET_TAG) {
                Label::Market
            } else {
                Label::Method
            }
        }
    };

    let region = Region::parse(&raw.region.unwrap_or_default());

    let mut summary = raw.summary.unwrap_or_default().trim().to_string();
    summary = summary
        .trim_matches(|c| matches!(c, '“' | '”' | '"' | '\''))
        .to_string();

    let platform_type = raw
        .platform_type
        .as_ref()
        .and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
        .filter(|p| (0..=3).contains(p))
        .map(PlatformType::from_code)
        .unwrap_or(PlatformType::Unknown);
    let platform_type = if platform_type == PlatformType::Unknown {
        infer_platform(title, body)
    } else {
        platform_type
    };

    let game_type = if label == Label::Product && platform_type == PlatformType::Mobile {
        raw.game_type.unwrap_or_default().trim().to_string()
    } else {
        String::new()
    };

    Ok(Verdict {
        label,
        region,
        summary,
        confidence: raw.confidence.unwrap_or_default(),
        tags: raw.tags,
        reason: raw.reason,
        platform_type,
        game_type,
    })
}

fn classify_prompt(title: &str, body: &str, prior_note: &str, enable_ignore: bool, maxlen: usize) -> String {
    let cls_line = if enable_ignore {
        "   - category: 'news'(要闻速览) | 'product'(产品分析) | 'market'(产品/市场数据) | 'method'(方法论学习) | 'ignore'(无关/招聘/广告/活动/声明)\n"
    } else {
        "   - category: 'news' | 'product' | 'market' | 'method'\n"
    };
    let clipped: String = body.chars().take(maxlen).collect();
    let prior = if prior_note.is_empty() {
        String::new()
    } else {
        format!("{}\n", prior_note)
    };
    format!(
        "请阅读以下文章，完成两个任务并只输出一个 JSON：\n\
         1) 分类：\n\
         {cls_line}\
            - region: 'cn'(国内) | 'overseas'(海外) | 'none'(不适用/不确定)\n\
            - platform_type: 1=移动、2=PC、3=主机、0=未知\n\
         2) 摘要：\n\
            - 输出一句中文行业资讯，≤200字；市场数据类需体现来源。\n\
         3) 游戏类型（仅当 category='product' 且 platform_type=1 时输出）：\n\
            - game_type：如 SLG、卡牌 等；无法判断给空串。\n\
         请严格输出 JSON。\n\
         {prior}\
         标题：{title}\n\
         正文：{clipped}\n"
    )
}

/// Classifier oracle backed by an OpenAI-compatible model, with an optional
/// on-disk verdict cache.
pub struct LlmClassifier {
    client: LlmClient,
    enable_ignore: bool,
    text_maxlen: usize,
    cache: Option<VerdictCache>,
}

impl LlmClassifier {
    pub fn new(
        client: LlmClient,
        enable_ignore: bool,
        text_maxlen: usize,
        cache: Option<VerdictCache>,
    ) -> LlmClassifier {
        LlmClassifier {
            client,
            enable_ignore,
            text_maxlen,
            cache,
        }
    }
}

#[async_trait]
impl ClassifierOracle for LlmClassifier {
    async fn classify(
        &self,
        title: &str,
        body: &str,
        source_id: &str,
        prior_note: &str,
    ) -> Result<Verdict> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(title, body, source_id) {
                debug!("Verdict cache hit - source_id={}", source_id);
                return Ok(hit);
            }
        }

        let prompt = classify_prompt(title, body, prior_note, self.enable_ignore, self.text_maxlen);
        let answer = self
            .client
            .chat("你是严谨的行业研究助理，擅长结构化输出。", &prompt, 0.2, 300)
            .await?;
        let verdict = parse_verdict(&answer, self.enable_ignore, title, body)?;

        if let Some(cache) = &self.cache {
            cache.set(title, body, source_id, &verdict);
        }
        Ok(verdict)
    }
}

// =========================================================================
// LLM-backed semantic duplicate oracle
// =========================================================================

#[derive(Debug, Deserialize)]
struct RawDupAnswer {
    duplicate: Option<bool>,
    #[serde(default)]
    reason: String,
}

/// Semantic duplicate confirmation through the same chat endpoint. Parsing
/// failure is an error; the clusterer treats it as "not a duplicate".
pub struct LlmDuplicateOracle {
    client: LlmClient,
}

impl LlmDuplicateOracle {
    pub fn new(client: LlmClient) -> LlmDuplicateOracle {
        LlmDuplicateOracle { client }
    }
}

#[async_trait]
impl DuplicateOracle for LlmDuplicateOracle {
    async fn confirm(&self, a: &str, b: &str) -> Result<(bool, String)> {
        let prompt = format!(
            "你是行业资讯去重助手。判断两条中文资讯是否“表达的是同一实质事件/事实”，\n\
             不是看文字是否完全相同，而是看语义是否等价（同一主体+同一事件+数据/结论近似）。\n\
             输出 JSON：{{\"duplicate\": true/false, \"reason\": \"简要说明\"}}。\n\n\
             A: {a}\n\
             B: {b}\n"
        );
        let answer = self
            .client
            .chat("你是严谨的行业资讯去重助手，只输出指定 JSON。", &prompt, 0.0, 120)
            .await?;
        let raw: RawDupAnswer = serde_json::from_str(extract_json(&answer))
            .context("duplicate oracle answer is not the expected JSON object")?;
        Ok((raw.duplicate.unwrap_or(false), raw.reason))
    }
}

// =========================================================================
// Verdict cache
// =========================================================================

/// File-per-verdict cache keyed by a content hash of (title, body, source).
/// Entries expire by file mtime; all I/O errors degrade to cache misses.
pub struct VerdictCache {
    dir: PathBuf,
    ttl_hours: u64,
}

impl VerdictCache {
    pub fn new(dir: PathBuf, ttl_hours: u64) -> VerdictCache {
        VerdictCache { dir, ttl_hours }
    }

    fn path_for(&self, title: &str, body: &str, source_id: &str) -> PathBuf {
        let mut h = Sha256::new();
        h.update(title.as_bytes());
        h.update(b"\n--\n");
        h.update(body.as_bytes());
        h.update(b"\n--\n");
        h.update(source_id.as_bytes());
        let digest = h.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.json", hex))
    }

    pub fn get(&self, title: &str, body: &str, source_id: &str) -> Option<Verdict> {
        let path = self.path_for(title, body, source_id);
        let meta = std::fs::metadata(&path).ok()?;
        if self.ttl_hours > 0 {
            let age = meta.modified().ok()?.elapsed().unwrap_or_default();
            if age.as_secs() > self.ttl_hours * 3600 {
                let _ = std::fs::remove_file(&path);
                return None;
            }
        }
        let raw = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn set(&self, title: &str, body: &str, source_id: &str, verdict: &Verdict) {
        if std::fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        let path = self.path_for(title, body, source_id);
        if let Ok(raw) = serde_json::to_string(verdict) {
            let _ = std::fs::write(path, raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_verdict_accepts_wrapped_json() {
        let answer = r#"好的，这是结果：
            {"category": "News", "region": "cn", "summary": "“某厂发布新政策。”",
             "confidence": {"category": 0.9, "region": 0.8},
             "tags": ["政策"], "platform_type": 1}
            以上。"#;
        let v = parse_verdict(answer, true, "t", "b").unwrap();
        assert_eq!(v.label, Label::News);
        assert_eq!(v.region, Region::Cn);
        assert_eq!(v.summary, "某厂发布新政策。");
        assert_eq!(v.confidence.category, 0.9);
        assert_eq!(v.platform_type, PlatformType::Mobile);
        assert_eq!(v.game_type, "");
    }

    #[test]
    fn parse_verdict_rejects_non_json() {
        assert!(parse_verdict("I could not classify this.", true, "t", "b").is_err());
    }

    #[test]
    fn unknown_category_with_market_tag_maps_to_market() {
        let answer = r#"{"category": "finance", "tags": ["市场数据"]}"#;
        let v = parse_verdict(answer, true, "t", "b").unwrap();
        assert_eq!(v.label, Label::Market);

        let answer = r#"{"category": "finance", "tags": []}"#;
        let v = parse_verdict(answer, true, "t", "b").unwrap();
        assert_eq!(v.label, Label::Method);
    }

    #[test]
    fn ignore_label_respects_gate_flag() {
        let answer = r#"{"category": "ignore"}"#;
        assert_eq!(parse_verdict(answer, true, "t", "b").unwrap().label, Label::Ignore);
        // Gate disabled: "ignore" is not an allowed label and falls through.
        assert_eq!(parse_verdict(answer, false, "t", "b").unwrap().label, Label::Method);
    }

    #[test]
    fn out_of_range_platform_falls_back_to_inference() {
        let answer = r#"{"category": "product", "platform_type": 9}"#;
        let v = parse_verdict(answer, true, "新作上线", "已登陆 Steam 平台").unwrap();
        assert_eq!(v.platform_type, PlatformType::Pc);
    }

    #[test]
    fn fallback_verdict_uses_keywords() {
        let v = fallback_verdict("版号政策调整", "国内多家厂商获得新批版号");
        assert_eq!(v.label, Label::News);
        assert_eq!(v.region, Region::Cn);
        assert_eq!(v.confidence.category, 0.55);

        let v = fallback_verdict("新作评测", "这款游戏的玩法演示已在 steam 上架");
        assert_eq!(v.label, Label::Product);
        assert_eq!(v.region, Region::Overseas);
        assert_eq!(v.platform_type, PlatformType::Pc);
    }

    #[test]
    fn platform_inference_priority() {
        assert_eq!(infer_platform("t", "已上架 App Store 与安卓"), PlatformType::Mobile);
        assert_eq!(infer_platform("t", "登陆 ps5 与 xbox"), PlatformType::Console);
        assert_eq!(infer_platform("t", "与平台无关的内容"), PlatformType::Unknown);
    }

    struct FlakyOracle;
    #[async_trait]
    impl ClassifierOracle for FlakyOracle {
        async fn classify(&self, _: &str, _: &str, _: &str, _: &str) -> Result<Verdict> {
            bail!("upstream 500")
        }
    }

    #[tokio::test]
    async fn classify_with_fallback_degrades_after_retries() {
        let (v, fell_back) =
            classify_with_fallback(Some(&FlakyOracle), "政策发布", "国内新政策正式发布", "s1", "", 3)
                .await;
        assert!(fell_back);
        assert_eq!(v.label, Label::News);
    }

    #[tokio::test]
    async fn classify_without_oracle_is_not_a_failure() {
        let (v, fell_back) =
            classify_with_fallback(None, "玩法前瞻", "新版本玩法介绍", "s1", "", 3).await;
        assert!(!fell_back);
        assert_eq!(v.label, Label::Product);
    }

    #[test]
    fn verdict_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VerdictCache::new(dir.path().to_path_buf(), 24);
        assert!(cache.get("t", "b", "s").is_none());
        let v = fallback_verdict("版号政策调整", "国内新政策");
        cache.set("t", "b", "s", &v);
        let hit = cache.get("t", "b", "s").unwrap();
        assert_eq!(hit.label, v.label);
        assert!(cache.get("t", "b", "other-source").is_none());
    }
}
