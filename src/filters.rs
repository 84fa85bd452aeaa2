use once_cell::sync::Lazy;
use regex::Regex;

/// Promotional phrases that push an entry toward the ad gate. Each hit adds
/// one point on top of the structural signals below.
const AD_WORDS: &[&str] = &[
    "报名",
    "报名通道",
    "扫码",
    "二维码",
    "添加微信",
    "加微信",
    "VX",
    "VX：",
    "V：",
    "咨询",
    "优惠",
    "折扣",
    "团购",
    "到店",
    "限时",
    "仅需",
    "私信",
    "合作",
    "转发抽奖",
    "抽奖",
    "直播预告",
    "公开课",
    "沙龙",
    "峰会",
    "购票",
    "订阅",
    "投放",
    "招商",
    "招募",
    "征稿",
];

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://").unwrap());
static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b1[3-9]\d{9}\b").unwrap());
static WECHAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:vx|v信|wx|微信|加微|VX[:：])").unwrap());
static BANG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[!！]{2,}").unwrap());

/// Heuristic ad-likeness score. Entries at or above the configured threshold
/// are excluded with the ad-like status code.
pub fn ad_score(title: &str, text: &str) -> i64 {
    let t = format!("{} {}", title, text);
    let mut score = 0i64;
    if text.chars().count() < 120 {
        score += 1;
    }
    if URL_RE.is_match(&t) {
        score += 1;
    }
    if PHONE_RE.is_match(&t) {
        score += 2;
    }
    if WECHAT_RE.is_match(&t) {
        score += 2;
    }
    if BANG_RE.is_match(&t) {
        score += 1;
    }
    score += AD_WORDS.iter().filter(|w| t.contains(*w)).count() as i64;
    score
}
