use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Final topical category. The declaration order is load-bearing: the
/// posterior resolver breaks score ties by scanning buckets in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    News,
    Product,
    Market,
    Method,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::News => "news",
            Category::Product => "product",
            Category::Market => "market",
            Category::Method => "method",
        }
    }

    pub fn parse(s: &str) -> Option<Category> {
        match s.trim().to_lowercase().as_str() {
            "news" => Some(Category::News),
            "product" => Some(Category::Product),
            "market" => Some(Category::Market),
            "method" => Some(Category::Method),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Cn,
    Overseas,
    #[default]
    None,
}

impl Region {
    pub fn as_str(self) -> &'static str {
        match self {
            Region::Cn => "cn",
            Region::Overseas => "overseas",
            Region::None => "none",
        }
    }

    pub fn parse(s: &str) -> Region {
        match s.trim().to_lowercase().as_str() {
            "cn" => Region::Cn,
            "overseas" => Region::Overseas,
            _ => Region::None,
        }
    }
}

/// Platform the covered product ships on. Stored as an integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PlatformType {
    #[default]
    Unknown,
    Mobile,
    Pc,
    Console,
}

impl PlatformType {
    pub fn code(self) -> i64 {
        match self {
            PlatformType::Unknown => 0,
            PlatformType::Mobile => 1,
            PlatformType::Pc => 2,
            PlatformType::Console => 3,
        }
    }

    pub fn from_code(code: i64) -> PlatformType {
        match code {
            1 => PlatformType::Mobile,
            2 => PlatformType::Pc,
            3 => PlatformType::Console,
            _ => PlatformType::Unknown,
        }
    }
}

/// Inclusion status of a cleaned-layer row. Exclusion is recorded, never
/// deleted; the integer codes are part of the persisted schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Accepted,
    TooShort,
    AdLike,
    NotRelevant,
}

impl ItemStatus {
    pub fn code(self) -> i64 {
        match self {
            ItemStatus::Accepted => 1,
            ItemStatus::TooShort => 2,
            ItemStatus::AdLike => 3,
            ItemStatus::NotRelevant => 4,
        }
    }
}

/// Per-verdict confidence scores from the classifier oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confidence {
    #[serde(default = "Confidence::default_category")]
    pub category: f64,
    #[serde(default = "Confidence::default_region")]
    pub region: f64,
}

impl Confidence {
    fn default_category() -> f64 {
        0.6
    }
    fn default_region() -> f64 {
        0.5
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Confidence {
            category: Self::default_category(),
            region: Self::default_region(),
        }
    }
}

/// One candidate news entry, from raw ingestion through enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub source_id: String,
    pub title: String,
    pub link: String,
    pub url_norm: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Assembled text handed to the classifier (title|summary|content).
    pub body: String,
    /// Plain text extracted from the feed summary field.
    pub summary_raw: String,

    // Enrichment, filled after classification.
    pub summary: String,
    pub summary_nodate: String,
    pub category: Option<Category>,
    pub region: Region,
    pub tags: Vec<String>,
    pub confidence: Option<Confidence>,
    pub reason: String,
    pub platform_type: PlatformType,
    pub game_type: String,
}

impl Item {
    pub fn new(source_id: impl Into<String>, title: impl Into<String>) -> Item {
        Item {
            source_id: source_id.into(),
            title: title.into(),
            link: String::new(),
            url_norm: String::new(),
            published_at: None,
            body: String::new(),
            summary_raw: String::new(),
            summary: String::new(),
            summary_nodate: String::new(),
            category: None,
            region: Region::None,
            tags: Vec::new(),
            confidence: None,
            reason: String::new(),
            platform_type: PlatformType::Unknown,
            game_type: String::new(),
        }
    }

    /// Stable content identity: hash of the normalized link, falling back to
    /// the body text when no link exists. `None` means *empty identity* —
    /// the item must be skipped and counted, never persisted.
    pub fn uid(&self) -> Option<String> {
        if !self.url_norm.is_empty() {
            return Some(format!("{:016x}", xxh3_64(self.url_norm.as_bytes())));
        }
        if !self.body.trim().is_empty() {
            return Some(format!("{:016x}", xxh3_64(self.body.trim().as_bytes())));
        }
        None
    }

    /// Period tag `YYYY-W##` from the ISO week of the publication timestamp.
    pub fn week_tag(&self) -> Option<String> {
        self.published_at.map(|dt| {
            let iso = dt.iso_week();
            format!("{}-W{:02}", iso.year(), iso.week())
        })
    }
}

/// Audit record for a dropped near-duplicate: which survivor it merged into
/// and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRecord {
    pub kept_uid: String,
    pub kept_title: String,
    pub dropped_uid: String,
    pub dropped_title: String,
    pub reason: String,
}

/// Per-run summary counters. Item-level failures degrade gracefully and end
/// up here instead of aborting the run.
#[derive(Debug, Default)]
pub struct RunStats {
    pub fetched: usize,
    pub in_window: usize,
    pub url_dupes: usize,
    pub empty_identity: usize,
    pub short_drops: usize,
    pub ad_drops: usize,
    pub ignore_drops: usize,
    pub within_dupes: usize,
    pub cross_dupes: usize,
    pub fallback_classifications: usize,
    pub accepted: usize,
}

impl RunStats {
    pub fn log_summary(&self) {
        tracing::info!(
            "Run summary - fetched={}, in_window={}, url_dupes={}, empty_identity={}, \
             short={}, ad={}, ignore={}, within_dupes={}, cross_dupes={}, \
             fallback_classifications={}, accepted={}",
            self.fetched,
            self.in_window,
            self.url_dupes,
            self.empty_identity,
            self.short_drops,
            self.ad_drops,
            self.ignore_drops,
            self.within_dupes,
            self.cross_dupes,
            self.fallback_classifications,
            self.accepted
        );
    }
}
