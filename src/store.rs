use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::models::{Item, ItemStatus};

/// Four strata with distinct write disciplines: the raw layer is
/// append-only, the cleaned layer upserts by content identity, and the
/// aggregate and ranked layers are only ever rebuilt wholesale per period.
const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS raw_items (
  rid         INTEGER PRIMARY KEY AUTOINCREMENT,
  source_id   TEXT,
  title       TEXT,
  link        TEXT,
  url_norm    TEXT,
  published_at TEXT,
  body        TEXT,
  summary_raw TEXT,
  created_at  TEXT DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_raw_published ON raw_items(published_at);
CREATE INDEX IF NOT EXISTS idx_raw_url ON raw_items(url_norm);

CREATE TABLE IF NOT EXISTS cleaned_items (
  uid           TEXT PRIMARY KEY,
  wid           TEXT,
  title         TEXT NOT NULL,
  summary       TEXT,
  body          TEXT,
  url           TEXT,
  source_id     TEXT,
  category      TEXT,
  region        TEXT,
  tags          TEXT,
  published_at  TEXT,
  status        INTEGER NOT NULL,
  week_tag      TEXT,
  confidence    TEXT,
  reason        TEXT,
  platform_type INTEGER DEFAULT 0,
  game_type     TEXT,
  created_at    TEXT DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_cleaned_published ON cleaned_items(published_at);
CREATE INDEX IF NOT EXISTS idx_cleaned_source ON cleaned_items(source_id);
CREATE INDEX IF NOT EXISTS idx_cleaned_category ON cleaned_items(category);
CREATE INDEX IF NOT EXISTS idx_cleaned_status ON cleaned_items(status);
CREATE INDEX IF NOT EXISTS idx_cleaned_week ON cleaned_items(week_tag);

CREATE TABLE IF NOT EXISTS weekly_agg (
  week_tag   TEXT,
  source_id  TEXT,
  category   TEXT,
  cnt        INTEGER,
  PRIMARY KEY (week_tag, source_id, category)
);

CREATE TABLE IF NOT EXISTS ranked_items (
  week_tag     TEXT,
  uid          TEXT,
  title        TEXT,
  url          TEXT,
  summary      TEXT,
  category     TEXT,
  source_id    TEXT,
  published_at TEXT,
  score        REAL,
  rank         INTEGER,
  PRIMARY KEY (week_tag, uid)
);
"#;

fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?")
        .take(n)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub week_tag: String,
    pub source_id: String,
    pub category: String,
    pub cnt: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedRow {
    pub week_tag: String,
    pub uid: String,
    pub title: String,
    pub category: String,
    pub score: f64,
    pub rank: i64,
}

#[derive(Debug, Clone)]
pub struct CleanedRow {
    pub uid: String,
    pub title: String,
    pub summary: String,
    pub category: Option<String>,
    pub status: i64,
    pub week_tag: Option<String>,
    pub platform_type: i64,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(path: &Path) -> Result<Store> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let store = Store { pool };
        store.init().await?;
        info!("Store ready - path={}", path.display());
        Ok(store)
    }

    /// In-memory store for tests; a single connection keeps every query on
    /// the same database.
    pub async fn connect_memory() -> Result<Store> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory database")?;
        let store = Store { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to initialize store schema")?;
        Ok(())
    }

    /// Append-only raw-layer insert. Duplicates are allowed and existing
    /// rows are never touched; this is the audit trail of what was fetched.
    pub async fn insert_raw(&self, it: &Item) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO raw_items (source_id, title, link, url_norm, published_at, body, summary_raw)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&it.source_id)
        .bind(&it.title)
        .bind(&it.link)
        .bind(&it.url_norm)
        .bind(it.published_at.map(fmt_ts))
        .bind(&it.body)
        .bind(&it.summary_raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert one cleaned-layer row keyed by content identity. Re-running
    /// with the same item and status stores the same row; an item with an
    /// empty identity is never persisted.
    pub async fn upsert_cleaned(&self, it: &Item, status: ItemStatus) -> Result<()> {
        let Some(uid) = it.uid() else {
            debug!("Skipping cleaned upsert for empty-identity item - title={}", it.title);
            return Ok(());
        };
        let wid = format!("{}-{}", it.source_id, &uid[..8]);
        let summary = if !it.summary.is_empty() {
            it.summary.as_str()
        } else {
            it.summary_nodate.as_str()
        };
        let url = if !it.url_norm.is_empty() {
            it.url_norm.as_str()
        } else {
            it.link.as_str()
        };
        let tags = serde_json::to_string(&it.tags).unwrap_or_else(|_| "[]".to_string());
        let confidence = it
            .confidence
            .as_ref()
            .and_then(|c| serde_json::to_string(c).ok());

        sqlx::query(
            r#"
            INSERT INTO cleaned_items (
              uid, wid, title, summary, body, url, source_id, category, region,
              tags, published_at, status, week_tag, confidence, reason,
              platform_type, game_type
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uid) DO UPDATE SET
              wid = excluded.wid,
              title = excluded.title,
              summary = excluded.summary,
              body = excluded.body,
              url = excluded.url,
              source_id = excluded.source_id,
              category = excluded.category,
              region = excluded.region,
              tags = excluded.tags,
              published_at = excluded.published_at,
              status = excluded.status,
              week_tag = excluded.week_tag,
              confidence = excluded.confidence,
              reason = excluded.reason,
              platform_type = excluded.platform_type,
              game_type = excluded.game_type
            "#,
        )
        .bind(&uid)
        .bind(&wid)
        .bind(&it.title)
        .bind(summary)
        .bind(&it.body)
        .bind(url)
        .bind(&it.source_id)
        .bind(it.category.map(|c| c.as_str()))
        .bind(it.region.as_str())
        .bind(&tags)
        .bind(it.published_at.map(fmt_ts))
        .bind(status.code())
        .bind(it.week_tag())
        .bind(confidence)
        .bind(&it.reason)
        .bind(it.platform_type.code())
        .bind(&it.game_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Week tags of accepted rows inside the lookback window, relative to an
    /// explicit `as_of` so repeated refreshes see the same window.
    async fn touched_weeks(&self, as_of: DateTime<Utc>, lookback_days: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT week_tag FROM cleaned_items
            WHERE status = 1
              AND week_tag IS NOT NULL
              AND published_at IS NOT NULL
              AND published_at >= datetime(?, ?)
            ORDER BY week_tag
            "#,
        )
        .bind(fmt_ts(as_of))
        .bind(format!("-{} day", lookback_days.max(0)))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("week_tag")).collect())
    }

    /// Rebuild the aggregate layer for every week touched inside the
    /// lookback window: delete those weeks, re-insert fresh counts, one
    /// transaction. Safe to re-invoke at any time.
    pub async fn refresh_aggregate(&self, as_of: DateTime<Utc>, lookback_days: i64) -> Result<()> {
        let weeks = self.touched_weeks(as_of, lookback_days).await?;
        if weeks.is_empty() {
            debug!("Aggregate refresh - no touched weeks");
            return Ok(());
        }
        let marks = placeholders(weeks.len());

        let mut tx = self.pool.begin().await?;
        let del_sql = format!("DELETE FROM weekly_agg WHERE week_tag IN ({})", marks);
        let mut del = sqlx::query(&del_sql);
        for w in &weeks {
            del = del.bind(w);
        }
        del.execute(&mut *tx).await?;

        let insert_sql = format!(
            r#"
            INSERT INTO weekly_agg (week_tag, source_id, category, cnt)
            SELECT
              week_tag,
              COALESCE(source_id, '') AS source_id,
              LOWER(COALESCE(NULLIF(category, ''), 'unknown')) AS category,
              COUNT(*) AS cnt
            FROM cleaned_items
            WHERE status = 1 AND published_at IS NOT NULL AND week_tag IN ({})
            GROUP BY 1, 2, 3
            "#,
            marks
        );
        let mut ins = sqlx::query(&insert_sql);
        for w in &weeks {
            ins = ins.bind(w);
        }
        ins.execute(&mut *tx).await?;
        tx.commit().await?;

        info!("Aggregate refresh - weeks={}", weeks.len());
        Ok(())
    }

    /// Rebuild the ranked layer for the touched weeks. Score favors recency
    /// (three-day half-life-ish decay against `as_of`), the category bonus
    /// and summary brevity; only the top `per_week_cap` rows per week
    /// survive. Delete-then-insert in one transaction keeps readers from
    /// ever seeing a partial week.
    pub async fn refresh_ranked(
        &self,
        as_of: DateTime<Utc>,
        lookback_days: i64,
        per_week_cap: i64,
    ) -> Result<()> {
        let weeks = self.touched_weeks(as_of, lookback_days).await?;
        if weeks.is_empty() {
            debug!("Ranked refresh - no touched weeks");
            return Ok(());
        }
        let marks = placeholders(weeks.len());
        let as_of_str = fmt_ts(as_of);

        let mut tx = self.pool.begin().await?;
        let del_sql = format!("DELETE FROM ranked_items WHERE week_tag IN ({})", marks);
        let mut del = sqlx::query(&del_sql);
        for w in &weeks {
            del = del.bind(w);
        }
        del.execute(&mut *tx).await?;

        let insert_sql = format!(
            r#"
            INSERT INTO ranked_items
              (week_tag, uid, title, url, summary, category, source_id, published_at, score, rank)
            WITH base AS (
              SELECT
                week_tag, uid, title, url, summary,
                LOWER(COALESCE(NULLIF(category, ''), 'unknown')) AS category,
                source_id, published_at,
                1.0 / (1.0 + (julianday(?) - julianday(published_at)) / 3.0) AS recency,
                CASE LOWER(COALESCE(category, ''))
                  WHEN 'market'  THEN 0.30
                  WHEN 'product' THEN 0.20
                  WHEN 'news'    THEN 0.15
                  WHEN 'method'  THEN 0.10
                  ELSE 0.00
                END AS cat_bonus,
                MIN(LENGTH(COALESCE(summary, '')), 400) / 400.0 AS brevity
              FROM cleaned_items
              WHERE status = 1 AND published_at IS NOT NULL AND week_tag IN ({})
            ),
            scored AS (
              SELECT week_tag, uid, title, url, summary, category, source_id, published_at,
                     (0.6 * recency + cat_bonus + 0.2 * brevity) AS score
              FROM base
            ),
            ranked AS (
              SELECT week_tag, uid, title, url, summary, category, source_id, published_at, score,
                     ROW_NUMBER() OVER (PARTITION BY week_tag ORDER BY score DESC, uid) AS rnk
              FROM scored
            )
            SELECT week_tag, uid, title, url, summary, category, source_id, published_at, score, rnk
            FROM ranked
            WHERE rnk <= ?
            "#,
            marks
        );
        let mut ins = sqlx::query(&insert_sql).bind(&as_of_str);
        for w in &weeks {
            ins = ins.bind(w);
        }
        ins = ins.bind(per_week_cap);
        ins.execute(&mut *tx).await?;
        tx.commit().await?;

        info!("Ranked refresh - weeks={}, per_week_cap={}", weeks.len(), per_week_cap);
        Ok(())
    }

    pub async fn aggregate_rows(&self) -> Result<Vec<AggregateRow>> {
        let rows = sqlx::query(
            "SELECT week_tag, source_id, category, cnt FROM weekly_agg \
             ORDER BY week_tag, source_id, category",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| AggregateRow {
                week_tag: r.get("week_tag"),
                source_id: r.get("source_id"),
                category: r.get("category"),
                cnt: r.get("cnt"),
            })
            .collect())
    }

    pub async fn ranked_rows(&self) -> Result<Vec<RankedRow>> {
        let rows = sqlx::query(
            "SELECT week_tag, uid, title, category, score, rank FROM ranked_items \
             ORDER BY week_tag, rank",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| RankedRow {
                week_tag: r.get("week_tag"),
                uid: r.get("uid"),
                title: r.get("title"),
                category: r.get("category"),
                score: r.get("score"),
                rank: r.get("rank"),
            })
            .collect())
    }

    pub async fn cleaned_row(&self, uid: &str) -> Result<Option<CleanedRow>> {
        let row = sqlx::query(
            "SELECT uid, title, summary, category, status, week_tag, platform_type \
             FROM cleaned_items WHERE uid = ?",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CleanedRow {
            uid: r.get("uid"),
            title: r.get("title"),
            summary: r.get("summary"),
            category: r.get("category"),
            status: r.get("status"),
            week_tag: r.get("week_tag"),
            platform_type: r.get("platform_type"),
        }))
    }

    pub async fn raw_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM raw_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn cleaned_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cleaned_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, Region};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn item(source: &str, title: &str, link: &str, day: u32, category: Category) -> Item {
        let mut it = Item::new(source, title);
        it.link = link.to_string();
        it.url_norm = link.to_string();
        it.published_at = Some(Utc.with_ymd_and_hms(2025, 9, day, 8, 0, 0).unwrap());
        it.body = format!("{} 的正文内容", title);
        it.summary_nodate = format!("{} 摘要", title);
        it.category = Some(category);
        it.region = Region::Cn;
        it
    }

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 20, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn raw_layer_allows_duplicates() {
        let store = Store::connect_memory().await.unwrap();
        let it = item("s1", "标题", "https://a.example/1", 18, Category::News);
        store.insert_raw(&it).await.unwrap();
        store.insert_raw(&it).await.unwrap();
        assert_eq!(store.raw_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cleaned_upsert_is_idempotent_and_overwrites() {
        let store = Store::connect_memory().await.unwrap();
        let it = item("s1", "标题", "https://a.example/1", 18, Category::News);
        let uid = it.uid().unwrap();

        store.upsert_cleaned(&it, ItemStatus::Accepted).await.unwrap();
        store.upsert_cleaned(&it, ItemStatus::Accepted).await.unwrap();
        assert_eq!(store.cleaned_count().await.unwrap(), 1);
        let row = store.cleaned_row(&uid).await.unwrap().unwrap();
        assert_eq!(row.status, 1);
        assert_eq!(row.week_tag.as_deref(), Some("2025-W38"));

        // Same identity, new status: the row is overwritten, not duplicated.
        store.upsert_cleaned(&it, ItemStatus::AdLike).await.unwrap();
        assert_eq!(store.cleaned_count().await.unwrap(), 1);
        let row = store.cleaned_row(&uid).await.unwrap().unwrap();
        assert_eq!(row.status, 3);
    }

    #[tokio::test]
    async fn empty_identity_is_never_persisted() {
        let store = Store::connect_memory().await.unwrap();
        let it = Item::new("s1", "");
        store.upsert_cleaned(&it, ItemStatus::Accepted).await.unwrap();
        assert_eq!(store.cleaned_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn aggregate_refresh_counts_accepted_rows_only() {
        let store = Store::connect_memory().await.unwrap();
        for (i, cat) in [Category::News, Category::News, Category::Market].iter().enumerate() {
            let it = item("s1", "标题", &format!("https://a.example/{}", i), 18, *cat);
            store.upsert_cleaned(&it, ItemStatus::Accepted).await.unwrap();
        }
        let rejected = item("s1", "广告", "https://a.example/ad", 18, Category::News);
        store.upsert_cleaned(&rejected, ItemStatus::AdLike).await.unwrap();

        store.refresh_aggregate(as_of(), 60).await.unwrap();
        let rows = store.aggregate_rows().await.unwrap();
        assert_eq!(
            rows,
            vec![
                AggregateRow {
                    week_tag: "2025-W38".into(),
                    source_id: "s1".into(),
                    category: "market".into(),
                    cnt: 1
                },
                AggregateRow {
                    week_tag: "2025-W38".into(),
                    source_id: "s1".into(),
                    category: "news".into(),
                    cnt: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn aggregate_refresh_is_idempotent() {
        let store = Store::connect_memory().await.unwrap();
        let it = item("s1", "标题", "https://a.example/1", 18, Category::News);
        store.upsert_cleaned(&it, ItemStatus::Accepted).await.unwrap();

        store.refresh_aggregate(as_of(), 60).await.unwrap();
        let first = store.aggregate_rows().await.unwrap();
        store.refresh_aggregate(as_of(), 60).await.unwrap();
        let second = store.aggregate_rows().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ranked_refresh_orders_and_caps() {
        let store = Store::connect_memory().await.unwrap();
        let cats = [
            Category::Market,
            Category::Product,
            Category::News,
            Category::Method,
        ];
        for (i, cat) in cats.iter().enumerate() {
            let it = item("s1", &format!("标题{}", i), &format!("https://a.example/{}", i), 18, *cat);
            store.upsert_cleaned(&it, ItemStatus::Accepted).await.unwrap();
        }

        store.refresh_ranked(as_of(), 30, 3).await.unwrap();
        let rows = store.ranked_rows().await.unwrap();
        // Cap trims method (lowest bonus, same recency/brevity) away.
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].category, "market");
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[1].category, "product");
        assert_eq!(rows[2].category, "news");
        assert!(rows[0].score > rows[1].score);
    }

    #[tokio::test]
    async fn ranked_refresh_is_idempotent_for_fixed_as_of() {
        let store = Store::connect_memory().await.unwrap();
        let it = item("s1", "标题", "https://a.example/1", 18, Category::Market);
        store.upsert_cleaned(&it, ItemStatus::Accepted).await.unwrap();

        store.refresh_ranked(as_of(), 30, 200).await.unwrap();
        let first = store.ranked_rows().await.unwrap();
        store.refresh_ranked(as_of(), 30, 200).await.unwrap();
        let second = store.ranked_rows().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn refresh_replaces_stale_period_slices() {
        let store = Store::connect_memory().await.unwrap();
        let it = item("s1", "标题", "https://a.example/1", 18, Category::News);
        store.upsert_cleaned(&it, ItemStatus::Accepted).await.unwrap();
        store.refresh_aggregate(as_of(), 60).await.unwrap();

        // A second item lands in the same week; the refresh replaces the
        // week's slice instead of stacking counts.
        let it2 = item("s1", "标题2", "https://a.example/2", 19, Category::News);
        store.upsert_cleaned(&it2, ItemStatus::Accepted).await.unwrap();
        store.refresh_aggregate(as_of(), 60).await.unwrap();

        let rows = store.aggregate_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cnt, 2);
    }

    #[tokio::test]
    async fn lookback_window_bounds_the_refresh() {
        let store = Store::connect_memory().await.unwrap();
        let old = item("s1", "旧闻", "https://a.example/old", 1, Category::News);
        store.upsert_cleaned(&old, ItemStatus::Accepted).await.unwrap();
        let fresh = item("s1", "新闻", "https://a.example/new", 19, Category::News);
        store.upsert_cleaned(&fresh, ItemStatus::Accepted).await.unwrap();

        // Sep 1 falls outside a 10-day window ending Sep 20.
        store.refresh_aggregate(as_of(), 10).await.unwrap();
        let rows = store.aggregate_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].week_tag, "2025-W38");
    }
}
