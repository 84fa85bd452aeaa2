use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;

use crate::models::{Category, Item, PlatformType, Region};

/// Final per-category buckets feeding the weekly report. News splits by
/// region, product splits by platform at render time.
#[derive(Debug, Default)]
pub struct Buckets {
    pub news_cn: Vec<Item>,
    pub news_overseas: Vec<Item>,
    pub market: Vec<Item>,
    pub product: Vec<Item>,
    pub method: Vec<Item>,
}

impl Buckets {
    pub fn push(&mut self, it: Item) {
        match it.category {
            Some(Category::News) => {
                if it.region == Region::Cn {
                    self.news_cn.push(it);
                } else {
                    self.news_overseas.push(it);
                }
            }
            Some(Category::Market) => self.market.push(it),
            Some(Category::Product) => self.product.push(it),
            _ => self.method.push(it),
        }
    }

    /// News buckets read newest-first.
    pub fn sort_news_desc(&mut self) {
        let epoch = DateTime::<Utc>::MIN_UTC;
        for bucket in [&mut self.news_cn, &mut self.news_overseas] {
            bucket.sort_by_key(|it| std::cmp::Reverse(it.published_at.unwrap_or(epoch)));
        }
    }

    pub fn total(&self) -> usize {
        self.news_cn.len()
            + self.news_overseas.len()
            + self.market.len()
            + self.product.len()
            + self.method.len()
    }
}

/// Display date in the report timezone, e.g. `9月18日`.
pub fn md_date(dt: Option<DateTime<Utc>>, tz: &Tz) -> String {
    match dt {
        Some(dt) => {
            let local = dt.with_timezone(tz);
            format!("{}月{}日", local.month(), local.day())
        }
        None => String::new(),
    }
}

pub struct ReportContext<'a> {
    pub site_title: &'a str,
    pub year: i32,
    pub week: u32,
    pub timezone: &'a str,
    pub window_start: String,
    pub window_end: String,
    pub generated_at: String,
}

fn push_section(md: &mut String, heading: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    md.push_str(&format!("## {}\n\n", heading));
    for line in lines {
        md.push_str(&format!("- {}\n", line));
    }
    md.push('\n');
}

fn product_line(it: &Item) -> String {
    if it.game_type.is_empty() {
        it.summary_nodate.clone()
    } else {
        format!("【{}】{}", it.game_type, it.summary_nodate)
    }
}

/// Render the weekly report. Dated lines only appear in the news sections;
/// every other section uses the date-free summary line.
pub fn render_weekly(ctx: &ReportContext<'_>, buckets: &Buckets) -> String {
    let mut md = String::new();
    md.push_str(&format!(
        "# {} {}年第{:02}周\n\n",
        ctx.site_title, ctx.year, ctx.week
    ));
    md.push_str(&format!(
        "> 统计窗口：{} ~ {}（{}）｜生成于 {}\n\n",
        ctx.window_start, ctx.window_end, ctx.timezone, ctx.generated_at
    ));

    let lines = |items: &[Item]| -> Vec<String> {
        items.iter().map(|it| it.summary.clone()).collect()
    };
    let nodate_lines = |items: &[Item]| -> Vec<String> {
        items.iter().map(|it| it.summary_nodate.clone()).collect()
    };

    push_section(&mut md, "国内要闻", &lines(&buckets.news_cn));
    push_section(&mut md, "海外要闻", &lines(&buckets.news_overseas));
    push_section(&mut md, "市场数据", &nodate_lines(&buckets.market));

    let mobile: Vec<String> = buckets
        .product
        .iter()
        .filter(|it| {
            matches!(it.platform_type, PlatformType::Unknown | PlatformType::Mobile)
        })
        .map(product_line)
        .collect();
    let pc_console: Vec<String> = buckets
        .product
        .iter()
        .filter(|it| matches!(it.platform_type, PlatformType::Pc | PlatformType::Console))
        .map(product_line)
        .collect();
    push_section(&mut md, "产品分析 · 移动", &mobile);
    push_section(&mut md, "产品分析 · PC/主机", &pc_console);

    push_section(&mut md, "方法论学习", &nodate_lines(&buckets.method));
    md
}

/// Write the weekly document and keep the index file pointing at it.
pub fn write_docs(dir: &Path, md: &str, year: i32, week: u32) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create docs directory {}", dir.display()))?;
    let fname = format!("{}-W{:02}.md", year, week);
    let path = dir.join(&fname);
    std::fs::write(&path, md).with_context(|| format!("failed to write {}", path.display()))?;

    let index_path = dir.join("index.md");
    let mut index = match std::fs::read_to_string(&index_path) {
        Ok(s) => s,
        Err(_) => "# 周报索引\n\n".to_string(),
    };
    let line = format!("- [{}年第 {:02} 周]({})\n", year, week, fname);
    if !index.contains(&line) {
        index.push_str(&line);
        std::fs::write(&index_path, index)
            .with_context(|| format!("failed to write {}", index_path.display()))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn item(cat: Category, region: Region, summary: &str, day: u32) -> Item {
        let mut it = Item::new("s1", summary);
        it.category = Some(cat);
        it.region = region;
        it.summary = format!("{}月{}日，{}", 9, day, summary);
        it.summary_nodate = summary.to_string();
        it.published_at = Some(Utc.with_ymd_and_hms(2025, 9, day, 8, 0, 0).unwrap());
        it
    }

    #[test]
    fn buckets_split_news_by_region() {
        let mut b = Buckets::default();
        b.push(item(Category::News, Region::Cn, "国内条目", 18));
        b.push(item(Category::News, Region::Overseas, "海外条目", 18));
        b.push(item(Category::Market, Region::None, "市场条目", 18));
        assert_eq!(b.news_cn.len(), 1);
        assert_eq!(b.news_overseas.len(), 1);
        assert_eq!(b.market.len(), 1);
        assert_eq!(b.total(), 3);
    }

    #[test]
    fn news_sorts_newest_first() {
        let mut b = Buckets::default();
        b.push(item(Category::News, Region::Cn, "旧条目", 15));
        b.push(item(Category::News, Region::Cn, "新条目", 19));
        b.sort_news_desc();
        assert_eq!(b.news_cn[0].summary_nodate, "新条目");
    }

    #[test]
    fn render_skips_empty_sections_and_splits_platforms() {
        let mut b = Buckets::default();
        b.push(item(Category::News, Region::Cn, "国内条目", 18));
        let mut mobile = item(Category::Product, Region::None, "手游条目", 18);
        mobile.platform_type = PlatformType::Mobile;
        mobile.game_type = "SLG".to_string();
        b.push(mobile);
        let mut pc = item(Category::Product, Region::None, "PC条目", 18);
        pc.platform_type = PlatformType::Pc;
        b.push(pc);

        let ctx = ReportContext {
            site_title: "行业周报",
            year: 2025,
            week: 38,
            timezone: "Asia/Shanghai",
            window_start: "2025-09-11".into(),
            window_end: "2025-09-18".into(),
            generated_at: "2025-09-18 20:00".into(),
        };
        let md = render_weekly(&ctx, &b);
        assert!(md.contains("# 行业周报 2025年第38周"));
        assert!(md.contains("## 国内要闻"));
        assert!(!md.contains("## 海外要闻"));
        assert!(md.contains("【SLG】手游条目"));
        assert!(md.contains("## 产品分析 · PC/主机"));
        assert!(md.contains("- PC条目"));
    }

    #[test]
    fn md_date_renders_in_timezone() {
        let tz: Tz = "Asia/Shanghai".parse().unwrap();
        // 23:00 UTC on the 17th is already the 18th in Shanghai.
        let dt = Utc.with_ymd_and_hms(2025, 9, 17, 23, 0, 0).unwrap();
        assert_eq!(md_date(Some(dt), &tz), "9月18日");
        assert_eq!(md_date(None, &tz), "");
    }

    #[test]
    fn write_docs_updates_index_once() {
        let dir = tempfile::tempdir().unwrap();
        write_docs(dir.path(), "# 周报", 2025, 38).unwrap();
        write_docs(dir.path(), "# 周报", 2025, 38).unwrap();
        let index = std::fs::read_to_string(dir.path().join("index.md")).unwrap();
        assert_eq!(index.matches("2025年第 38 周").count(), 1);
        assert!(dir.path().join("2025-W38.md").exists());
    }
}
