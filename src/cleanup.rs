use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::cluster::{cluster_batch, BatchItem, BatchParams, DuplicateOracle};
use crate::models::MergeRecord;

static ITEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-+\s*(.*?)(?:\[原文\]\((https?://[^\s)]+)\))?\s*$").unwrap()
});
static TITLE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[，,：:—-]\s*").unwrap());
static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{1,2}月\d{1,2}日").unwrap());

/// Parse the list items of an already-rendered weekly document. Only bullet
/// lines participate; headings and prose pass through untouched via the
/// keep-set later.
pub fn parse_md_items(content: &str, source_id: &str) -> Vec<BatchItem> {
    let mut items = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if !line.starts_with("- ") {
            continue;
        }
        let (body, url) = match ITEM_RE.captures(line) {
            Some(caps) => (
                caps.get(1).map(|m| m.as_str().trim()).unwrap_or(""),
                caps.get(2).map(|m| m.as_str()).unwrap_or(""),
            ),
            None => (line[2..].trim(), ""),
        };
        let mut parts = TITLE_SPLIT_RE.splitn(body, 2);
        let title = parts.next().unwrap_or("").trim().to_string();
        let text = parts.next().unwrap_or("").trim().to_string();
        let date = DATE_RE
            .find(body)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let id_seed = if url.is_empty() { body } else { url };
        let uid = format!("{:016x}", xxh3_64(id_seed.as_bytes()));
        items.push(BatchItem::new(
            uid,
            title,
            text,
            url.to_string(),
            date,
            source_id.to_string(),
            line.to_string(),
        ));
    }
    items
}

fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn write_audit_csv(path: &Path, records: &[MergeRecord]) -> Result<()> {
    let mut out = String::from("kept_id,kept_title,dropped_id,dropped_title,reason\n");
    for r in records {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            csv_field(&r.kept_uid),
            csv_field(&r.kept_title),
            csv_field(&r.dropped_uid),
            csv_field(&r.dropped_title),
            csv_field(&r.reason)
        ));
    }
    std::fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[derive(Debug)]
pub struct CleanupReport {
    pub total: usize,
    pub kept: usize,
    pub md_path: PathBuf,
    pub audit_path: PathBuf,
    pub oracle_calls: usize,
}

/// Post-hoc cleanup of an already-rendered collection: recall candidate
/// pairs, confirm edges (strong rule, then the optional semantic oracle),
/// merge clusters and rewrite the document with survivors only, plus a CSV
/// audit of everything that was merged away.
pub async fn run_cleanup(
    input: &Path,
    out_dir: Option<&Path>,
    params: &BatchParams,
    oracle: Option<&dyn DuplicateOracle>,
) -> Result<CleanupReport> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("cleanup")
        .to_string();

    let items = parse_md_items(&content, &stem);
    if items.is_empty() {
        bail!("no list items found in {}", input.display());
    }
    info!("Cleanup parsed items - file={}, items={}", input.display(), items.len());

    let outcome = cluster_batch(&items, params, oracle).await;

    let dir = out_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    let md_path = dir.join(format!("{}.dedup.md", stem));
    let mut md_out = String::new();
    for &i in &outcome.kept {
        md_out.push_str(&items[i].raw);
        md_out.push('\n');
    }
    std::fs::write(&md_path, md_out)
        .with_context(|| format!("failed to write {}", md_path.display()))?;

    let audit_path = dir.join(format!("{}.dedup.audit.csv", stem));
    write_audit_csv(&audit_path, &outcome.records)?;

    info!(
        "Cleanup done - kept={}/{}, oracle_calls={}, md={}, audit={}",
        outcome.kept.len(),
        items.len(),
        outcome.oracle_calls,
        md_path.display(),
        audit_path.display()
    );

    Ok(CleanupReport {
        total: items.len(),
        kept: outcome.kept.len(),
        md_path,
        audit_path,
        oracle_calls: outcome.oracle_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STORY: &str =
        "国内某大厂宣布旗下新游戏将于下月正式开启公测并同步推出多项联动活动吸引玩家回流";

    #[test]
    fn md_lines_parse_into_items() {
        let content = format!(
            "# 标题\n\n- 9月18日，{story}。[原文](https://news.example/a)\n- 没有链接的条目，{story}\n普通文字行\n",
            story = STORY
        );
        let items = parse_md_items(&content, "2025-W38");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "https://news.example/a");
        assert_eq!(items[0].date, "9月18日");
        assert_eq!(items[0].title, "9月18日");
        assert!(items[0].text.contains("公测"));
        assert_eq!(items[1].url, "");
        assert_eq!(items[1].source_id, "2025-W38");
    }

    #[tokio::test]
    async fn cleanup_writes_deduped_md_and_audit() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("2025-W38.md");
        let content = format!(
            "- 9月18日，{story}。[原文](https://news.example/a)\n\
             - 9月18日，{story}。[原文](https://news.example/b)\n",
            story = STORY
        );
        std::fs::write(&input, &content).unwrap();

        let report = run_cleanup(&input, None, &BatchParams::default(), None)
            .await
            .unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.kept, 1);

        let md = std::fs::read_to_string(&report.md_path).unwrap();
        assert_eq!(md.lines().count(), 1);
        assert!(md.contains("https://news.example/a"));

        let audit = std::fs::read_to_string(&report.audit_path).unwrap();
        assert!(audit.starts_with("kept_id,kept_title"));
        assert!(audit.contains("same-host high similarity"));
    }

    #[test]
    fn empty_document_is_an_error() {
        let items = parse_md_items("# 只有标题\n没有条目\n", "x");
        assert!(items.is_empty());
    }
}
