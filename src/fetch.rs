use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::models::Item;
use crate::textnorm::{sanitize_for_llm, text_from_html};

const MAX_RETRY: usize = 3;

static WECHAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(https?://mp\.weixin\.qq\.com)/s/([A-Za-z0-9_-]+)").unwrap());
static QUERY_TAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[?#].*$").unwrap());
static URL_IN_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:https?://\S+|www\.\S+)").unwrap());

/// Canonical link: WeChat article links reduce to scheme + host + /s/<id>
/// (their query strings vary per delivery), everything else just loses
/// query and fragment.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() {
        return String::new();
    }
    if url.contains("mp.weixin.qq.com") {
        if let Some(caps) = WECHAT_RE.captures(url) {
            return format!("{}/s/{}", &caps[1], &caps[2]);
        }
    }
    QUERY_TAIL_RE.replace(url, "").into_owned()
}

/// Map one parsed feed into raw items. Pulled out of the fetch path so feed
/// payloads can be exercised without a network.
pub fn items_from_feed(bytes: &[u8], source_id: &str) -> Result<Vec<Item>> {
    let feed = feed_rs::parser::parse(bytes)
        .with_context(|| format!("failed to parse feed for {}", source_id))?;

    let mut items = Vec::new();
    for entry in feed.entries {
        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default();
        let link = entry
            .links
            .first()
            .map(|l| l.href.clone())
            .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))
            .unwrap_or_default();
        let published_at = entry.published.or(entry.updated);

        let summary_text = entry
            .summary
            .as_ref()
            .map(|s| text_from_html(&s.content))
            .unwrap_or_default();
        let content_text = entry
            .content
            .as_ref()
            .and_then(|c| c.body.as_deref())
            .map(|b| {
                let flat = text_from_html(b);
                let no_urls = URL_IN_TEXT_RE.replace_all(&flat, "");
                sanitize_for_llm(&no_urls)
            })
            .unwrap_or_default();

        let body = if title.is_empty() && summary_text.is_empty() && content_text.is_empty() {
            title.clone()
        } else {
            format!(
                "title:{}|summary:{}|content:{}",
                title, summary_text, content_text
            )
        };

        let mut it = Item::new(source_id, title);
        it.url_norm = normalize_url(&link);
        it.link = link;
        it.published_at = published_at.map(|dt| dt.with_timezone(&chrono::Utc));
        it.body = body;
        it.summary_raw = summary_text;
        items.push(it);
    }
    Ok(items)
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new() -> Result<Fetcher> {
        let client = Client::builder()
            .timeout(Duration::from_secs(25))
            .user_agent("newsift/0.1 (+local)")
            .build()
            .context("failed to build feed HTTP client")?;
        Ok(Fetcher { client })
    }

    /// GET with a small bounded retry. `None` means the source is skipped
    /// for this run; a missing feed never aborts the pipeline.
    pub async fn http_get(&self, url: &str) -> Option<Vec<u8>> {
        for attempt in 1..=MAX_RETRY {
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(b) if !b.is_empty() => return Some(b.to_vec()),
                    Ok(_) => debug!("Empty response body - url={}, attempt={}", url, attempt),
                    Err(e) => debug!("Body read failed - url={}, attempt={}, error={}", url, attempt, e),
                },
                Ok(resp) => {
                    debug!(
                        "Non-success status - url={}, status={}, attempt={}",
                        url,
                        resp.status(),
                        attempt
                    );
                }
                Err(e) => debug!("Request failed - url={}, attempt={}, error={}", url, attempt, e),
            }
        }
        None
    }

    /// Fetch and parse one source's feed. Fetch and parse problems degrade
    /// to an empty batch and a warning; they surface in the run counters,
    /// never as a crash.
    pub async fn fetch_source(&self, base_feed: &str, source_id: &str) -> Vec<Item> {
        let url = format!("{}/{}.atom", base_feed.trim_end_matches('/'), source_id);
        debug!("Fetching feed - url={}", url);
        let Some(bytes) = self.http_get(&url).await else {
            warn!("Feed unavailable after retries - source_id={}", source_id);
            return Vec::new();
        };
        match items_from_feed(&bytes, source_id) {
            Ok(items) => {
                info!("Feed fetched - source_id={}, entries={}", source_id, items.len());
                items
            }
            Err(e) => {
                warn!("Feed parse failed - source_id={}, error={}", source_id, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn url_normalization() {
        assert_eq!(
            normalize_url("https://example.com/a/b?utm=1#frag"),
            "https://example.com/a/b"
        );
        assert_eq!(
            normalize_url("https://mp.weixin.qq.com/s/AbC_12-3?from=timeline"),
            "https://mp.weixin.qq.com/s/AbC_12-3"
        );
        assert_eq!(normalize_url("  "), "");
    }

    #[test]
    fn rss_entries_become_items() {
        let rss = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
  <title>测试源</title>
  <item>
    <title>某厂发布新作</title>
    <link>https://example.com/post/1?utm_source=rss</link>
    <pubDate>Thu, 18 Sep 2025 08:00:00 GMT</pubDate>
    <description><![CDATA[<p>摘要内容<br/>第二行</p>]]></description>
  </item>
  <item>
    <title>无链接条目</title>
    <description>只有描述</description>
  </item>
</channel></rss>"#;
        let items = items_from_feed(rss.as_bytes(), "src_a").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source_id, "src_a");
        assert_eq!(items[0].title, "某厂发布新作");
        assert_eq!(items[0].url_norm, "https://example.com/post/1");
        assert!(items[0].published_at.is_some());
        assert_eq!(items[0].summary_raw, "摘要内容 第二行");
        assert!(items[0].body.starts_with("title:某厂发布新作|summary:"));
        assert_eq!(items[1].url_norm, "");
    }
}
