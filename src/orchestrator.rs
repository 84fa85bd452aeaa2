use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::classify::{classify_with_fallback, ClassifierOracle, Label};
use crate::config::{EngineConfig, SourcesConfig};
use crate::dedup::{drop_near_duplicates_across_sources, drop_near_duplicates_within_source};
use crate::fetch::Fetcher;
use crate::filters::ad_score;
use crate::models::{Category, Item, ItemStatus, RunStats};
use crate::posterior::{apply_market_tag_override, posterior_category, PosteriorParams};
use crate::report::{md_date, render_weekly, write_docs, Buckets, ReportContext};
use crate::store::Store;
use crate::textnorm::{hide_links, plain_text_len};

const CLASSIFY_BATCH_SIZE: usize = 8;
const CLASSIFY_ATTEMPTS: usize = 3;

/// One full weekly run: fetch → raw layer → gates → dedup passes →
/// classification → cleaned layer → report → aggregate/ranked refreshes.
pub async fn run_weekly(
    cfg: &EngineConfig,
    sources: &SourcesConfig,
    store: &Store,
    fetcher: &Fetcher,
    classifier: Option<&dyn ClassifierOracle>,
    out_dir: &Path,
) -> Result<()> {
    let pipeline_start = std::time::Instant::now();
    let tz: Tz = cfg
        .timezone
        .parse()
        .map_err(|_| anyhow!("invalid timezone {}", cfg.timezone))?;

    let now = Utc::now();
    let now_local = now.with_timezone(&tz);
    let start_local = (now_local - Duration::days(cfg.days_back))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists");
    let window_start = start_local
        .and_local_timezone(tz)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now - Duration::days(cfg.days_back));
    let window_end = now;

    info!(
        "Pipeline started - window={} ~ {} ({})",
        window_start.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
        now_local.format("%Y-%m-%d %H:%M"),
        cfg.timezone
    );

    let mut stats = RunStats::default();

    // 1) fetch every configured source, raw layer gets everything
    let fetch_start = std::time::Instant::now();
    let mut all_items: Vec<Item> = Vec::new();
    for sid in sources.ids() {
        let items = fetcher.fetch_source(&cfg.base_feed, sid).await;
        stats.fetched += items.len();
        for it in &items {
            store.insert_raw(it).await?;
        }
        all_items.extend(items);
    }
    info!(
        "Fetch completed - duration={:.2}s, items={}",
        fetch_start.elapsed().as_secs_f32(),
        stats.fetched
    );

    // 2) window filter plus identity dedup on the canonical link
    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates: Vec<Item> = Vec::new();
    for it in all_items {
        let Some(dt) = it.published_at else { continue };
        if dt < window_start || dt > window_end {
            continue;
        }
        stats.in_window += 1;
        match it.uid() {
            None => {
                stats.empty_identity += 1;
                debug!("Empty identity skipped - source_id={}", it.source_id);
            }
            Some(uid) => {
                if seen.insert(uid) {
                    candidates.push(it);
                } else {
                    stats.url_dupes += 1;
                }
            }
        }
    }
    debug!(
        "Window filter - in_window={}, unique={}, url_dupes={}, empty_identity={}",
        stats.in_window,
        candidates.len(),
        stats.url_dupes,
        stats.empty_identity
    );

    // 3) minimum-length gate; rejected rows still land in the cleaned layer
    let mut sized: Vec<Item> = Vec::new();
    for it in candidates {
        let plen = plain_text_len(&it.body);
        if plen < cfg.min_text_len {
            stats.short_drops += 1;
            store.upsert_cleaned(&it, ItemStatus::TooShort).await?;
            continue;
        }
        sized.push(it);
    }
    if stats.short_drops > 0 {
        info!(
            "Length gate - dropped={} (min_len={})",
            stats.short_drops, cfg.min_text_len
        );
    }

    // 4) near-duplicate passes; order matters and stays sequential
    let mut items = sized;
    if cfg.enable_near_dup_drop {
        let outcome =
            drop_near_duplicates_within_source(items, cfg.within_hamming, cfg.within_policy);
        stats.within_dupes = outcome.dropped.len();
        items = outcome.kept;
    }
    if cfg.enable_cross_dup_drop {
        let outcome = drop_near_duplicates_across_sources(
            items,
            sources,
            cfg.cross_hamming,
            cfg.cross_policy,
        );
        stats.cross_dupes = outcome.dropped.len();
        items = outcome.kept;
    }

    // 5) ad gate, then classification in small parallel batches
    let mut to_classify: Vec<Item> = Vec::new();
    for it in items {
        if cfg.enable_ad_filter {
            let score = ad_score(&it.title, &it.body);
            if score >= cfg.ad_score_threshold {
                stats.ad_drops += 1;
                debug!(
                    "Ad gate dropped - title={}, score={}",
                    it.title.chars().take(30).collect::<String>(),
                    score
                );
                store.upsert_cleaned(&it, ItemStatus::AdLike).await?;
                continue;
            }
        }
        to_classify.push(it);
    }

    let classify_start = std::time::Instant::now();
    let total = to_classify.len();
    let mut verdicts = Vec::with_capacity(total);
    for (batch_no, chunk) in to_classify.chunks(CLASSIFY_BATCH_SIZE).enumerate() {
        let futs = chunk.iter().map(|it| {
            let (_, expert) = sources.priors_for(&it.source_id);
            let prior_note = if expert.is_empty() {
                String::new()
            } else {
                format!(
                    "该来源更擅长方向：{}。仅作为轻微先验，不要违背事实。",
                    expert.join(",")
                )
            };
            async move {
                classify_with_fallback(
                    classifier,
                    &it.title,
                    &it.body,
                    &it.source_id,
                    &prior_note,
                    CLASSIFY_ATTEMPTS,
                )
                .await
            }
        });
        verdicts.extend(futures::future::join_all(futs).await);
        let done = verdicts.len();
        if total > CLASSIFY_BATCH_SIZE {
            info!(
                "Classification progress - {}/{} ({}%), batch={}",
                done,
                total,
                done * 100 / total.max(1),
                batch_no + 1
            );
        }
    }
    info!(
        "Classification completed - duration={:.2}s, items={}",
        classify_start.elapsed().as_secs_f32(),
        total
    );

    // 6) posterior resolution, cleaned-layer upserts, bucketing
    let posterior = PosteriorParams {
        hard_override_weight: cfg.hard_override_weight,
        confidence_bias: cfg.confidence_bias,
        expertise_bias: cfg.expertise_bias,
    };
    let mut buckets = Buckets::default();
    for (mut it, (verdict, fell_back)) in to_classify.into_iter().zip(verdicts) {
        if fell_back {
            stats.fallback_classifications += 1;
        }
        if cfg.enable_ignore_gate && verdict.label == Label::Ignore {
            stats.ignore_drops += 1;
            it.tags = verdict.tags;
            it.reason = verdict.reason;
            store.upsert_cleaned(&it, ItemStatus::NotRelevant).await?;
            continue;
        }

        let raw_cat = verdict.label.category().unwrap_or(Category::Method);
        let (weight, expert) = sources.priors_for(&it.source_id);
        let (resolved, _dist) = posterior_category(
            raw_cat,
            verdict.confidence.category,
            expert,
            weight,
            &posterior,
        );
        let final_cat = apply_market_tag_override(resolved, &verdict.tags);

        let link = if !it.url_norm.is_empty() {
            it.url_norm.clone()
        } else {
            it.link.clone()
        };
        let one = verdict.summary.trim().to_string();
        let d = md_date(it.published_at, &tz);
        let dated_line = if final_cat == Category::News && !d.is_empty() {
            format!("{}，{} {}", d, one, link)
        } else {
            format!("{} {}", one, link)
        };
        it.summary = hide_links(dated_line.trim());
        it.summary_nodate = hide_links(format!("{} {}", one, link).trim());

        it.category = Some(final_cat);
        it.region = verdict.region;
        it.tags = verdict.tags;
        it.confidence = Some(verdict.confidence);
        it.reason = verdict.reason;
        it.platform_type = verdict.platform_type;
        it.game_type = if final_cat == Category::Product {
            verdict.game_type
        } else {
            String::new()
        };

        store.upsert_cleaned(&it, ItemStatus::Accepted).await?;
        stats.accepted += 1;
        buckets.push(it);
    }
    buckets.sort_news_desc();

    // 7) render the weekly report
    let iso = now_local.iso_week();
    let ctx = ReportContext {
        site_title: &cfg.site_title,
        year: iso.year(),
        week: iso.week(),
        timezone: &cfg.timezone,
        window_start: window_start
            .with_timezone(&tz)
            .format("%Y-%m-%d")
            .to_string(),
        window_end: now_local.format("%Y-%m-%d").to_string(),
        generated_at: now_local.format("%Y-%m-%d %H:%M %Z").to_string(),
    };
    let md = render_weekly(&ctx, &buckets);
    let report_path = write_docs(out_dir, &md, iso.year(), iso.week())?;
    info!("Report written - path={}", report_path.display());

    // 8) rebuild the aggregate and ranked layers; one as_of for both so a
    //    re-run of this stage reproduces identical rows
    let as_of = Utc::now();
    store.refresh_aggregate(as_of, cfg.agg_lookback_days).await?;
    store
        .refresh_ranked(as_of, cfg.ranked_lookback_days, cfg.per_week_cap)
        .await?;

    stats.log_summary();
    if stats.fetched > 0 && stats.accepted == 0 {
        warn!("Run accepted no items - check window and gate thresholds");
    }
    info!(
        "Pipeline completed - total_duration={:.2}s, accepted={}, buckets={}",
        pipeline_start.elapsed().as_secs_f32(),
        stats.accepted,
        buckets.total()
    );
    Ok(())
}
