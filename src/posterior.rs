use std::collections::BTreeMap;

use crate::models::Category;

/// Fixed bucket order; ties in the soft blend resolve to the first maximum
/// in this order.
const CATEGORY_ORDER: [Category; 4] = [
    Category::News,
    Category::Product,
    Category::Market,
    Category::Method,
];

/// Posterior blending constants. Hand-tuned values carried over as
/// configuration defaults; they are inputs, not derived quantities.
#[derive(Debug, Clone, Copy)]
pub struct PosteriorParams {
    /// Trust weight at or above which a single-expertise source overrides
    /// the raw classification outright.
    pub hard_override_weight: f64,
    /// Scale applied to the raw classifier confidence.
    pub confidence_bias: f64,
    /// Scale applied per declared expertise tag, multiplied by the clamped
    /// source weight.
    pub expertise_bias: f64,
}

impl Default for PosteriorParams {
    fn default() -> Self {
        PosteriorParams {
            hard_override_weight: 3.0,
            confidence_bias: 0.15,
            expertise_bias: 0.12,
        }
    }
}

fn expertise_category(tag: &str) -> Option<Category> {
    if tag.contains("要闻") {
        Some(Category::News)
    } else if tag.contains("产品") {
        Some(Category::Product)
    } else if tag.contains("方法论") || tag.contains("方法") {
        Some(Category::Method)
    } else if tag.contains("市场数据") {
        Some(Category::Market)
    } else {
        None
    }
}

/// Resolve the final category from the raw classifier label plus the
/// source's priors.
///
/// A source that declares exactly one mappable expertise tag and carries a
/// weight at or above the hard threshold is not second-guessed: its mapped
/// category wins with a one-hot distribution over {news, product, method}.
/// Otherwise the four buckets start uniform, the raw label gets a
/// confidence-scaled boost, each expertise tag adds a weight-scaled bias,
/// and the renormalized argmax wins.
pub fn posterior_category(
    raw: Category,
    confidence: f64,
    expertise: &[String],
    weight: f64,
    params: &PosteriorParams,
) -> (Category, BTreeMap<Category, f64>) {
    if expertise.len() == 1 && weight >= params.hard_override_weight {
        let forced = match expertise[0].as_str() {
            t if t.contains("要闻") => Some(Category::News),
            t if t.contains("产品") => Some(Category::Product),
            t if t.contains("方法论") || t.contains("方法") => Some(Category::Method),
            _ => None,
        };
        if let Some(cat) = forced {
            let mut dist = BTreeMap::new();
            for c in [Category::News, Category::Product, Category::Method] {
                dist.insert(c, if c == cat { 1.0 } else { 0.0 });
            }
            return (cat, dist);
        }
    }

    let mut scores: BTreeMap<Category, f64> =
        CATEGORY_ORDER.iter().map(|c| (*c, 0.25)).collect();

    let c = confidence.clamp(0.0, 1.0);
    *scores.get_mut(&raw).expect("raw label bucket exists") += params.confidence_bias * c;

    let bias_unit = params.expertise_bias * weight.clamp(0.5, 4.0);
    for tag in expertise {
        if let Some(cat) = expertise_category(tag) {
            *scores.get_mut(&cat).expect("bucket exists") += bias_unit;
        }
    }

    let total: f64 = scores.values().sum();
    let total = if total > 0.0 { total } else { 1.0 };
    for v in scores.values_mut() {
        *v /= total;
    }

    let mut best = CATEGORY_ORDER[0];
    let mut best_score = f64::MIN;
    for c in CATEGORY_ORDER {
        let s = scores[&c];
        if s > best_score {
            best = c;
            best_score = s;
        }
    }
    (best, scores)
}

/// Post-resolution override: a market-data tag is the most specific signal
/// and beats a statistical product/method outcome.
pub fn apply_market_tag_override(category: Category, tags: &[String]) -> Category {
    if matches!(category, Category::Product | Category::Method)
        && tags.iter().any(|t| t == "市场数据" || t == "market")
    {
        Category::Market
    } else {
        category
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tags(ts: &[&str]) -> Vec<String> {
        ts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hard_override_is_one_hot() {
        let params = PosteriorParams::default();
        let (cat, dist) =
            posterior_category(Category::Method, 0.95, &tags(&["要闻"]), 5.0, &params);
        assert_eq!(cat, Category::News);
        assert_eq!(dist[&Category::News], 1.0);
        assert_eq!(dist[&Category::Product], 0.0);
        assert_eq!(dist[&Category::Method], 0.0);
        assert_eq!(dist.len(), 3);
    }

    #[test]
    fn hard_override_needs_weight_and_single_tag() {
        let params = PosteriorParams::default();
        // Below the weight threshold: soft path.
        let (_, dist) = posterior_category(Category::News, 0.9, &tags(&["要闻"]), 2.0, &params);
        assert_eq!(dist.len(), 4);
        // Two tags: soft path even at high weight.
        let (_, dist) =
            posterior_category(Category::News, 0.9, &tags(&["要闻", "产品"]), 5.0, &params);
        assert_eq!(dist.len(), 4);
    }

    #[test]
    fn soft_distribution_sums_to_one() {
        let params = PosteriorParams::default();
        let (_, dist) = posterior_category(
            Category::Product,
            0.7,
            &tags(&["市场数据", "产品"]),
            2.5,
            &params,
        );
        let total: f64 = dist.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_moves_the_raw_bucket() {
        let params = PosteriorParams::default();
        let (cat, dist) = posterior_category(Category::Market, 1.0, &[], 1.0, &params);
        assert_eq!(cat, Category::Market);
        assert!(dist[&Category::Market] > dist[&Category::News]);
    }

    #[test]
    fn zero_confidence_ties_break_in_bucket_order() {
        let params = PosteriorParams::default();
        // All four buckets stay at 0.25: the first bucket in the fixed
        // order wins deterministically.
        let (cat, _) = posterior_category(Category::Method, 0.0, &[], 1.0, &params);
        assert_eq!(cat, Category::News);
    }

    #[test]
    fn heavy_expertise_outweighs_weak_confidence() {
        let params = PosteriorParams::default();
        // 0.12 * clamp(4.0) = 0.48 on news vs 0.15 * 0.6 = 0.09 on method.
        let (cat, _) =
            posterior_category(Category::Method, 0.6, &tags(&["要闻", "irrelevant"]), 4.0, &params);
        assert_eq!(cat, Category::News);
    }

    #[test]
    fn market_tag_forces_market() {
        assert_eq!(
            apply_market_tag_override(Category::Product, &tags(&["市场数据"])),
            Category::Market
        );
        assert_eq!(
            apply_market_tag_override(Category::Method, &tags(&["market"])),
            Category::Market
        );
        // News is never reclassified by the tag.
        assert_eq!(
            apply_market_tag_override(Category::News, &tags(&["市场数据"])),
            Category::News
        );
    }
}
