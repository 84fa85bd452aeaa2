use once_cell::sync::Lazy;
use regex::Regex;

static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static MD_IMAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]+\)").unwrap());
static MD_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\((?:https?://[^\s)]+)\)").unwrap());
static BARE_URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:https?://\S+|www\.\S+)").unwrap());
static MEDIA_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*(?:图片|image|gif)[ \t]*$").unwrap());
static REFS_TAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)(?:^|\n)[ \t]*(?:参考|references)\b.*$").unwrap());
static PARENS_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[（(]\s*(?:https?://\S+|www\.\S+)\s*[)）]").unwrap());
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());
static BLANKS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static TAIL_WRAPPED_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[（(]\s*\[原文\]\((https?://[^\s)）]+)\)\s*[)）]$").unwrap());
static TAIL_DOUBLE_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[原文\]\(\s*\[原文\]\((https?://[^\s)]+)\)\s*\)$").unwrap());
static TAIL_PAREN_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[（(]\s*(https?://[^\s)）]+)\s*[)）]$").unwrap());
static TAIL_BARE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(https?://[^\s)）]+)$").unwrap());

/// Flatten an HTML fragment to plain text: `<br>` becomes a newline, all
/// other markup becomes a space, whitespace collapses.
pub fn text_from_html(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let s = BR_RE.replace_all(s, "\n");
    let s = TAG_RE.replace_all(&s, " ");
    WS_RE.replace_all(&s, " ").trim().to_string()
}

/// Character count of the plain-text rendering of a fragment. Gates on
/// minimum article length use this, not the raw markup length.
pub fn plain_text_len(s: &str) -> usize {
    text_from_html(s).chars().count()
}

/// Strip markdown images, unwrap links, drop bare URLs and reference tails
/// before handing article text to the classifier.
pub fn sanitize_for_llm(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let s = MD_IMAGE_RE.replace_all(s, "");
    let s = MD_LINK_RE.replace_all(&s, "$1");
    let s = PARENS_URL_RE.replace_all(&s, "");
    let s = BARE_URL_RE.replace_all(&s, "");
    let s = MEDIA_LINE_RE.replace_all(&s, "");
    let s = REFS_TAIL_RE.replace_all(&s, "");
    let s = SPACES_RE.replace_all(&s, " ");
    let s = BLANKS_RE.replace_all(&s, "\n\n");
    s.trim().to_string()
}

/// Deterministic summary used when the classifier oracle is disabled or
/// falls over: cut at the last sentence boundary inside the window, else
/// hard-cut at `maxlen` characters.
pub fn fallback_summarize(text: &str, minlen: usize, maxlen: usize) -> String {
    let t = WS_RE.replace_all(text.trim(), " ").to_string();
    if t.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = t.chars().collect();
    if chars.len() <= maxlen {
        return t;
    }
    let window = chars.len().min(maxlen + 20);
    let mut end = 0usize;
    for (i, c) in chars[..window].iter().enumerate() {
        if matches!(c, '。' | '！' | '!' | '？' | '?' | '；' | ';') {
            end = i + 1;
        }
    }
    if end >= minlen {
        chars[..end].iter().collect()
    } else {
        chars[..maxlen].iter().collect()
    }
}

/// Rewrite a trailing raw URL (possibly parenthesized or double-wrapped)
/// into a single trailing `[原文](url)` markdown link.
pub fn hide_links(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let t = text.trim_end().to_string();
    let t = TAIL_WRAPPED_LINK_RE.replace(&t, "[原文]($1)").into_owned();
    let t = TAIL_DOUBLE_LINK_RE.replace(&t, "[原文]($1)").into_owned();
    let t = TAIL_PAREN_URL_RE.replace(&t, "[原文]($1)").into_owned();
    TAIL_BARE_URL_RE.replace(&t, "[原文]($1)").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn html_flattening() {
        assert_eq!(
            text_from_html("<p>hello<br/>world</p>  <b>x</b>"),
            "hello world x"
        );
        assert_eq!(text_from_html(""), "");
    }

    #[test]
    fn plain_len_counts_chars_not_bytes() {
        assert_eq!(plain_text_len("<p>游戏行业</p>"), 4);
    }

    #[test]
    fn sanitize_strips_images_and_urls() {
        let s = "看这个 ![img](https://a.b/c.png) 和 [链接](https://x.y/z) 以及 https://bare.url/path 结束";
        let out = sanitize_for_llm(s);
        assert!(!out.contains("https://"));
        assert!(out.contains("链接"));
        assert!(!out.contains("!["));
    }

    #[test]
    fn fallback_summary_prefers_sentence_boundary() {
        let text = "第一句话比较长所以要保证满足最小长度的要求才可以。第二句话在窗口之外继续延伸下去直到远超最大长度的位置为止,然后还有更多更多更多的内容在后面继续继续继续";
        let out = fallback_summarize(text, 10, 40);
        assert!(out.ends_with('。'));
        assert!(out.chars().count() <= 60);
    }

    #[test]
    fn fallback_summary_hard_cut_without_boundary() {
        let text: String = std::iter::repeat('字').take(200).collect();
        let out = fallback_summarize(&text, 60, 90);
        assert_eq!(out.chars().count(), 90);
    }

    #[test]
    fn hide_links_rewrites_trailing_url() {
        assert_eq!(
            hide_links("某公司发布新品 https://example.com/a?b=1"),
            "某公司发布新品 [原文](https://example.com/a?b=1)"
        );
        assert_eq!(
            hide_links("某公司发布新品（https://example.com/a）"),
            "某公司发布新品[原文](https://example.com/a)"
        );
        // already a markdown link: unchanged
        assert_eq!(
            hide_links("摘要 [原文](https://example.com/a)"),
            "摘要 [原文](https://example.com/a)"
        );
    }
}
