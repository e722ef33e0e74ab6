//! Dual-engine WeChat article extraction.
//!
//! Engine A runs a Readability pass over the whole document; engine B pulls
//! the article container with the known WeChat selectors. Selection between
//! the two is a pure function of success flags and content lengths, so it
//! is testable without any network or browser.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};
use spider_transformations::transformation::content::{
    transform_content_input, ReturnFormat, TransformConfig, TransformInput,
};
use tracing::{debug, info};
use url::Url;

use reprint_common::sites::AuthorWindowRule;
use reprint_common::{ReprintError, Result};

use crate::extractor::visible_text;

/// When both engines succeed and their lengths differ by less than this
/// fraction, the Readability result wins (it tends to be cleaner).
const LENGTH_BAND: f64 = 0.2;

/// Minimum visible characters for a line to survive cleaning.
const MIN_LINE_CHARS: usize = 3;

const WECHAT_TITLE_SELECTORS: [&str; 4] =
    ["#activity-name", ".rich_media_title", "h1", "title"];
const WECHAT_CONTENT_SELECTORS: [&str; 3] =
    ["#js_content", ".rich_media_content", ".article-content"];

/// Promotional/boilerplate line patterns removed from WeChat articles.
const UNWANTED_PATTERNS: [&str; 27] = [
    // Follow prompts
    r"点击.*?关注",
    r"长按.*?关注",
    r"扫码关注",
    r"关注.*?公众号",
    r"点击上方.*?关注",
    r"星标置顶",
    // Engagement prompts
    r"点击.*?阅读原文",
    r"在看点这里",
    r"分享点这里",
    r"点赞.*?在看",
    r"转发.*?朋友圈",
    // Cross-promotion
    r"推荐阅读",
    r"往期精彩",
    r"更多精彩内容",
    r"热门文章",
    r"相关阅读",
    // Legal boilerplate
    r"免责声明",
    r"版权声明",
    r"版权所有",
    r"转载请注明",
    // Business footer
    r"商务合作",
    r"投稿邮箱",
    r"联系我们",
    r"广告投放",
    // Structural markers
    r"——.*?节选自",
    r"来源[:：]",
    r"编辑[:：]",
];

fn unwanted_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        UNWANTED_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("valid cleaning pattern"))
            .collect()
    })
}

fn blank_run_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
}

#[derive(Debug, Clone)]
pub struct EngineResult {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct WechatExtraction {
    pub title: String,
    pub content: String,
    pub method: &'static str,
    pub original_word_count: usize,
    pub cleaning_ratio: f64,
}

/// Run both engines, pick the better result, crop to the author window
/// when one applies, then clean. Windowing must happen before cleaning:
/// the window markers themselves match the boilerplate patterns.
pub fn extract_dual_engine(
    html: &str,
    url: &str,
    window: Option<&AuthorWindowRule>,
) -> Result<WechatExtraction> {
    let readability = readability_engine(html, url);
    let selectors = selector_engine(html);

    let (picked, method) = select_engine(readability, selectors)?;
    let content = match window {
        Some(rule) => apply_author_window(&picked.content, rule),
        None => picked.content,
    };
    let original_len = content.chars().count();
    let cleaned = clean_content(&content);
    let cleaned_len = cleaned.chars().count();
    let cleaning_ratio = if original_len > 0 {
        (original_len - cleaned_len) as f64 / original_len as f64
    } else {
        0.0
    };

    Ok(WechatExtraction {
        title: picked.title,
        content: cleaned,
        method,
        original_word_count: original_len,
        cleaning_ratio,
    })
}

/// Engine A: Readability over the full document.
fn readability_engine(html: &str, url: &str) -> Option<EngineResult> {
    let parsed_url = Url::parse(url).ok();
    let config = TransformConfig {
        readability: true,
        main_content: true,
        return_format: ReturnFormat::Markdown,
        filter_images: true,
        filter_svg: true,
        clean_html: true,
    };
    let input = TransformInput {
        url: parsed_url.as_ref(),
        content: html.as_bytes(),
        screenshot_bytes: None,
        encoding: None,
        selector_config: None,
        ignore_tags: None,
    };
    let content = transform_content_input(input, &config);
    if content.trim().is_empty() {
        debug!(url, "Readability engine produced no content");
        return None;
    }
    let title = document_title(html).unwrap_or_default();
    Some(EngineResult {
        title,
        content: content.trim().to_string(),
    })
}

/// Engine B: the WeChat article container selectors.
fn selector_engine(html: &str) -> Option<EngineResult> {
    let doc = Html::parse_document(html);
    let content_el = WECHAT_CONTENT_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| doc.select(&sel).next())?;
    let content = visible_text(&content_el);
    if content.is_empty() {
        return None;
    }
    let title = document_title(html).unwrap_or_default();
    Some(EngineResult { title, content })
}

fn document_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    for raw in WECHAT_TITLE_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else { continue };
        if let Some(el) = doc.select(&selector).next() {
            let text: String = el.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Pick between the engines. Exactly one success uses it; two successes
/// compare lengths — within the band Readability wins, otherwise the longer
/// one does.
pub fn select_engine(
    readability: Option<EngineResult>,
    selectors: Option<EngineResult>,
) -> Result<(EngineResult, &'static str)> {
    match (readability, selectors) {
        (Some(a), None) => {
            info!("Engine selection: readability (selector engine failed)");
            Ok((a, "readability"))
        }
        (None, Some(b)) => {
            info!("Engine selection: wechat_selector (readability failed)");
            Ok((b, "wechat_selector"))
        }
        (None, None) => Err(ReprintError::Extraction(
            "both extraction engines failed".into(),
        )),
        (Some(a), Some(b)) => {
            let a_len = a.content.chars().count();
            let b_len = b.content.chars().count();
            let longest = a_len.max(b_len).max(1);
            let diff = a_len.abs_diff(b_len) as f64 / longest as f64;
            if diff < LENGTH_BAND || a_len >= b_len {
                info!(a_len, b_len, "Engine selection: readability");
                Ok((a, "readability"))
            } else {
                info!(a_len, b_len, "Engine selection: wechat_selector");
                Ok((b, "wechat_selector"))
            }
        }
    }
}

/// Strip boilerplate lines: promotional patterns, lines under three visible
/// characters, pure-symbol lines; then collapse long blank runs.
pub fn clean_content(content: &str) -> String {
    let mut kept = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.chars().count() < MIN_LINE_CHARS {
            continue;
        }
        if line.chars().all(|c| !c.is_alphanumeric()) {
            continue;
        }
        if unwanted_patterns().iter().any(|p| p.is_match(line)) {
            debug!(%line, "Dropping boilerplate line");
            continue;
        }
        kept.push(line);
    }
    let joined = kept.join("\n");
    blank_run_pattern().replace_all(&joined, "\n\n").trim().to_string()
}

/// Crop content to the window between an account's start and end markers.
pub fn apply_author_window(content: &str, rule: &AuthorWindowRule) -> String {
    let start = content.find(&rule.content_start_marker);
    let end = content.find(&rule.content_end_marker);

    let (Some(start), Some(end)) = (start, end) else {
        debug!("Window markers not found");
        return if rule.fallback_to_full {
            content.to_string()
        } else {
            String::new()
        };
    };
    if start >= end {
        debug!("Start marker after end marker");
        return if rule.fallback_to_full {
            content.to_string()
        } else {
            String::new()
        };
    }

    let cropped = if rule.include_markers {
        &content[start..end + rule.content_end_marker.len()]
    } else {
        &content[start + rule.content_start_marker.len()..end]
    };
    cropped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(content: &str) -> EngineResult {
        EngineResult {
            title: "t".into(),
            content: content.into(),
        }
    }

    #[test]
    fn single_successful_engine_is_used() {
        let (picked, method) = select_engine(Some(result("aaa")), None).unwrap();
        assert_eq!(method, "readability");
        assert_eq!(picked.content, "aaa");

        let (picked, method) = select_engine(None, Some(result("bbb"))).unwrap();
        assert_eq!(method, "wechat_selector");
        assert_eq!(picked.content, "bbb");
    }

    #[test]
    fn both_failing_is_an_error() {
        assert!(select_engine(None, None).is_err());
    }

    #[test]
    fn close_lengths_prefer_readability() {
        // 8400 vs 8100 chars: 3.6% apart, inside the 20% band.
        let a = result(&"甲".repeat(8400));
        let b = result(&"乙".repeat(8100));
        let (picked, method) = select_engine(Some(a), Some(b)).unwrap();
        assert_eq!(method, "readability");
        assert_eq!(picked.content.chars().count(), 8400);
    }

    #[test]
    fn distant_lengths_prefer_the_longer() {
        let a = result(&"甲".repeat(1000));
        let b = result(&"乙".repeat(5000));
        let (picked, method) = select_engine(Some(a), Some(b)).unwrap();
        assert_eq!(method, "wechat_selector");
        assert_eq!(picked.content.chars().count(), 5000);

        // Longer readability also wins outside the band.
        let a = result(&"甲".repeat(5000));
        let b = result(&"乙".repeat(1000));
        let (_, method) = select_engine(Some(a), Some(b)).unwrap();
        assert_eq!(method, "readability");
    }

    #[test]
    fn cleaning_strips_boilerplate_lines() {
        let raw = "这是正文的第一段，讲了一些内容\n\
                   点击上方蓝字关注我们\n\
                   扫码关注获取更多\n\
                   这是正文的第二段\n\
                   ……\n\
                   ab\n\
                   版权声明：本文版权归原作者\n\
                   商务合作请联系邮箱";
        let cleaned = clean_content(raw);
        assert!(cleaned.contains("第一段"));
        assert!(cleaned.contains("第二段"));
        assert!(!cleaned.contains("关注"));
        assert!(!cleaned.contains("版权"));
        assert!(!cleaned.contains("商务合作"));
        assert!(!cleaned.contains("ab"));
        assert!(!cleaned.contains("……"));
    }

    #[test]
    fn cleaning_ratio_matches_lengths() {
        let body = "正".repeat(100);
        let raw = format!("{body}\n点击关注我们的公众号");
        let extraction_len_before = raw.chars().count();
        let cleaned = clean_content(&raw);
        assert_eq!(cleaned.chars().count(), 100);
        assert!(extraction_len_before > 100);
    }

    #[test]
    fn author_window_crops_between_markers() {
        let rule = AuthorWindowRule {
            content_start_marker: "下方小卡片关注 星标置顶".into(),
            content_end_marker: "——节选自舞林攻略".into(),
            include_markers: false,
            fallback_to_full: true,
        };
        let content = "开头广告 下方小卡片关注 星标置顶 这里才是正文内容 ——节选自舞林攻略 结尾推广";
        assert_eq!(apply_author_window(content, &rule), "这里才是正文内容");
    }

    #[test]
    fn author_window_includes_markers_when_asked() {
        let rule = AuthorWindowRule {
            content_start_marker: "A".into(),
            content_end_marker: "B".into(),
            include_markers: true,
            fallback_to_full: true,
        };
        assert_eq!(apply_author_window("xxAyyBzz", &rule), "AyyB");
    }

    #[test]
    fn author_window_missing_marker_falls_back() {
        let rule = AuthorWindowRule {
            content_start_marker: "不存在".into(),
            content_end_marker: "也不存在".into(),
            include_markers: false,
            fallback_to_full: true,
        };
        assert_eq!(apply_author_window("原文内容", &rule), "原文内容");

        let strict = AuthorWindowRule {
            fallback_to_full: false,
            ..rule
        };
        assert_eq!(apply_author_window("原文内容", &strict), "");
    }

    #[test]
    fn selector_engine_reads_wechat_container() {
        let html = r#"<html><body>
            <h1 id="activity-name"> 文章标题 </h1>
            <div id="js_content"><p>正文第一段</p><p>正文第二段</p></div>
        </body></html>"#;
        let result = selector_engine(html).unwrap();
        assert_eq!(result.title, "文章标题");
        assert!(result.content.contains("正文第一段"));
        assert!(result.content.contains("正文第二段"));
    }

    #[test]
    fn selector_engine_fails_without_container() {
        assert!(selector_engine("<html><body><p>x</p></body></html>").is_none());
    }
}
