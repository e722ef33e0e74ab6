//! Normalizes fetched HTML into an article. Per-site selector strategies
//! for forum-style sites, a dual-engine path for WeChat.
//!
//! The input HTML is never modified: all exclusion and cleanup happens on a
//! freshly parsed working tree.

use std::sync::Arc;

use lol_html::{element, rewrite_str, RewriteStrSettings};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use reprint_common::sites::ExtractionRule;
use reprint_common::{word_count, ArticleImage, ReprintError, Result};

use crate::sites::{DetectedSite, SiteRegistry};
use crate::wechat_extract;

const TITLE_FALLBACKS: [&str; 4] = ["h1", "title", ".title", ".post-title"];
const CONTENT_FALLBACKS: [&str; 5] =
    [".content", ".post-content", ".article-content", "article", ".post"];

#[derive(Debug, Clone)]
pub struct ExtractedArticle {
    pub url: String,
    pub title: String,
    /// Cleaned content. HTML for selector-path sites (inline structure
    /// preserved), plain text for WeChat.
    pub content: String,
    pub author: Option<String>,
    pub publish_time: Option<String>,
    pub word_count: usize,
    pub images: Vec<ArticleImage>,
    pub site_name: Option<String>,
    pub method: &'static str,
    /// WeChat only: size before the boilerplate cleaning pass.
    pub original_word_count: usize,
    /// WeChat only: fraction of content removed by cleaning.
    pub cleaning_ratio: f64,
}

pub struct ContentExtractor {
    registry: Arc<SiteRegistry>,
}

impl ContentExtractor {
    pub fn new(registry: Arc<SiteRegistry>) -> Self {
        ContentExtractor { registry }
    }

    pub fn extract(&self, html: &str, url: &str) -> Result<ExtractedArticle> {
        match self.registry.detect(url) {
            Some(site) if site.is_wechat() => self.extract_wechat(html, url, &site),
            Some(site) => {
                info!(url, site = %site.rule.name, "Extracting with site rule");
                extract_with_selectors(
                    html,
                    url,
                    &site.rule.extraction,
                    Some(site.rule.name.clone()),
                )
            }
            None => {
                warn!(url, "Unsupported site, using generic extraction");
                extract_with_selectors(html, url, &ExtractionRule::default(), None)
            }
        }
    }

    fn extract_wechat(&self, html: &str, url: &str, site: &DetectedSite) -> Result<ExtractedArticle> {
        let rule = &site.rule.extraction;
        let author = first_text(&Html::parse_document(html), &rule.author_selectors);
        // Account-specific content window, keyed by author name.
        let window = author
            .as_deref()
            .and_then(|a| rule.author_based_rules.get(a));

        match wechat_extract::extract_dual_engine(html, url, window) {
            Ok(result) => {
                let content = result.content;
                let wc = word_count(&content);
                info!(
                    url,
                    method = result.method,
                    word_count = wc,
                    cleaning_ratio = format!("{:.3}", result.cleaning_ratio),
                    "WeChat extraction complete"
                );
                Ok(ExtractedArticle {
                    url: url.to_string(),
                    title: result.title,
                    content,
                    author,
                    publish_time: None,
                    word_count: wc,
                    images: Vec::new(),
                    site_name: Some(site.rule.name.clone()),
                    method: result.method,
                    original_word_count: result.original_word_count,
                    cleaning_ratio: result.cleaning_ratio,
                })
            }
            Err(e) => {
                // Last resort: the plain selector path over the same rule.
                warn!(url, error = %e, "Dual-engine extraction failed, falling back to selectors");
                extract_with_selectors(html, url, rule, Some(site.rule.name.clone()))
            }
        }
    }
}

/// The per-site selector strategy shared by forum-style and generic sites.
pub(crate) fn extract_with_selectors(
    html: &str,
    url: &str,
    rule: &ExtractionRule,
    site_name: Option<String>,
) -> Result<ExtractedArticle> {
    let base = Url::parse(url).ok();
    let mut doc = Html::parse_document(html);
    detach_matching(&mut doc, &rule.exclude_selectors);

    let title = first_text_of(&doc, rule.title_selectors.iter().map(String::as_str))
        .or_else(|| first_text_of(&doc, TITLE_FALLBACKS))
        .unwrap_or_default();

    let content_el = find_content_element(&doc, rule);
    let (content, text, images) = match content_el {
        Some(el) => {
            let fragment = normalize_image_sources(&el.inner_html(), base.as_ref());
            (fragment, visible_text(&el), collect_images(&el, base.as_ref()))
        }
        None => (String::new(), String::new(), Vec::new()),
    };

    if title.is_empty() && text.is_empty() {
        return Err(ReprintError::Extraction(format!(
            "no usable title or content at {url}"
        )));
    }

    let author = first_text(&doc, &rule.author_selectors);
    let publish_time = first_time(&doc, &rule.time_selectors);
    let wc = word_count(&text);

    Ok(ExtractedArticle {
        url: url.to_string(),
        title,
        content,
        author,
        publish_time,
        word_count: wc,
        images,
        site_name,
        method: "selector",
        original_word_count: wc,
        cleaning_ratio: 0.0,
    })
}

/// Remove everything matching the exclude selectors from the working tree.
fn detach_matching(doc: &mut Html, selectors: &[String]) {
    for raw in selectors {
        let Some(selector) = parse_selector(raw) else { continue };
        let ids: Vec<_> = doc.select(&selector).map(|el| el.id()).collect();
        for id in ids {
            if let Some(mut node) = doc.tree.get_mut(id) {
                node.detach();
            }
        }
    }
}

/// Locate the content element: within the first main-post container when the
/// rule defines one (thread-style sites), otherwise across the whole tree
/// with the common fallbacks.
fn find_content_element<'a>(doc: &'a Html, rule: &ExtractionRule) -> Option<ElementRef<'a>> {
    if let Some(main_sel) = rule.main_post_selector.as_deref() {
        if let Some(main_post) = find_element_of(doc, std::iter::once(main_sel)) {
            for raw in &rule.content_selectors {
                let Some(selector) = parse_selector(raw) else { continue };
                if let Some(el) = main_post.select(&selector).next() {
                    return Some(el);
                }
            }
            // No inner match: the whole main post is the content.
            return Some(main_post);
        }
        warn!("Main post container not found, falling back to page-level selectors");
    }
    find_element_of(doc, rule.content_selectors.iter().map(String::as_str))
        .or_else(|| find_element_of(doc, CONTENT_FALLBACKS))
}

fn parse_selector(raw: &str) -> Option<Selector> {
    match Selector::parse(raw) {
        Ok(selector) => Some(selector),
        Err(e) => {
            debug!(selector = raw, error = %e, "Invalid CSS selector, skipping");
            None
        }
    }
}

fn find_element_of<'a, 'b>(
    doc: &'a Html,
    selectors: impl IntoIterator<Item = &'b str>,
) -> Option<ElementRef<'a>> {
    selectors
        .into_iter()
        .filter_map(parse_selector)
        .find_map(|sel| doc.select(&sel).next())
}

fn first_text(doc: &Html, selectors: &[String]) -> Option<String> {
    first_text_of(doc, selectors.iter().map(String::as_str))
}

fn first_text_of<'a, 'b>(
    doc: &'a Html,
    selectors: impl IntoIterator<Item = &'b str>,
) -> Option<String> {
    for raw in selectors {
        let Some(selector) = parse_selector(raw) else { continue };
        for el in doc.select(&selector) {
            let text = visible_text(&el);
            if !text.is_empty() {
                return Some(text.split_whitespace().collect::<Vec<_>>().join(" "));
            }
        }
    }
    None
}

/// Publish time: a `datetime` attribute wins over element text.
fn first_time(doc: &Html, selectors: &[String]) -> Option<String> {
    for raw in selectors {
        let Some(selector) = parse_selector(raw) else { continue };
        for el in doc.select(&selector) {
            if let Some(dt) = el.value().attr("datetime") {
                if !dt.is_empty() {
                    return Some(dt.to_string());
                }
            }
            let text = visible_text(&el);
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Line-preserving visible text of an element.
pub(crate) fn visible_text(el: &ElementRef) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rewrite `img` tags in an extracted fragment: prefer lazy-load attributes
/// over `src`, and absolutize protocol- and root-relative URLs.
pub(crate) fn normalize_image_sources(fragment: &str, base: Option<&Url>) -> String {
    let result = rewrite_str(
        fragment,
        RewriteStrSettings {
            element_content_handlers: vec![element!("img", |el| {
                let src = el
                    .get_attribute("data-src")
                    .or_else(|| el.get_attribute("data-original"))
                    .or_else(|| el.get_attribute("src"));
                if let Some(src) = src {
                    if let Some(abs) = absolutize(&src, base) {
                        let _ = el.set_attribute("src", &abs);
                    }
                }
                el.remove_attribute("data-src");
                el.remove_attribute("data-original");
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    );
    match result {
        Ok(rewritten) => rewritten,
        Err(e) => {
            debug!(error = %e, "Image rewrite failed, keeping fragment as-is");
            fragment.to_string()
        }
    }
}

fn absolutize(src: &str, base: Option<&Url>) -> Option<String> {
    if src.starts_with("http://") || src.starts_with("https://") {
        return Some(src.to_string());
    }
    if let Some(rest) = src.strip_prefix("//") {
        let scheme = base.map(|b| b.scheme()).unwrap_or("https");
        return Some(format!("{scheme}://{rest}"));
    }
    let base = base?;
    if src.starts_with('/') {
        return Some(format!("{}://{}{}", base.scheme(), base.host_str()?, src));
    }
    base.join(src).ok().map(|u| u.to_string())
}

/// Images inside the content element, in document order.
fn collect_images(el: &ElementRef, base: Option<&Url>) -> Vec<ArticleImage> {
    let Some(img_sel) = parse_selector("img") else { return Vec::new() };
    el.select(&img_sel)
        .filter_map(|img| {
            let v = img.value();
            let src = v
                .attr("data-src")
                .or_else(|| v.attr("data-original"))
                .or_else(|| v.attr("src"))?;
            let url = absolutize(src, base)?;
            Some(ArticleImage {
                url,
                alt: nonempty_attr(v.attr("alt")),
                title: nonempty_attr(v.attr("title")),
                width: nonempty_attr(v.attr("width")),
                height: nonempty_attr(v.attr("height")),
            })
        })
        .collect()
}

fn nonempty_attr(attr: Option<&str>) -> Option<String> {
    attr.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reprint_common::sites::default_rules;

    const TOPIC_HTML: &str = r#"
        <html><head><title>Page title</title></head><body>
        <a class="fancy-title"><span dir="auto">真正的标题</span></a>
        <div class="post-stream">
            <div class="topic-post" data-post-number="1" id="post_1">
                <div class="cooked">
                    <p>主贴正文第一段</p>
                    <img data-src="//cdn.linux.do/a.png" alt="screenshot">
                    <p>第二段</p>
                </div>
            </div>
            <div class="topic-post" data-post-number="2">
                <div class="cooked"><p>一楼回复，不应出现</p></div>
            </div>
        </div>
        <div class="suggested-topics">建议话题</div>
        </body></html>
    "#;

    fn linux_rule() -> ExtractionRule {
        default_rules().remove("linux.do").unwrap().extraction
    }

    #[test]
    fn extracts_main_post_excluding_replies() {
        let article = extract_with_selectors(
            TOPIC_HTML,
            "https://linux.do/t/topic/1",
            &linux_rule(),
            Some("Linux.do".into()),
        )
        .unwrap();

        assert_eq!(article.title, "真正的标题");
        assert!(article.content.contains("主贴正文第一段"));
        assert!(!article.content.contains("一楼回复"));
        assert!(!article.content.contains("建议话题"));
        assert_eq!(article.method, "selector");
        assert_eq!(article.site_name.as_deref(), Some("Linux.do"));
    }

    #[test]
    fn images_are_normalized_and_collected() {
        let article = extract_with_selectors(
            TOPIC_HTML,
            "https://linux.do/t/topic/1",
            &linux_rule(),
            None,
        )
        .unwrap();

        assert!(article.content.contains(r#"src="https://cdn.linux.do/a.png""#));
        assert!(!article.content.contains("data-src"));
        assert_eq!(article.images.len(), 1);
        assert_eq!(article.images[0].url, "https://cdn.linux.do/a.png");
        assert_eq!(article.images[0].alt.as_deref(), Some("screenshot"));
    }

    #[test]
    fn word_count_counts_non_whitespace_of_visible_text() {
        let article = extract_with_selectors(
            TOPIC_HTML,
            "https://linux.do/t/topic/1",
            &linux_rule(),
            None,
        )
        .unwrap();
        // 主贴正文第一段 (7) + 第二段 (3)
        assert_eq!(article.word_count, 10);
    }

    #[test]
    fn generic_fallback_selectors_apply_without_a_rule() {
        let html = r#"<html><body>
            <h1>Generic title</h1>
            <article><p>generic body text</p></article>
        </body></html>"#;
        let article = extract_with_selectors(
            html,
            "https://example.com/post",
            &ExtractionRule::default(),
            None,
        )
        .unwrap();
        assert_eq!(article.title, "Generic title");
        assert!(article.content.contains("generic body text"));
    }

    #[test]
    fn no_title_and_no_content_is_an_extraction_error() {
        let err = extract_with_selectors(
            "<html><body><nav>menu</nav></body></html>",
            "https://example.com/x",
            &ExtractionRule::default(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ReprintError::Extraction(_)));
    }

    #[test]
    fn time_prefers_datetime_attribute() {
        let html = r#"<html><body>
            <h1>t</h1>
            <div class="content">body</div>
            <time class="post-time" datetime="2024-05-01T10:00:00Z">昨天</time>
        </body></html>"#;
        let mut rule = ExtractionRule::default();
        rule.title_selectors = vec!["h1".into()];
        rule.content_selectors = vec![".content".into()];
        rule.time_selectors = vec![".post-time".into()];
        let article =
            extract_with_selectors(html, "https://example.com/x", &rule, None).unwrap();
        assert_eq!(article.publish_time.as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[test]
    fn absolutize_variants() {
        let base = Url::parse("https://linux.do/t/topic/1").unwrap();
        assert_eq!(
            absolutize("//cdn.x.com/a.png", Some(&base)).unwrap(),
            "https://cdn.x.com/a.png"
        );
        assert_eq!(
            absolutize("/uploads/a.png", Some(&base)).unwrap(),
            "https://linux.do/uploads/a.png"
        );
        assert_eq!(
            absolutize("https://x.com/a.png", Some(&base)).unwrap(),
            "https://x.com/a.png"
        );
        assert_eq!(
            absolutize("img/a.png", Some(&base)).unwrap(),
            "https://linux.do/t/topic/img/a.png"
        );
    }

    #[test]
    fn wechat_extraction_through_the_registry() {
        let html = r#"<html><head><title>页面</title></head><body>
            <h1 id="activity-name">微信文章标题</h1>
            <div id="js_name">某公众号</div>
            <div id="js_content">
                <p>这是一篇测试文章的正文内容，长度足够被提取器接受。</p>
                <p>第二段也有一些实际内容在这里。</p>
                <p>点击上方蓝字关注我们</p>
            </div>
        </body></html>"#;
        let registry = Arc::new(SiteRegistry::new(default_rules()).unwrap());
        let extractor = ContentExtractor::new(registry);

        let article = extractor
            .extract(html, "https://mp.weixin.qq.com/s/AAA")
            .unwrap();
        assert_eq!(article.title, "微信文章标题");
        assert!(article.content.contains("测试文章的正文内容"));
        // The follow-us line is boilerplate and must be cleaned out.
        assert!(!article.content.contains("关注我们"));
        assert!(article.word_count > 0);
        assert!(article.original_word_count >= article.word_count);
        assert_eq!(article.site_name.as_deref(), Some("微信公众号"));
    }

    #[test]
    fn wechat_author_window_is_applied_from_the_site_rule() {
        let html = r#"<html><body>
            <h1 id="activity-name">标题</h1>
            <div id="js_name">舞林攻略指南</div>
            <div id="js_content">
                <p>开头的广告语在这里</p>
                <p>下方小卡片关注 星标置顶</p>
                <p>这一段才是真正想要的正文内容</p>
                <p>——节选自舞林攻略</p>
                <p>结尾的推广内容</p>
            </div>
        </body></html>"#;
        let registry = Arc::new(SiteRegistry::new(default_rules()).unwrap());
        let extractor = ContentExtractor::new(registry);

        let article = extractor
            .extract(html, "https://mp.weixin.qq.com/s/BBB")
            .unwrap();
        assert_eq!(article.author.as_deref(), Some("舞林攻略指南"));
        assert!(article.content.contains("真正想要的正文内容"));
        assert!(!article.content.contains("广告语"));
        assert!(!article.content.contains("推广内容"));
    }

    #[test]
    fn repeated_extraction_is_deterministic() {
        let a = extract_with_selectors(
            TOPIC_HTML,
            "https://linux.do/t/topic/1",
            &linux_rule(),
            None,
        )
        .unwrap();
        let b = extract_with_selectors(
            TOPIC_HTML,
            "https://linux.do/t/topic/1",
            &linux_rule(),
            None,
        )
        .unwrap();
        assert_eq!(a.title, b.title);
        assert_eq!(a.content, b.content);
        assert_eq!(a.word_count, b.word_count);
    }
}
