//! Site rule bundles: how to recognize a site, log into it, and extract
//! articles from it. Rules come from config, merged over the built-in set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRule {
    pub name: String,
    pub domain: String,
    #[serde(default)]
    pub requires_login: bool,
    #[serde(default)]
    pub login: Option<LoginConfig>,
    pub extraction: ExtractionRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    pub login_url: String,
    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    #[serde(default)]
    pub success_indicators: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionRule {
    #[serde(default)]
    pub title_selectors: Vec<String>,
    #[serde(default)]
    pub content_selectors: Vec<String>,
    #[serde(default)]
    pub author_selectors: Vec<String>,
    #[serde(default)]
    pub time_selectors: Vec<String>,
    #[serde(default)]
    pub exclude_selectors: Vec<String>,
    /// Thread-style sites: container of the first topic post. Replies are
    /// removed before extraction.
    #[serde(default)]
    pub main_post_selector: Option<String>,
    /// Account-specific content windows, keyed by author display name.
    #[serde(default)]
    pub author_based_rules: HashMap<String, AuthorWindowRule>,
}

/// Crop extracted content to the substring between two markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorWindowRule {
    pub content_start_marker: String,
    pub content_end_marker: String,
    #[serde(default)]
    pub include_markers: bool,
    #[serde(default = "default_true")]
    pub fallback_to_full: bool,
}

fn default_true() -> bool {
    true
}

fn svec(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Built-in rules for the sites the pipeline ships with. User-provided
/// `sites` entries override these key by key.
pub fn default_rules() -> HashMap<String, SiteRule> {
    let mut rules = HashMap::new();

    rules.insert(
        "linux.do".to_string(),
        SiteRule {
            name: "Linux.do".to_string(),
            domain: "linux.do".to_string(),
            requires_login: true,
            login: Some(LoginConfig {
                login_url: "https://linux.do/login".to_string(),
                username_selector: "#login-account-name".to_string(),
                password_selector: "#login-account-password".to_string(),
                submit_selector: "#login-button".to_string(),
                success_indicators: svec(&[
                    ".header-dropdown-toggle",
                    ".current-user",
                    ".user-menu",
                ]),
                username: String::new(),
                password: String::new(),
            }),
            extraction: ExtractionRule {
                title_selectors: svec(&[
                    "a.fancy-title span[dir='auto']",
                    ".fancy-title span[dir='auto']",
                    "h1",
                ]),
                main_post_selector: Some(
                    "#post_1, .topic-post:first-child, [data-post-number='1']".to_string(),
                ),
                content_selectors: svec(&[".cooked"]),
                author_selectors: svec(&[
                    ".topic-meta-data .creator a",
                    ".names .first a",
                    ".topic-avatar .username",
                    ".post .username",
                ]),
                time_selectors: svec(&[
                    ".topic-meta-data .created-at",
                    ".post-date",
                    ".relative-date",
                    "time.relative-date",
                ]),
                exclude_selectors: svec(&[
                    ".nav",
                    ".header",
                    ".footer",
                    ".sidebar",
                    ".aside",
                    ".comments",
                    ".replies",
                    ".user-info",
                    ".avatar",
                    ".controls",
                    ".buttons",
                    ".topic-map",
                    ".suggested-topics",
                    ".topic-footer-buttons",
                    ".post-menu-area",
                    ".topic-navigation",
                    ".quote-controls",
                    ".post-controls",
                    ".user-card",
                    ".topic-status-info",
                    ".topic-post:not(:first-child)",
                    "[data-post-number]:not([data-post-number='1'])",
                    ".post-stream .topic-post:not(:first-child)",
                    ".timeline-container",
                    ".topic-timeline",
                    ".progress-wrapper",
                    ".topic-footer-main-buttons",
                    ".suggested-topics-wrapper",
                    ".more-topics",
                ]),
                author_based_rules: HashMap::new(),
            },
        },
    );

    rules.insert(
        "nodeseek.com".to_string(),
        SiteRule {
            name: "NodeSeek".to_string(),
            domain: "nodeseek.com".to_string(),
            requires_login: true,
            login: Some(LoginConfig {
                login_url: "https://www.nodeseek.com/signIn.html".to_string(),
                username_selector: "input[name='username']".to_string(),
                password_selector: "input[name='password']".to_string(),
                submit_selector: "button[type='submit']".to_string(),
                success_indicators: svec(&[".user-menu", ".logout", ".user-avatar"]),
                username: String::new(),
                password: String::new(),
            }),
            extraction: ExtractionRule {
                content_selectors: svec(&[".post-content", ".message-content", ".content"]),
                title_selectors: svec(&["h1.title", ".post-title", "h1"]),
                author_selectors: svec(&[".author-name", ".username", ".user-info .name"]),
                time_selectors: svec(&[".post-time", ".created-time", "time"]),
                exclude_selectors: svec(&[
                    ".sidebar",
                    ".navigation",
                    ".footer",
                    ".ads",
                    ".comments-section",
                ]),
                main_post_selector: None,
                author_based_rules: HashMap::new(),
            },
        },
    );

    let mut wechat_author_rules = HashMap::new();
    wechat_author_rules.insert(
        "舞林攻略指南".to_string(),
        AuthorWindowRule {
            content_start_marker: "下方小卡片关注 星标置顶".to_string(),
            content_end_marker: "——节选自舞林攻略".to_string(),
            include_markers: false,
            fallback_to_full: true,
        },
    );
    rules.insert(
        "mp.weixin.qq.com".to_string(),
        SiteRule {
            name: "微信公众号".to_string(),
            domain: "mp.weixin.qq.com".to_string(),
            requires_login: false,
            login: None,
            extraction: ExtractionRule {
                content_selectors: svec(&[
                    "#js_content",
                    ".rich_media_content",
                    ".article-content",
                ]),
                title_selectors: svec(&["#activity-name", ".rich_media_title", "h1"]),
                author_selectors: svec(&[".rich_media_meta_nickname", ".author", "#js_name"]),
                time_selectors: svec(&["#publish_time", ".rich_media_meta_text", ".publish-time"]),
                exclude_selectors: svec(&[
                    ".rich_media_tool",
                    ".share_media",
                    ".qr_code_pc",
                    ".reward_area",
                    ".comment_area",
                ]),
                main_post_selector: None,
                author_based_rules: wechat_author_rules,
            },
        },
    );

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_cover_builtin_sites() {
        let rules = default_rules();
        assert!(rules.contains_key("linux.do"));
        assert!(rules.contains_key("nodeseek.com"));
        assert!(rules.contains_key("mp.weixin.qq.com"));

        let linux = &rules["linux.do"];
        assert!(linux.requires_login);
        assert!(linux.login.is_some());
        assert!(linux.extraction.main_post_selector.is_some());

        let wechat = &rules["mp.weixin.qq.com"];
        assert!(!wechat.requires_login);
        assert!(wechat.extraction.author_based_rules.contains_key("舞林攻略指南"));
    }

    #[test]
    fn author_rule_defaults_fall_back_to_full() {
        let json = r#"{"content_start_marker": "a", "content_end_marker": "b"}"#;
        let rule: AuthorWindowRule = serde_json::from_str(json).unwrap();
        assert!(!rule.include_markers);
        assert!(rule.fallback_to_full);
    }
}
