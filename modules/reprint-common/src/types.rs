use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Where an article was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "wechat")]
    Wechat,
    #[serde(rename = "linux.do")]
    LinuxDo,
    #[serde(rename = "nodeseek.com")]
    NodeSeek,
    #[serde(rename = "external")]
    External,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Wechat => "wechat",
            SourceType::LinuxDo => "linux.do",
            SourceType::NodeSeek => "nodeseek.com",
            SourceType::External => "external",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wechat" => Some(SourceType::Wechat),
            "linux.do" => Some(SourceType::LinuxDo),
            "nodeseek.com" => Some(SourceType::NodeSeek),
            "external" => Some(SourceType::External),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crawl lifecycle of an article row. Terminal states may re-enter
/// `Crawling` on an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Pending,
    Crawling,
    Completed,
    Failed,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Pending => "pending",
            CrawlStatus::Crawling => "crawling",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CrawlStatus::Pending),
            "crawling" => Some(CrawlStatus::Crawling),
            "completed" => Some(CrawlStatus::Completed),
            "failed" => Some(CrawlStatus::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: CrawlStatus) -> bool {
        use CrawlStatus::*;
        matches!(
            (self, next),
            (Pending, Crawling)
                // A row left in crawling by an interrupted run is re-claimed.
                | (Crawling, Crawling)
                | (Crawling, Completed)
                | (Crawling, Failed)
                | (Completed, Crawling)
                | (Failed, Crawling)
        )
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image referenced inside an article body, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<String>,
}

/// Canonical article row. One per (source_type, article_url).
#[derive(Debug, Clone)]
pub struct Article {
    pub id: i64,
    pub source_type: SourceType,
    pub source_name: String,
    pub title: String,
    pub article_url: String,
    pub author: Option<String>,
    pub publish_timestamp: Option<NaiveDateTime>,
    pub crawl_status: CrawlStatus,
    pub crawl_attempts: u32,
    pub crawl_error: Option<String>,
    pub crawled_at: Option<NaiveDateTime>,
    pub content: Option<String>,
    pub word_count: u32,
    pub images: Vec<ArticleImage>,
    pub site_name: Option<String>,
    /// false = not yet published to the forum (failed publishes stay false
    /// and remain retryable), true = published.
    pub forum_published: bool,
    pub fetched_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl Article {
    pub fn has_content(&self) -> bool {
        self.content.as_deref().map(|c| !c.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_round_trip() {
        for st in [
            SourceType::Wechat,
            SourceType::LinuxDo,
            SourceType::NodeSeek,
            SourceType::External,
        ] {
            assert_eq!(SourceType::parse(st.as_str()), Some(st));
        }
        assert_eq!(SourceType::parse("rss"), None);
    }

    #[test]
    fn crawl_status_transitions() {
        use CrawlStatus::*;
        assert!(Pending.can_transition_to(Crawling));
        assert!(Crawling.can_transition_to(Completed));
        assert!(Crawling.can_transition_to(Failed));
        // Explicit retry re-enters crawling from both terminal states, and
        // an interrupted crawl can be re-claimed.
        assert!(Completed.can_transition_to(Crawling));
        assert!(Failed.can_transition_to(Crawling));
        assert!(Crawling.can_transition_to(Crawling));
        // No skipping straight to terminal states.
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
    }
}
