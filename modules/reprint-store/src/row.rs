//! Row mapping between the `articles` table and the domain `Article`.

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::debug;

use reprint_common::{Article, ArticleImage, CrawlStatus, SourceType};

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ArticleRow {
    pub id: i64,
    pub source_type: String,
    pub source_name: String,
    pub title: String,
    pub article_url: String,
    pub author: Option<String>,
    pub publish_timestamp: Option<NaiveDateTime>,
    pub crawl_status: String,
    pub crawl_attempts: u32,
    pub crawl_error: Option<String>,
    pub crawled_at: Option<NaiveDateTime>,
    pub content: Option<String>,
    pub word_count: u32,
    pub images: Option<String>,
    pub site_name: Option<String>,
    pub forum_published: Option<i8>,
    pub fetched_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    #[allow(dead_code)]
    pub created_at: Option<NaiveDateTime>,
}

impl ArticleRow {
    pub(crate) fn into_article(self) -> Article {
        let images: Vec<ArticleImage> = match self.images.as_deref() {
            None | Some("") => Vec::new(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                debug!(id = self.id, error = %e, "Unparseable images column, ignoring");
                Vec::new()
            }),
        };
        Article {
            id: self.id,
            source_type: SourceType::parse(&self.source_type).unwrap_or(SourceType::External),
            source_name: self.source_name,
            title: self.title,
            article_url: self.article_url,
            author: self.author,
            publish_timestamp: self.publish_timestamp,
            crawl_status: CrawlStatus::parse(&self.crawl_status).unwrap_or(CrawlStatus::Pending),
            crawl_attempts: self.crawl_attempts,
            crawl_error: self.crawl_error,
            crawled_at: self.crawled_at,
            content: self.content,
            word_count: self.word_count,
            images,
            site_name: self.site_name,
            forum_published: self.forum_published == Some(1),
            fetched_at: self.fetched_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct StatsRow {
    pub source_type: String,
    pub total: i64,
    pub completed: Option<i64>,
    pub pending: Option<i64>,
    pub failed: Option<i64>,
    pub avg_word_count: Option<f64>,
    pub last_crawl_time: Option<NaiveDateTime>,
}

/// Per-source crawl statistics exposed by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub total: i64,
    pub completed: i64,
    pub pending: i64,
    pub failed: i64,
    pub avg_word_count: f64,
    pub last_crawl_time: Option<NaiveDateTime>,
}

impl StatsRow {
    pub(crate) fn into_stats(self) -> SourceStats {
        SourceStats {
            total: self.total,
            completed: self.completed.unwrap_or(0),
            pending: self.pending.unwrap_or(0),
            failed: self.failed.unwrap_or(0),
            avg_word_count: self.avg_word_count.unwrap_or(0.0),
            last_crawl_time: self.last_crawl_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ArticleRow {
        ArticleRow {
            id: 7,
            source_type: "wechat".into(),
            source_name: "舞林攻略指南".into(),
            title: "t".into(),
            article_url: "https://mp.weixin.qq.com/s/AAA".into(),
            author: None,
            publish_timestamp: None,
            crawl_status: "completed".into(),
            crawl_attempts: 1,
            crawl_error: None,
            crawled_at: None,
            content: Some("body".into()),
            word_count: 4,
            images: Some(r#"[{"url":"https://x/img.png","alt":"a"}]"#.into()),
            site_name: None,
            forum_published: None,
            fetched_at: None,
            updated_at: None,
            created_at: None,
        }
    }

    #[test]
    fn maps_row_to_article() {
        let article = row().into_article();
        assert_eq!(article.source_type, SourceType::Wechat);
        assert_eq!(article.crawl_status, CrawlStatus::Completed);
        assert_eq!(article.images.len(), 1);
        assert_eq!(article.images[0].url, "https://x/img.png");
        assert!(!article.forum_published);
        assert!(article.has_content());
    }

    #[test]
    fn garbage_images_column_is_ignored() {
        let mut r = row();
        r.images = Some("not json".into());
        assert!(r.into_article().images.is_empty());
    }

    #[test]
    fn unknown_source_type_falls_back_to_external() {
        let mut r = row();
        r.source_type = "rss".into();
        assert_eq!(r.into_article().source_type, SourceType::External);
    }
}
