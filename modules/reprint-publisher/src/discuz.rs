//! The four-table Discuz publish transaction.
//!
//! Thread and post ids are allocated MAX+1 inside the transaction, which is
//! only safe because executions never overlap (the engine enforces a single
//! run and publishes serially within it).

use std::time::Duration;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use tracing::info;

use reprint_common::config::{DatabaseConfig, ForumPublisherConfig};
use reprint_common::{Article, ReprintError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedIds {
    pub tid: u64,
    pub pid: u64,
}

pub struct DiscuzPublisher {
    pool: MySqlPool,
    config: ForumPublisherConfig,
}

impl DiscuzPublisher {
    pub fn new(pool: MySqlPool, config: ForumPublisherConfig) -> Self {
        DiscuzPublisher { pool, config }
    }

    pub async fn connect(db: &DatabaseConfig, config: ForumPublisherConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&db.url())
            .await
            .map_err(|e| ReprintError::Publish(format!("connect: {e}")))?;
        info!("Discuz database connected");
        Ok(DiscuzPublisher { pool, config })
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.config.table_prefix, name)
    }

    /// Insert one thread + first post and bump the forum and member
    /// counters, in a single transaction. Rolls back on any failure; the
    /// source row is untouched either way.
    pub async fn publish(&self, article: &Article) -> Result<PublishedIds> {
        let subject = article.title.clone();
        let message = prepare_content(article);
        let fid = self.config.target_forum_id;
        let author = self.config.publisher_username.clone();
        let authorid = self.config.publisher_user_id;
        let now = chrono::Utc::now().timestamp();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReprintError::Publish(format!("begin: {e}")))?;

        let max_tid: Option<u64> =
            sqlx::query_scalar(&format!("SELECT MAX(tid) FROM {}", self.table("forum_thread")))
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| ReprintError::Publish(format!("max tid: {e}")))?;
        let max_pid: Option<u64> =
            sqlx::query_scalar(&format!("SELECT MAX(pid) FROM {}", self.table("forum_post")))
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| ReprintError::Publish(format!("max pid: {e}")))?;
        let tid = max_tid.unwrap_or(0) + 1;
        let pid = max_pid.unwrap_or(0) + 1;

        let thread_sql = format!(
            r#"
            INSERT INTO {} (
                tid, fid, author, authorid, subject, dateline, lastpost, lastposter,
                views, replies, displayorder, digest, special, attachment, moderated,
                closed, stickreply, recommends, recommend_add, recommend_sub, heats,
                status, isgroup, favtimes, sharetimes, stamp, icon, pushedaid, cover,
                replycredit, relatebytag, maxposition, bgcolor, comments, hidden
            ) VALUES (
                ?, ?, ?, ?, ?, ?, ?, ?,
                0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0, 0, 0,
                0, 0, 0, 0, -1, -1, 0, 0,
                0, '', 1, '', 0, 0
            )
            "#,
            self.table("forum_thread")
        );
        sqlx::query(&thread_sql)
            .bind(tid)
            .bind(fid)
            .bind(&author)
            .bind(authorid)
            .bind(&subject)
            .bind(now)
            .bind(now)
            .bind(&author)
            .execute(&mut *tx)
            .await
            .map_err(|e| ReprintError::Publish(format!("insert thread: {e}")))?;

        let post_sql = format!(
            r#"
            INSERT INTO {} (
                pid, fid, tid, repid, first, author, authorid, subject, dateline,
                lastupdate, updateuid, premsg, message, useip, port, invisible,
                anonymous, usesig, htmlon, bbcodeoff, smileyoff, parseurloff,
                attachment, rate, ratetimes, status, tags, comment, replycredit, position
            ) VALUES (
                ?, ?, ?, 0, 1, ?, ?, ?, ?,
                0, 0, '', ?, '', 0, 0,
                0, 1, 0, 0, 0, 0,
                0, 0, 0, 0, '', 0, 0, 1
            )
            "#,
            self.table("forum_post")
        );
        sqlx::query(&post_sql)
            .bind(pid)
            .bind(fid)
            .bind(tid)
            .bind(&author)
            .bind(authorid)
            .bind(&subject)
            .bind(now)
            .bind(&message)
            .execute(&mut *tx)
            .await
            .map_err(|e| ReprintError::Publish(format!("insert post: {e}")))?;

        let forum_sql = format!(
            "UPDATE {} SET threads = threads + 1, posts = posts + 1, lastpost = ? WHERE fid = ?",
            self.table("forum_forum")
        );
        sqlx::query(&forum_sql)
            .bind(encode_lastpost(tid, &subject, now, &author))
            .bind(fid)
            .execute(&mut *tx)
            .await
            .map_err(|e| ReprintError::Publish(format!("update forum: {e}")))?;

        let member_sql = format!(
            "UPDATE {} SET posts = posts + 1, threads = threads + 1 WHERE uid = ?",
            self.table("common_member_count")
        );
        sqlx::query(&member_sql)
            .bind(authorid)
            .execute(&mut *tx)
            .await
            .map_err(|e| ReprintError::Publish(format!("update member counters: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| ReprintError::Publish(format!("commit: {e}")))?;

        info!(tid, pid, subject = %subject, "Article published to forum");
        Ok(PublishedIds { tid, pid })
    }
}

/// The post body is the article content verbatim; an empty body is
/// replaced by a one-line title reference.
pub fn prepare_content(article: &Article) -> String {
    match article.content.as_deref() {
        Some(content) if !content.trim().is_empty() => content.to_string(),
        _ => format!("文章标题：{}", article.title),
    }
}

/// Discuz encodes a forum's latest activity as a tab-separated tuple.
pub fn encode_lastpost(tid: u64, subject: &str, dateline: i64, author: &str) -> String {
    format!("{tid}\t{subject}\t{dateline}\t{author}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use reprint_common::{CrawlStatus, SourceType};

    fn article(content: Option<&str>) -> Article {
        Article {
            id: 1,
            source_type: SourceType::Wechat,
            source_name: "舞林攻略指南".into(),
            title: "t".into(),
            article_url: "https://mp.weixin.qq.com/s/AAA".into(),
            author: None,
            publish_timestamp: None,
            crawl_status: CrawlStatus::Completed,
            crawl_attempts: 1,
            crawl_error: None,
            crawled_at: None,
            content: content.map(String::from),
            word_count: 1,
            images: Vec::new(),
            site_name: None,
            forum_published: false,
            fetched_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn lastpost_tuple_encoding() {
        assert_eq!(
            encode_lastpost(10001, "t", 1700000000, "砂鱼"),
            "10001\tt\t1700000000\t砂鱼"
        );
    }

    #[test]
    fn content_is_taken_verbatim() {
        assert_eq!(prepare_content(&article(Some("c"))), "c");
    }

    #[test]
    fn empty_content_synthesizes_title_line() {
        assert_eq!(prepare_content(&article(None)), "文章标题：t");
        assert_eq!(prepare_content(&article(Some("  "))), "文章标题：t");
    }
}
