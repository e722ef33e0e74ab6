//! MySQL persistence for canonical article rows.
//!
//! The store is the only writer to the `articles` table and enforces the
//! crawl/publish state machines at this layer: callers cannot make an
//! illegal transition or mark an empty article completed.

mod row;

pub use row::SourceStats;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::NaiveDateTime;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use tracing::{info, warn};

use reprint_common::{
    Article, ArticleImage, CrawlStatus, ReprintError, Result, SourceType,
};
use row::{ArticleRow, StatsRow};

/// Attempts per store call before a transient error is surfaced.
const MAX_DB_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct ArticleStore {
    pool: MySqlPool,
}

impl ArticleStore {
    pub fn new(pool: MySqlPool) -> Self {
        ArticleStore { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| ReprintError::Database(format!("connect: {e}")))?;
        info!("Article store connected");
        Ok(ArticleStore { pool })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ReprintError::Database(format!("migrate: {e}")))?;
        Ok(())
    }

    /// Idempotent link registration. Existing rows keep their title and
    /// content; only `fetched_at` is refreshed (plus an empty title or
    /// source_name is filled in). Returns the row id either way.
    pub async fn upsert_link(
        &self,
        source_type: SourceType,
        url: &str,
        title: Option<&str>,
        publish_time: Option<NaiveDateTime>,
        source_name: Option<&str>,
    ) -> Result<i64> {
        let pool = self.pool.clone();
        let source_type = source_type.as_str();
        let url = url.to_string();
        let title = title.unwrap_or_default().to_string();
        let source_name = source_name.unwrap_or_default().to_string();

        let id = retrying("upsert_link", move || {
            let pool = pool.clone();
            let url = url.clone();
            let title = title.clone();
            let source_name = source_name.clone();
            async move {
                let result = sqlx::query(
                    r#"
                    INSERT INTO articles
                        (source_type, source_name, title, article_url,
                         publish_timestamp, crawl_status, crawl_attempts, fetched_at)
                    VALUES (?, ?, ?, ?, COALESCE(?, NOW()), 'pending', 0, NOW())
                    ON DUPLICATE KEY UPDATE
                        id = LAST_INSERT_ID(id),
                        fetched_at = NOW(),
                        title = IF(title = '' AND VALUES(title) <> '', VALUES(title), title),
                        source_name = IF(source_name = '', VALUES(source_name), source_name)
                    "#,
                )
                .bind(source_type)
                .bind(source_name)
                .bind(title)
                .bind(url)
                .bind(publish_time)
                .execute(&pool)
                .await?;
                Ok(result.last_insert_id() as i64)
            }
        })
        .await?;
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Article>> {
        let pool = self.pool.clone();
        let row = retrying("get", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, ArticleRow>("SELECT * FROM articles WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&pool)
                    .await
            }
        })
        .await?;
        Ok(row.map(ArticleRow::into_article))
    }

    pub async fn get_by_url(&self, source_type: SourceType, url: &str) -> Result<Option<Article>> {
        let pool = self.pool.clone();
        let source_type = source_type.as_str();
        let url = url.to_string();
        let row = retrying("get_by_url", move || {
            let pool = pool.clone();
            let url = url.clone();
            async move {
                sqlx::query_as::<_, ArticleRow>(
                    "SELECT * FROM articles WHERE source_type = ? AND article_url = ?",
                )
                .bind(source_type)
                .bind(url)
                .fetch_optional(&pool)
                .await
            }
        })
        .await?;
        Ok(row.map(ArticleRow::into_article))
    }

    /// Rows still needing a content crawl: status pending, or completed rows
    /// whose content was lost. Ordered by discovery time.
    pub async fn claim_pending(
        &self,
        source_type: Option<SourceType>,
        limit: u32,
    ) -> Result<Vec<Article>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let pool = self.pool.clone();
        let source_type = source_type.map(|s| s.as_str());
        let rows = retrying("claim_pending", move || {
            let pool = pool.clone();
            async move {
                match source_type {
                    Some(st) => {
                        sqlx::query_as::<_, ArticleRow>(
                            r#"
                            SELECT * FROM articles
                            WHERE (crawl_status = 'pending' OR content IS NULL OR content = '')
                              AND source_type = ?
                            ORDER BY fetched_at ASC
                            LIMIT ?
                            "#,
                        )
                        .bind(st)
                        .bind(limit)
                        .fetch_all(&pool)
                        .await
                    }
                    None => {
                        sqlx::query_as::<_, ArticleRow>(
                            r#"
                            SELECT * FROM articles
                            WHERE crawl_status = 'pending' OR content IS NULL OR content = ''
                            ORDER BY fetched_at ASC
                            LIMIT ?
                            "#,
                        )
                        .bind(limit)
                        .fetch_all(&pool)
                        .await
                    }
                }
            }
        })
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    /// pending/completed/failed -> crawling. Bumps the attempt counter.
    pub async fn mark_crawling(&self, id: i64) -> Result<()> {
        self.check_transition(id, CrawlStatus::Crawling).await?;
        let pool = self.pool.clone();
        retrying("mark_crawling", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE articles
                    SET crawl_status = 'crawling',
                        crawl_attempts = crawl_attempts + 1,
                        updated_at = NOW()
                    WHERE id = ?
                    "#,
                )
                .bind(id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// crawling -> completed. Rejects empty content (a completed article
    /// must have a body) and clears the last error.
    pub async fn mark_completed(
        &self,
        id: i64,
        title: &str,
        content: &str,
        word_count: u32,
        images: &[ArticleImage],
    ) -> Result<()> {
        if content.is_empty() {
            return Err(ReprintError::Database(format!(
                "article {id}: refusing to mark completed with empty content"
            )));
        }
        self.check_transition(id, CrawlStatus::Completed).await?;

        let pool = self.pool.clone();
        let title = title.to_string();
        let content = content.to_string();
        let images_json = serde_json::to_string(images)
            .map_err(|e| ReprintError::Database(format!("encoding images: {e}")))?;

        retrying("mark_completed", move || {
            let pool = pool.clone();
            let title = title.clone();
            let content = content.clone();
            let images_json = images_json.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE articles
                    SET crawl_status = 'completed',
                        title = IF(? <> '', ?, title),
                        content = ?,
                        word_count = ?,
                        images = ?,
                        crawl_error = NULL,
                        crawled_at = NOW(),
                        updated_at = NOW()
                    WHERE id = ?
                    "#,
                )
                .bind(title.clone())
                .bind(title)
                .bind(content)
                .bind(word_count)
                .bind(images_json)
                .bind(id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// crawling -> failed, recording the error message.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        self.check_transition(id, CrawlStatus::Failed).await?;
        let pool = self.pool.clone();
        let error = error.to_string();
        retrying("mark_failed", move || {
            let pool = pool.clone();
            let error = error.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE articles
                    SET crawl_status = 'failed',
                        crawl_error = ?,
                        updated_at = NOW()
                    WHERE id = ?
                    "#,
                )
                .bind(error)
                .bind(id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Completed articles not yet republished to the forum.
    pub async fn claim_unpublished(&self, limit: u32) -> Result<Vec<Article>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let pool = self.pool.clone();
        let rows = retrying("claim_unpublished", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, ArticleRow>(
                    r#"
                    SELECT * FROM articles
                    WHERE crawl_status = 'completed'
                      AND forum_published IS NULL
                      AND content IS NOT NULL
                      AND content <> ''
                    ORDER BY crawled_at ASC
                    LIMIT ?
                    "#,
                )
                .bind(limit)
                .fetch_all(&pool)
                .await
            }
        })
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    /// Record a successful forum publish. Only valid for completed articles
    /// with content; anything else is a state-machine violation.
    pub async fn mark_published(&self, id: i64) -> Result<()> {
        let article = self
            .get(id)
            .await?
            .ok_or_else(|| ReprintError::Database(format!("article {id} not found")))?;
        if article.crawl_status != CrawlStatus::Completed || !article.has_content() {
            return Err(ReprintError::Database(format!(
                "article {id}: cannot mark published (status {}, content {})",
                article.crawl_status,
                if article.has_content() { "present" } else { "empty" }
            )));
        }
        let pool = self.pool.clone();
        retrying("mark_published", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "UPDATE articles SET forum_published = 1, updated_at = NOW() WHERE id = ?",
                )
                .bind(id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Per-source crawl statistics.
    pub async fn stats(&self) -> Result<HashMap<String, SourceStats>> {
        let pool = self.pool.clone();
        let rows = retrying("stats", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, StatsRow>(
                    r#"
                    SELECT
                        source_type,
                        COUNT(*) AS total,
                        CAST(SUM(CASE WHEN crawl_status = 'completed' THEN 1 ELSE 0 END) AS SIGNED) AS completed,
                        CAST(SUM(CASE WHEN crawl_status = 'pending' THEN 1 ELSE 0 END) AS SIGNED) AS pending,
                        CAST(SUM(CASE WHEN crawl_status = 'failed' THEN 1 ELSE 0 END) AS SIGNED) AS failed,
                        CAST(AVG(word_count) AS DOUBLE) AS avg_word_count,
                        MAX(crawled_at) AS last_crawl_time
                    FROM articles
                    GROUP BY source_type
                    "#,
                )
                .fetch_all(&pool)
                .await
            }
        })
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.source_type.clone(), r.into_stats()))
            .collect())
    }

    /// Count of rows the content_crawl step would pick up.
    pub async fn count_pending(&self, source_type: Option<SourceType>) -> Result<u64> {
        let pool = self.pool.clone();
        let source_type = source_type.map(|s| s.as_str());
        let count = retrying("count_pending", move || {
            let pool = pool.clone();
            async move {
                match source_type {
                    Some(st) => {
                        sqlx::query_scalar::<_, i64>(
                            r#"
                            SELECT COUNT(*) FROM articles
                            WHERE (crawl_status = 'pending' OR content IS NULL OR content = '')
                              AND source_type = ?
                            "#,
                        )
                        .bind(st)
                        .fetch_one(&pool)
                        .await
                    }
                    None => {
                        sqlx::query_scalar::<_, i64>(
                            r#"
                            SELECT COUNT(*) FROM articles
                            WHERE crawl_status = 'pending' OR content IS NULL OR content = ''
                            "#,
                        )
                        .fetch_one(&pool)
                        .await
                    }
                }
            }
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Count of rows the forum_publish step would pick up.
    pub async fn count_unpublished(&self) -> Result<u64> {
        let pool = self.pool.clone();
        let count = retrying("count_unpublished", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    SELECT COUNT(*) FROM articles
                    WHERE crawl_status = 'completed'
                      AND forum_published IS NULL
                      AND content IS NOT NULL
                      AND content <> ''
                    "#,
                )
                .fetch_one(&pool)
                .await
            }
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    /// (total rows, latest fetched_at) for one tracked account. Drives the
    /// link_crawl gate.
    pub async fn account_fetch_summary(
        &self,
        source_name: &str,
    ) -> Result<(u64, Option<NaiveDateTime>)> {
        let pool = self.pool.clone();
        let source_name = source_name.to_string();
        let row = retrying("account_fetch_summary", move || {
            let pool = pool.clone();
            let source_name = source_name.clone();
            async move {
                sqlx::query_as::<_, (i64, Option<NaiveDateTime>)>(
                    r#"
                    SELECT COUNT(*), MAX(fetched_at)
                    FROM articles
                    WHERE source_type = 'wechat' AND source_name = ?
                    "#,
                )
                .bind(source_name)
                .fetch_one(&pool)
                .await
            }
        })
        .await?;
        Ok((row.0.max(0) as u64, row.1))
    }

    /// Most recently discovered articles, for trigger-API responses.
    pub async fn recent_articles(&self, limit: u32) -> Result<Vec<Article>> {
        let pool = self.pool.clone();
        let rows = retrying("recent_articles", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, ArticleRow>(
                    "SELECT * FROM articles ORDER BY fetched_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&pool)
                .await
            }
        })
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    async fn check_transition(&self, id: i64, next: CrawlStatus) -> Result<()> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| ReprintError::Database(format!("article {id} not found")))?
            .crawl_status;
        if !current.can_transition_to(next) {
            return Err(ReprintError::IllegalTransition {
                from: current,
                to: next,
            });
        }
        Ok(())
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

/// Run a store operation, retrying transient failures with exponential
/// backoff. The closure rebuilds the query on every attempt.
async fn retrying<T, F, Fut>(op: &'static str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt + 1 < MAX_DB_ATTEMPTS => {
                let backoff = RETRY_BASE * 2u32.pow(attempt);
                warn!(op, attempt = attempt + 1, error = %e, "Transient database error, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(ReprintError::Database(format!("{op}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_store() -> ArticleStore {
        let pool = MySqlPoolOptions::new()
            .connect_lazy("mysql://u:p@localhost:3306/none")
            .expect("lazy pool");
        ArticleStore::new(pool)
    }

    #[tokio::test]
    async fn claim_with_zero_limit_returns_empty_without_touching_the_pool() {
        let store = lazy_store();
        assert!(store.claim_pending(None, 0).await.unwrap().is_empty());
        assert!(store.claim_unpublished(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retrying_gives_up_on_non_transient_errors() {
        let result: Result<()> =
            retrying("op", || async { Err(sqlx::Error::RowNotFound) }).await;
        let err = result.unwrap_err();
        assert!(matches!(err, ReprintError::Database(_)));
    }
}
