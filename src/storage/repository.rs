use super::models::{
    CategoryRow, ContentRow, CrawlLogRow, CrawlStatus, FailedUrlRow, ImageRow, NewsRow, TagRow,
};
use crate::config::CategoryEntry;
use crate::models::{ExtractedRecord, RunReport};
use chrono::{NaiveDateTime, Utc};
use itertools::Itertools;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Result of a successful [`NewsRepository::ingest`], carrying the news id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted(i64),
    Updated(i64),
}

impl IngestOutcome {
    pub fn id(self) -> i64 {
        match self {
            IngestOutcome::Inserted(id) | IngestOutcome::Updated(id) => id,
        }
    }
}

const NEWS_COLUMNS: &str = "id, title, subtitle, source, author, url, category_id, publish_time, \
    first_seen_at, last_updated_at, is_top, is_hot, is_recommend, view_count, comment_count, \
    like_count, status";

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

#[derive(Debug, Clone)]
pub struct NewsRepository {
    pool: SqlitePool,
}

impl NewsRepository {
    /// Open the database and apply migrations.
    ///
    /// In-memory databases are private to one connection, so the pool is
    /// pinned to a single connection for them.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(max_connections, "Connected to news database");
        Ok(Self { pool })
    }

    /// Insert or update one article, its content, images and tag links.
    ///
    /// Everything happens in one transaction keyed by the record's URL. An
    /// existing article keeps its id and flags; its tag links are reconciled
    /// to exactly `record.tags`. A tag's frequency goes up each time a link to
    /// it is created and is never decremented when a link is removed.
    ///
    /// # Errors
    ///
    /// Any database failure. The transaction is rolled back, leaving the
    /// article exactly as it was.
    #[instrument(level = "info", skip_all, fields(url = %record.url))]
    pub async fn ingest(&self, record: &ExtractedRecord) -> Result<IngestOutcome, StorageError> {
        let now = now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM news WHERE url = ?1")
            .bind(&record.url)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE news
                    SET title = ?1,
                        subtitle = ?2,
                        source = ?3,
                        author = ?4,
                        category_id = ?5,
                        publish_time = ?6,
                        last_updated_at = ?7,
                        view_count = ?8,
                        comment_count = ?9,
                        like_count = ?10
                    WHERE id = ?11
                    "#,
                )
                .bind(&record.title)
                .bind(&record.subtitle)
                .bind(&record.source)
                .bind(&record.author)
                .bind(record.category.id)
                .bind(record.publish_time)
                .bind(now)
                .bind(record.stats.view_count)
                .bind(record.stats.comment_count)
                .bind(record.stats.like_count)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                IngestOutcome::Updated(id)
            }
            None => {
                let id = sqlx::query(
                    r#"
                    INSERT INTO news (title, subtitle, source, author, url, category_id, publish_time,
                                      first_seen_at, last_updated_at, view_count, comment_count, like_count)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9, ?10, ?11)
                    "#,
                )
                .bind(&record.title)
                .bind(&record.subtitle)
                .bind(&record.source)
                .bind(&record.author)
                .bind(&record.url)
                .bind(record.category.id)
                .bind(record.publish_time)
                .bind(now)
                .bind(record.stats.view_count)
                .bind(record.stats.comment_count)
                .bind(record.stats.like_count)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();
                IngestOutcome::Inserted(id)
            }
        };
        let news_id = outcome.id();

        sqlx::query(
            r#"
            INSERT INTO news_content (news_id, content, content_html, summary, keywords)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(news_id) DO UPDATE SET
              content = excluded.content,
              content_html = excluded.content_html,
              summary = excluded.summary,
              keywords = excluded.keywords
            "#,
        )
        .bind(news_id)
        .bind(&record.body_text)
        .bind(&record.body_html)
        .bind(&record.summary)
        .bind(record.keywords_joined())
        .execute(&mut *tx)
        .await?;

        replace_images(&mut tx, news_id, record).await?;
        let (added, removed) = reconcile_tags(&mut tx, news_id, &record.tags, now).await?;

        tx.commit().await?;
        info!(
            news_id,
            outcome = ?outcome,
            images = record.images.len(),
            tags_added = added,
            tags_removed = removed,
            "Ingested article"
        );
        Ok(outcome)
    }

    /// Upsert the static category table.
    pub async fn seed_categories(&self, categories: &[CategoryEntry]) -> Result<usize, StorageError> {
        let now = now();
        for category in categories {
            sqlx::query(
                r#"
                INSERT INTO categories (id, name, url, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                  name = excluded.name,
                  url = excluded.url,
                  updated_at = excluded.updated_at
                "#,
            )
            .bind(category.id)
            .bind(&category.name)
            .bind(&category.url)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        debug!(count = categories.len(), "Seeded categories");
        Ok(categories.len())
    }

    pub async fn categories(&self) -> Result<Vec<CategoryRow>, StorageError> {
        let rows = sqlx::query_as::<_, CategoryRow>("SELECT id, name, url FROM categories ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Log a failed URL, bumping its retry count if it failed before.
    pub async fn record_failure(&self, url: &str, error_message: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO failed_urls (url, error_message, retry_count, status, created_at, updated_at)
            VALUES (?1, ?2, 1, 0, ?3, ?3)
            ON CONFLICT(url) DO UPDATE SET
              error_message = excluded.error_message,
              retry_count = failed_urls.retry_count + 1,
              status = 0,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(url)
        .bind(error_message)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a previously failed URL as fetched. Returns whether it was logged.
    pub async fn resolve_failure(&self, url: &str) -> Result<bool, StorageError> {
        let affected = sqlx::query(
            "UPDATE failed_urls SET status = 1, updated_at = ?1 WHERE url = ?2 AND status = 0",
        )
        .bind(now())
        .bind(url)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn failed_url(&self, url: &str) -> Result<Option<FailedUrlRow>, StorageError> {
        let row = sqlx::query_as::<_, FailedUrlRow>(
            r#"
            SELECT id, url, error_message, retry_count, status, created_at, updated_at
            FROM failed_urls
            WHERE url = ?1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Open a crawl log row in the running state.
    pub async fn start_crawl_log(
        &self,
        spider_name: &str,
        start_time: NaiveDateTime,
    ) -> Result<i64, StorageError> {
        let id = sqlx::query(
            "INSERT INTO crawl_logs (spider_name, start_time, status) VALUES (?1, ?2, ?3)",
        )
        .bind(spider_name)
        .bind(start_time)
        .bind(CrawlStatus::Running.code())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn finish_crawl_log(
        &self,
        id: i64,
        report: &RunReport,
        status: CrawlStatus,
        error_message: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE crawl_logs
            SET end_time = ?1,
                duration_secs = ?2,
                status = ?3,
                url_count = ?4,
                success_count = ?5,
                fail_count = ?6,
                error_message = ?7
            WHERE id = ?8
            "#,
        )
        .bind(now())
        .bind(report.duration.as_secs_f64())
        .bind(status.code())
        .bind(report.urls_processed as i64)
        .bind(report.records_ingested as i64)
        .bind(report.records_failed as i64)
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn crawl_log(&self, id: i64) -> Result<Option<CrawlLogRow>, StorageError> {
        let row = sqlx::query_as::<_, CrawlLogRow>(
            r#"
            SELECT id, spider_name, start_time, end_time, duration_secs, status, url_count,
                   success_count, fail_count, error_message
            FROM crawl_logs
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_by_url(&self, url: &str) -> Result<Option<NewsRow>, StorageError> {
        let row = sqlx::query_as::<_, NewsRow>(&format!(
            "SELECT {NEWS_COLUMNS} FROM news WHERE url = ?1"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn url_exists(&self, url: &str) -> Result<bool, StorageError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM news WHERE url = ?1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Every stored article URL.
    pub async fn known_urls(&self) -> Result<HashSet<String>, StorageError> {
        let urls: Vec<String> = sqlx::query_scalar("SELECT url FROM news")
            .fetch_all(&self.pool)
            .await?;
        Ok(urls.into_iter().collect())
    }

    pub async fn news_count(&self) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM news")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn content_for_news(&self, news_id: i64) -> Result<Option<ContentRow>, StorageError> {
        let row = sqlx::query_as::<_, ContentRow>(
            r#"
            SELECT news_id, content, content_html, summary, keywords
            FROM news_content
            WHERE news_id = ?1
            "#,
        )
        .bind(news_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn images_for_news(&self, news_id: i64) -> Result<Vec<ImageRow>, StorageError> {
        let rows = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT id, news_id, url, local_path, title, description, width, height, size, format,
                   is_cover, position
            FROM news_images
            WHERE news_id = ?1
            ORDER BY position
            "#,
        )
        .bind(news_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn tag_by_name(&self, name: &str) -> Result<Option<TagRow>, StorageError> {
        let row = sqlx::query_as::<_, TagRow>(
            "SELECT id, name, frequency, last_updated_at FROM tags WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Tag names linked to an article, sorted.
    pub async fn tags_for_news(&self, news_id: i64) -> Result<Vec<String>, StorageError> {
        let names = sqlx::query_scalar(
            r#"
            SELECT t.name
            FROM tags t
            JOIN news_tags nt ON nt.tag_id = t.id
            WHERE nt.news_id = ?1
            ORDER BY t.name
            "#,
        )
        .bind(news_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// Delete an article; content, images and tag links go with it.
    pub async fn delete_news(&self, news_id: i64) -> Result<u64, StorageError> {
        let affected = sqlx::query("DELETE FROM news WHERE id = ?1")
            .bind(news_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }
}

async fn replace_images(
    conn: &mut SqliteConnection,
    news_id: i64,
    record: &ExtractedRecord,
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM news_images WHERE news_id = ?1")
        .bind(news_id)
        .execute(&mut *conn)
        .await?;
    for image in &record.images {
        sqlx::query(
            r#"
            INSERT INTO news_images (news_id, url, title, description, is_cover, position)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(news_id)
        .bind(&image.url)
        .bind(&image.title)
        .bind(&image.description)
        .bind(image.is_cover)
        .bind(image.position)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Make the article's tag links equal `desired`.
///
/// Only the difference is touched: stale links are deleted, new links are
/// created and bump their tag's frequency, links present on both sides are
/// left alone. Returns `(added, removed)`.
async fn reconcile_tags(
    conn: &mut SqliteConnection,
    news_id: i64,
    desired: &[String],
    now: NaiveDateTime,
) -> Result<(usize, usize), StorageError> {
    let current: Vec<(i64, String)> = sqlx::query_as(
        r#"
        SELECT t.id, t.name
        FROM tags t
        JOIN news_tags nt ON nt.tag_id = t.id
        WHERE nt.news_id = ?1
        "#,
    )
    .bind(news_id)
    .fetch_all(&mut *conn)
    .await?;

    let wanted: HashSet<&str> = desired.iter().map(String::as_str).collect();
    let linked: HashSet<&str> = current.iter().map(|(_, name)| name.as_str()).collect();

    let mut removed = 0;
    for (tag_id, name) in &current {
        if wanted.contains(name.as_str()) {
            continue;
        }
        sqlx::query("DELETE FROM news_tags WHERE news_id = ?1 AND tag_id = ?2")
            .bind(news_id)
            .bind(tag_id)
            .execute(&mut *conn)
            .await?;
        removed += 1;
    }

    let mut added = 0;
    for name in desired.iter().unique() {
        if linked.contains(name.as_str()) {
            continue;
        }
        let tag_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tags (name, frequency, last_updated_at)
            VALUES (?1, 1, ?2)
            ON CONFLICT(name) DO UPDATE SET
              frequency = tags.frequency + 1,
              last_updated_at = excluded.last_updated_at
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        sqlx::query("INSERT INTO news_tags (news_id, tag_id) VALUES (?1, ?2)")
            .bind(news_id)
            .bind(tag_id)
            .execute(&mut *conn)
            .await?;
        added += 1;
    }
    Ok((added, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CategorySettings;
    use crate::models::{CategoryHint, ImageRef, RawStats};
    use chrono::NaiveDate;

    async fn repo() -> NewsRepository {
        NewsRepository::connect("sqlite::memory:", 5)
            .await
            .expect("in-memory database should open")
    }

    fn record(url: &str, tags: &[&str]) -> ExtractedRecord {
        ExtractedRecord {
            url: url.to_string(),
            title: "Trade talks resume".to_string(),
            subtitle: String::new(),
            source: "Xinhua".to_string(),
            author: String::new(),
            publish_time: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            body_text: "Negotiators met on Monday.".to_string(),
            body_html: "<div><p>Negotiators met on Monday.</p></div>".to_string(),
            summary: "Negotiators met on Monday.".to_string(),
            keywords: vec!["trade".to_string(), "economy".to_string()],
            images: vec![ImageRef {
                url: "https://img.163.com/a.jpg".to_string(),
                title: "Cover".to_string(),
                description: String::new(),
                position: 0,
                is_cover: true,
            }],
            tags: tags.iter().map(|t| t.to_string()).collect(),
            category: CategoryHint {
                id: 5,
                name: "Finance".to_string(),
            },
            stats: RawStats {
                view_count: 10,
                comment_count: 2,
                like_count: 1,
            },
        }
    }

    const URL: &str = "https://money.163.com/24/0501/10/ABC.html";

    #[tokio::test]
    async fn ingest_inserts_then_updates_in_place() {
        let repo = repo().await;

        let first = repo.ingest(&record(URL, &["Trade"])).await.unwrap();
        assert!(matches!(first, IngestOutcome::Inserted(_)));

        let mut changed = record(URL, &["Trade"]);
        changed.title = "Trade talks stall".to_string();
        changed.stats.view_count = 99;
        let second = repo.ingest(&changed).await.unwrap();

        assert_eq!(second, IngestOutcome::Updated(first.id()));
        assert_eq!(repo.news_count().await.unwrap(), 1);
        let row = repo.find_by_url(URL).await.unwrap().unwrap();
        assert_eq!(row.id, first.id());
        assert_eq!(row.title, "Trade talks stall");
        assert_eq!(row.view_count, 99);
        assert_eq!(row.category_id, 5);
        assert_eq!(row.status, 1);
        assert!(!row.is_top && !row.is_hot && !row.is_recommend);
        assert!(row.last_updated_at >= row.first_seen_at);
    }

    #[tokio::test]
    async fn ingest_stores_content_and_images() {
        let repo = repo().await;
        let id = repo.ingest(&record(URL, &[])).await.unwrap().id();

        let content = repo.content_for_news(id).await.unwrap().unwrap();
        assert_eq!(content.keywords, "trade,economy");
        assert_eq!(content.content, "Negotiators met on Monday.");

        let mut fewer = record(URL, &[]);
        fewer.images[0].url = "https://img.163.com/b.jpg".to_string();
        repo.ingest(&fewer).await.unwrap();
        let images = repo.images_for_news(id).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].url, "https://img.163.com/b.jpg");
        assert!(images[0].is_cover);
        assert!(images[0].width.is_none());
    }

    #[tokio::test]
    async fn tags_are_reconciled_without_double_counting() {
        let repo = repo().await;
        let id = repo.ingest(&record(URL, &["A", "B"])).await.unwrap().id();
        repo.ingest(&record(URL, &["B", "C"])).await.unwrap();

        assert_eq!(repo.tags_for_news(id).await.unwrap(), vec!["B", "C"]);
        assert_eq!(repo.tag_by_name("A").await.unwrap().unwrap().frequency, 1);
        assert_eq!(repo.tag_by_name("B").await.unwrap().unwrap().frequency, 1);
        assert_eq!(repo.tag_by_name("C").await.unwrap().unwrap().frequency, 1);
    }

    #[tokio::test]
    async fn tag_frequency_counts_articles() {
        let repo = repo().await;
        repo.ingest(&record(URL, &["Trade", "Trade"])).await.unwrap();
        repo.ingest(&record("https://money.163.com/24/0501/10/DEF.html", &["Trade"]))
            .await
            .unwrap();
        assert_eq!(repo.tag_by_name("Trade").await.unwrap().unwrap().frequency, 2);
    }

    #[tokio::test]
    async fn failed_ingest_rolls_back_insert() {
        let repo = repo().await;
        sqlx::query("DROP TABLE news_tags")
            .execute(&repo.pool)
            .await
            .unwrap();

        let result = repo.ingest(&record(URL, &["A"])).await;

        assert!(matches!(result, Err(StorageError::Database(_))));
        assert_eq!(repo.news_count().await.unwrap(), 0);
        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM news_content")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn failed_ingest_leaves_existing_record_untouched() {
        let repo = repo().await;
        let id = repo.ingest(&record(URL, &[])).await.unwrap().id();
        sqlx::query("DROP TABLE news_tags")
            .execute(&repo.pool)
            .await
            .unwrap();

        let mut changed = record(URL, &["A"]);
        changed.title = "Changed".to_string();
        changed.images.clear();
        assert!(repo.ingest(&changed).await.is_err());

        let row = repo.find_by_url(URL).await.unwrap().unwrap();
        assert_eq!(row.title, "Trade talks resume");
        assert_eq!(repo.images_for_news(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let repo = repo().await;
        let id = repo.ingest(&record(URL, &["A"])).await.unwrap().id();
        assert_eq!(repo.delete_news(id).await.unwrap(), 1);
        assert!(repo.content_for_news(id).await.unwrap().is_none());
        assert!(repo.images_for_news(id).await.unwrap().is_empty());
        assert!(repo.tags_for_news(id).await.unwrap().is_empty());
        assert!(!repo.url_exists(URL).await.unwrap());
    }

    #[tokio::test]
    async fn failure_log_counts_retries_and_resolves() {
        let repo = repo().await;
        repo.record_failure(URL, "HTTP 503").await.unwrap();
        repo.record_failure(URL, "request timed out").await.unwrap();

        let row = repo.failed_url(URL).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 2);
        assert_eq!(row.error_message, "request timed out");
        assert_eq!(row.status, 0);

        assert!(repo.resolve_failure(URL).await.unwrap());
        assert!(!repo.resolve_failure(URL).await.unwrap());
        assert_eq!(repo.failed_url(URL).await.unwrap().unwrap().status, 1);
    }

    #[tokio::test]
    async fn crawl_log_lifecycle() {
        let repo = repo().await;
        let id = repo.start_crawl_log("news_harvest", now()).await.unwrap();
        assert_eq!(
            repo.crawl_log(id).await.unwrap().unwrap().status,
            CrawlStatus::Running.code()
        );

        let report = RunReport {
            urls_processed: 3,
            records_ingested: 2,
            records_failed: 1,
            ..RunReport::default()
        };
        repo.finish_crawl_log(id, &report, CrawlStatus::Success, None)
            .await
            .unwrap();

        let log = repo.crawl_log(id).await.unwrap().unwrap();
        assert_eq!(log.status, CrawlStatus::Success.code());
        assert_eq!((log.url_count, log.success_count, log.fail_count), (3, 2, 1));
        assert!(log.end_time.is_some());
    }

    #[tokio::test]
    async fn categories_are_seeded_idempotently() {
        let repo = repo().await;
        let table = CategorySettings::default().table;
        repo.seed_categories(&table).await.unwrap();
        repo.seed_categories(&table).await.unwrap();
        let rows = repo.categories().await.unwrap();
        assert_eq!(rows.len(), 24);
        assert_eq!(rows[4].name, "Finance");
    }

    #[tokio::test]
    async fn known_urls_lists_stored_articles() {
        let repo = repo().await;
        repo.ingest(&record(URL, &[])).await.unwrap();
        let known = repo.known_urls().await.unwrap();
        assert!(known.contains(URL));
        assert!(repo.url_exists(URL).await.unwrap());
    }
}
