//! Row types for the durable news schema.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CategoryRow {
    pub id: i64,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NewsRow {
    pub id: i64,
    pub title: String,
    pub subtitle: String,
    pub source: String,
    pub author: String,
    pub url: String,
    pub category_id: i64,
    pub publish_time: NaiveDateTime,
    pub first_seen_at: NaiveDateTime,
    pub last_updated_at: NaiveDateTime,
    pub is_top: bool,
    pub is_hot: bool,
    pub is_recommend: bool,
    pub view_count: i64,
    pub comment_count: i64,
    pub like_count: i64,
    pub status: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContentRow {
    pub news_id: i64,
    pub content: String,
    pub content_html: String,
    pub summary: String,
    /// Comma-separated.
    pub keywords: String,
}

/// Image metadata. Dimensions, size, format and local path stay empty: images
/// are referenced, never downloaded.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImageRow {
    pub id: i64,
    pub news_id: i64,
    pub url: String,
    pub local_path: Option<String>,
    pub title: String,
    pub description: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub size: Option<i64>,
    pub format: Option<String>,
    pub is_cover: bool,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TagRow {
    pub id: i64,
    pub name: String,
    pub frequency: i64,
    pub last_updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CrawlLogRow {
    pub id: i64,
    pub spider_name: String,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub duration_secs: Option<f64>,
    /// See [`CrawlStatus`].
    pub status: i64,
    pub url_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailedUrlRow {
    pub id: i64,
    pub url: String,
    pub error_message: String,
    pub retry_count: i64,
    /// 0 while still failing, 1 once a later fetch succeeded.
    pub status: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Stored state of a crawl run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlStatus {
    Running = 0,
    Success = 1,
    Failed = 2,
}

impl CrawlStatus {
    pub fn code(self) -> i64 {
        self as i64
    }
}
