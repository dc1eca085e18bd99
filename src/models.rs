//! Data models shared by the crawl pipeline.
//!
//! - [`ExtractedRecord`]: everything the extractor recovered from one article
//!   page, handed once to the ingestion writer
//! - [`ImageRef`], [`RawStats`], [`CategoryHint`]: parts of an extracted record
//! - [`PageKind`]: whether a URL is a listing page or an article
//! - [`RunReport`]: aggregate counts returned by a crawl run
//!
//! Durable row types live in [`crate::storage::models`].

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a URL is treated once fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageKind {
    /// Category, pagination or topic page: scanned for outbound links only.
    Listing,
    /// Article page: extracted, then scanned for related links.
    Content,
}

/// Category resolved for an article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryHint {
    pub id: i64,
    pub name: String,
}

/// An image found inside the article body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Absolute image URL.
    pub url: String,
    /// The `alt` attribute.
    pub title: String,
    /// The `title` attribute.
    pub description: String,
    /// Order within the body; position 0 is the cover.
    pub position: i64,
    pub is_cover: bool,
}

/// Engagement counters scraped from the page, zero when absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStats {
    pub view_count: i64,
    pub comment_count: i64,
    pub like_count: i64,
}

/// An article as recovered from HTML.
///
/// Produced by [`crate::extract::Extractor`] and consumed exactly once by
/// [`crate::storage::NewsRepository::ingest`]. Optional fields degrade to empty
/// strings or empty lists; `publish_time` is never missing because the crawl
/// time stands in when no date could be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    /// Canonical URL, the record's identity in storage.
    pub url: String,
    pub title: String,
    pub subtitle: String,
    pub source: String,
    pub author: String,
    pub publish_time: NaiveDateTime,
    pub body_text: String,
    pub body_html: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub images: Vec<ImageRef>,
    pub tags: Vec<String>,
    pub category: CategoryHint,
    pub stats: RawStats,
}

impl ExtractedRecord {
    /// Keywords in the comma-separated form stored alongside the content.
    pub fn keywords_joined(&self) -> String {
        self.keywords.join(",")
    }
}

/// Aggregate result of one crawl run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    /// URLs claimed from the frontier and fetched (or attempted).
    pub urls_processed: usize,
    /// Records committed to storage, inserted plus updated.
    pub records_ingested: usize,
    pub records_inserted: usize,
    pub records_updated: usize,
    /// URLs whose fetch failed plus records whose ingestion failed.
    pub records_failed: usize,
    pub urls_failed: usize,
    pub listing_pages: usize,
    /// Article-shaped URLs whose page had no title.
    pub not_content: usize,
    /// Article URLs skipped because storage already has them.
    pub skipped_known: usize,
    /// Canonical URLs admitted to the frontier during the run.
    pub seen_urls: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_record() -> ExtractedRecord {
        ExtractedRecord {
            url: "https://news.163.com/24/0501/10/ABC.html".to_string(),
            title: "Test".to_string(),
            subtitle: String::new(),
            source: String::new(),
            author: String::new(),
            publish_time: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            body_text: "Body".to_string(),
            body_html: "<div>Body</div>".to_string(),
            summary: "Body".to_string(),
            keywords: vec!["economy".to_string(), "trade".to_string()],
            images: vec![],
            tags: vec![],
            category: CategoryHint {
                id: 1,
                name: "Headlines".to_string(),
            },
            stats: RawStats::default(),
        }
    }

    #[test]
    fn test_keywords_joined() {
        assert_eq!(sample_record().keywords_joined(), "economy,trade");
    }

    #[test]
    fn test_record_serialization() {
        let json = serde_json::to_string(&sample_record()).unwrap();
        assert!(json.contains("ABC.html"));
        assert!(json.contains("\"view_count\":0"));
    }

    #[test]
    fn test_run_report_default_is_zeroed() {
        let report = RunReport::default();
        assert_eq!(report.urls_processed, 0);
        assert_eq!(report.records_failed, 0);
        assert_eq!(report.duration, Duration::ZERO);
    }
}
