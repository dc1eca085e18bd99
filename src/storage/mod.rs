//! Durable news storage on SQLite.
//!
//! - [`NewsRepository::ingest`]: transactional upsert of one extracted article
//! - category seeding, the failed-URL log and per-run crawl logs
//! - read helpers used for cross-run dedup and by tests
//!
//! The schema lives in `migrations/` and is applied on connect.

pub mod models;
pub mod repository;

pub use models::CrawlStatus;
pub use repository::{IngestOutcome, NewsRepository, StorageError};
