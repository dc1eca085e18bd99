//! Run coordinator.
//!
//! A run wires a fresh [`Frontier`], [`RotationPool`] and [`FetchClient`]
//! together and drives them until the frontier is exhausted, a cutoff is hit,
//! or the run is cancelled:
//!
//! 1. **Seeding**: configured seeds, or every category page
//! 2. **Fetching**: `concurrent_requests` workers claim URLs and fetch them
//! 3. **Extraction**: each page yields links (fed back to the frontier) and,
//!    for articles, an [`ExtractedRecord`]
//! 4. **Ingestion**: a single writer drains a bounded queue into storage;
//!    workers wait on the queue when the writer falls behind
//!
//! Per-URL failures are logged to the failed-URL table and never abort a run.

use crate::config::{ConfigError, Settings};
use crate::extract::{Extraction, Extractor};
use crate::fetch::{FetchClient, FetchError};
use crate::frontier::{Claim, Frontier};
use crate::models::{ExtractedRecord, PageKind, RunReport};
use crate::rotation::RotationPool;
use crate::storage::{CrawlStatus, IngestOutcome, NewsRepository, StorageError};
use crate::utils::truncate_for_log;
use chrono::{NaiveDateTime, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long an idle worker waits for other workers to publish new links.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Error text longer than this is cut in log lines; storage keeps it whole.
const LOG_MESSAGE_CHARS: usize = 300;

/// Run-level failures. Per-URL problems are counted, not raised.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid URL pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicUsize,
    inserted: AtomicUsize,
    updated: AtomicUsize,
    ingest_failed: AtomicUsize,
    urls_failed: AtomicUsize,
    listing_pages: AtomicUsize,
    not_content: AtomicUsize,
    skipped_known: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, seen_urls: usize, duration: Duration) -> RunReport {
        let inserted = self.inserted.load(Ordering::Relaxed);
        let updated = self.updated.load(Ordering::Relaxed);
        let urls_failed = self.urls_failed.load(Ordering::Relaxed);
        RunReport {
            urls_processed: self.processed.load(Ordering::Relaxed),
            records_ingested: inserted + updated,
            records_inserted: inserted,
            records_updated: updated,
            records_failed: urls_failed + self.ingest_failed.load(Ordering::Relaxed),
            urls_failed,
            listing_pages: self.listing_pages.load(Ordering::Relaxed),
            not_content: self.not_content.load(Ordering::Relaxed),
            skipped_known: self.skipped_known.load(Ordering::Relaxed),
            seen_urls,
            duration,
        }
    }
}

/// Shared, borrowed state for the workers of one run.
struct RunContext<'a> {
    frontier: &'a Frontier,
    client: &'a FetchClient,
    extractor: &'a Extractor,
    store: &'a NewsRepository,
    counters: &'a Counters,
    cancel: &'a CancellationToken,
    known: Option<&'a HashSet<String>>,
    deadline: Option<Instant>,
    max_pages: Option<usize>,
    crawl_time: NaiveDateTime,
}

impl RunContext<'_> {
    /// Count one more page against the run budget, if any is left.
    fn reserve_page(&self) -> bool {
        match self.max_pages {
            None => {
                self.counters.processed.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(max) => self
                .counters
                .processed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
                .is_ok(),
        }
    }

    fn release_page(&self) {
        self.counters.processed.fetch_sub(1, Ordering::SeqCst);
    }

    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Owns the long-lived parts of the crawler: settings, extractor and store.
pub struct Crawler {
    settings: Settings,
    extractor: Extractor,
    store: NewsRepository,
}

impl Crawler {
    /// Open the database from `settings` and seed the category table.
    pub async fn new(settings: Settings) -> Result<Self, PipelineError> {
        let store =
            NewsRepository::connect(&settings.database.url, settings.database.max_connections)
                .await?;
        Self::with_store(settings, store).await
    }

    pub async fn with_store(settings: Settings, store: NewsRepository) -> Result<Self, PipelineError> {
        store.seed_categories(&settings.categories.table).await?;
        Ok(Self {
            extractor: Extractor::new(&settings.categories),
            settings,
            store,
        })
    }

    pub fn store(&self) -> &NewsRepository {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn seeds(&self) -> Vec<String> {
        if self.settings.frontier.seeds.is_empty() {
            self.settings
                .categories
                .table
                .iter()
                .map(|category| category.url.clone())
                .collect()
        } else {
            self.settings.frontier.seeds.clone()
        }
    }

    /// Crawl until the frontier is exhausted, a cutoff is reached or `cancel`
    /// fires, and return the aggregate counts.
    ///
    /// Every run is recorded in the crawl log.
    ///
    /// # Errors
    ///
    /// Only setup failures (bad URL patterns, HTTP client construction,
    /// database errors around the crawl log). Failures of individual URLs
    /// and records are counted in the report.
    #[instrument(level = "info", skip_all, fields(spider = %self.settings.crawler.name))]
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let crawl_time = Utc::now().naive_utc();
        let log_id = self
            .store
            .start_crawl_log(&self.settings.crawler.name, crawl_time)
            .await?;
        info!(log_id, "Crawl run starting");

        match self.crawl(cancel, started, crawl_time).await {
            Ok(report) => {
                self.store
                    .finish_crawl_log(log_id, &report, CrawlStatus::Success, None)
                    .await?;
                info!(
                    urls_processed = report.urls_processed,
                    inserted = report.records_inserted,
                    updated = report.records_updated,
                    failed = report.records_failed,
                    listing_pages = report.listing_pages,
                    not_content = report.not_content,
                    seen = report.seen_urls,
                    elapsed = ?report.duration,
                    "Crawl run complete"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Crawl run failed");
                let report = RunReport {
                    duration: started.elapsed(),
                    ..RunReport::default()
                };
                let message = e.to_string();
                if let Err(log_err) = self
                    .store
                    .finish_crawl_log(log_id, &report, CrawlStatus::Failed, Some(&message))
                    .await
                {
                    warn!(error = %log_err, "Failed to close crawl log");
                }
                Err(e)
            }
        }
    }

    async fn crawl(
        &self,
        cancel: &CancellationToken,
        started: Instant,
        crawl_time: NaiveDateTime,
    ) -> Result<RunReport, PipelineError> {
        let crawler = &self.settings.crawler;
        let frontier = Frontier::new(&self.settings.frontier)?;
        let pool = Arc::new(RotationPool::new(
            &self.settings.proxy,
            &self.settings.user_agents,
            crawler.max_attempts_per_url,
        ));
        if self.settings.proxy.enabled && self.settings.proxy.check_on_start {
            pool.health_check().await;
        }
        let client = FetchClient::new(crawler, pool)?;

        for seed in self.seeds() {
            if let Err(reason) = frontier.seed(&seed) {
                warn!(%seed, ?reason, "Seed not admitted");
            }
        }

        let known = if self.settings.frontier.skip_known {
            Some(self.store.known_urls().await?)
        } else {
            None
        };

        let counters = Counters::default();
        let ctx = RunContext {
            frontier: &frontier,
            client: &client,
            extractor: &self.extractor,
            store: &self.store,
            counters: &counters,
            cancel,
            known: known.as_ref(),
            deadline: crawler
                .max_duration_secs
                .map(|secs| started + Duration::from_secs(secs)),
            max_pages: crawler.max_pages,
            crawl_time,
        };

        let workers = crawler.concurrent_requests.max(1);
        let (tx, rx) = mpsc::channel::<ExtractedRecord>(crawler.writer_queue.max(1));
        let fetchers: Vec<_> = (0..workers)
            .map(|worker_id| fetch_worker(&ctx, worker_id, tx.clone()))
            .collect();
        drop(tx);

        info!(workers, seeds = frontier.pending_count(), "Workers started");
        tokio::join!(join_all(fetchers), write_records(&ctx, rx));

        frontier.log_summary();
        Ok(counters.report(frontier.seen_count(), started.elapsed()))
    }

    /// Call [`Crawler::run_once`] every `interval_hours` until `cancel` fires.
    ///
    /// A failed run is logged and the schedule continues. Returns the number
    /// of runs started.
    pub async fn run_on_schedule(
        &self,
        interval_hours: u64,
        run_immediately: bool,
        cancel: &CancellationToken,
    ) -> usize {
        let interval = Duration::from_secs(interval_hours.max(1) * 3600);
        self.run_every(interval, run_immediately, cancel).await
    }

    async fn run_every(
        &self,
        interval: Duration,
        run_immediately: bool,
        cancel: &CancellationToken,
    ) -> usize {
        info!(?interval, run_immediately, "Scheduler started");
        let mut runs = 0;

        if !run_immediately && !sleep_or_cancel(interval, cancel).await {
            return runs;
        }
        while !cancel.is_cancelled() {
            runs += 1;
            if let Err(e) = self.run_once(cancel).await {
                error!(run = runs, error = %e, "Scheduled run failed");
            }
            info!(next_in = ?interval, "Waiting for next scheduled run");
            if !sleep_or_cancel(interval, cancel).await {
                break;
            }
        }

        info!(runs, "Scheduler stopped");
        runs
    }
}

/// Sleep for `duration`; `false` if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[instrument(level = "debug", skip(ctx, tx))]
async fn fetch_worker(ctx: &RunContext<'_>, worker_id: usize, tx: mpsc::Sender<ExtractedRecord>) {
    loop {
        if ctx.cancel.is_cancelled() {
            debug!("Cancelled; worker stopping");
            break;
        }
        if ctx.past_deadline() {
            info!("Run duration cutoff reached");
            break;
        }
        if !ctx.reserve_page() {
            debug!("Page budget spent; worker stopping");
            break;
        }

        let Some(claim) = ctx.frontier.next() else {
            ctx.release_page();
            if ctx.frontier.is_idle() {
                break;
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = ctx.frontier.wait_for_work(IDLE_POLL) => {}
            }
            continue;
        };

        if !process(ctx, claim, &tx).await {
            break;
        }
    }
}

/// Fetch, parse and hand off one claimed URL. `false` stops the worker.
async fn process(ctx: &RunContext<'_>, claim: Claim, tx: &mpsc::Sender<ExtractedRecord>) -> bool {
    let url = claim.url;

    if claim.kind == PageKind::Content && ctx.known.is_some_and(|known| known.contains(url.as_str())) {
        ctx.release_page();
        Counters::bump(&ctx.counters.skipped_known);
        ctx.frontier.mark_done(&url, &[]);
        debug!(%url, "Already stored; skipping");
        return true;
    }

    let page = match ctx.client.fetch(&url, ctx.cancel).await {
        Ok(page) => page,
        Err(FetchError::Cancelled { .. }) => {
            ctx.frontier.mark_failed(&url, "cancelled");
            debug!(%url, "Cancelled mid-fetch; worker stopping");
            return false;
        }
        Err(e) => {
            let message = e.to_string();
            Counters::bump(&ctx.counters.urls_failed);
            ctx.frontier
                .mark_failed(&url, &truncate_for_log(&message, LOG_MESSAGE_CHARS));
            if let Err(se) = ctx.store.record_failure(url.as_str(), &message).await {
                error!(%url, error = %se, "Failed to record failed URL");
            }
            return true;
        }
    };

    let parsed = ctx
        .extractor
        .parse_page(&page.html, &url, &page.final_url, claim.kind, ctx.crawl_time);
    let links: Vec<String> = parsed
        .links
        .iter()
        .filter_map(|link| page.final_url.join(link).ok())
        .map(String::from)
        .collect();
    let admitted = ctx.frontier.mark_done(&url, &links);
    debug!(%url, status = page.status, links = links.len(), admitted, "Page processed");

    if let Err(e) = ctx.store.resolve_failure(url.as_str()).await {
        warn!(%url, error = %e, "Failed to clear failed-URL entry");
    }

    match parsed.extraction {
        None => Counters::bump(&ctx.counters.listing_pages),
        Some(Extraction::NotContent) => Counters::bump(&ctx.counters.not_content),
        Some(Extraction::Content(record)) => {
            if ctx.cancel.is_cancelled() {
                debug!(%url, "Cancelled; discarding extracted record");
                return false;
            }
            if tx.send(*record).await.is_err() {
                error!("Ingestion writer stopped; worker stopping");
                return false;
            }
        }
    }
    true
}

#[instrument(level = "debug", skip_all)]
async fn write_records(ctx: &RunContext<'_>, mut rx: mpsc::Receiver<ExtractedRecord>) {
    while let Some(record) = rx.recv().await {
        match ctx.store.ingest(&record).await {
            Ok(IngestOutcome::Inserted(_)) => Counters::bump(&ctx.counters.inserted),
            Ok(IngestOutcome::Updated(_)) => Counters::bump(&ctx.counters.updated),
            Err(e) => {
                Counters::bump(&ctx.counters.ingest_failed);
                let message = e.to_string();
                error!(
                    url = %record.url,
                    error = %truncate_for_log(&message, LOG_MESSAGE_CHARS),
                    "Ingestion failed; skipping record"
                );
                if let Err(se) = ctx.store.record_failure(&record.url, &message).await {
                    error!(url = %record.url, error = %se, "Failed to record failed URL");
                }
            }
        }
    }
    debug!("Ingestion queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CategorySettings, FrontierSettings};

    async fn idle_crawler() -> Crawler {
        let settings = Settings {
            frontier: FrontierSettings {
                seeds: Vec::new(),
                ..FrontierSettings::default()
            },
            categories: CategorySettings {
                table: Vec::new(),
                ..CategorySettings::default()
            },
            ..Settings::default()
        };
        let store = NewsRepository::connect("sqlite::memory:", 1).await.unwrap();
        Crawler::with_store(settings, store).await.unwrap()
    }

    #[tokio::test]
    async fn run_without_seeds_completes_empty() {
        let crawler = idle_crawler().await;
        let report = crawler.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.urls_processed, 0);
        assert_eq!(report.seen_urls, 0);
        assert_eq!(report.records_failed, 0);

        let log = crawler.store().crawl_log(1).await.unwrap().unwrap();
        assert_eq!(log.status, CrawlStatus::Success.code());
    }

    #[tokio::test]
    async fn invalid_pattern_fails_run_and_is_logged() {
        let mut crawler = idle_crawler().await;
        crawler.settings.frontier.deny_patterns = vec!["(".to_string()];

        let err = crawler.run_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Pattern(_)));

        let log = crawler.store().crawl_log(1).await.unwrap().unwrap();
        assert_eq!(log.status, CrawlStatus::Failed.code());
        assert!(log.error_message.is_some());
    }

    #[tokio::test]
    async fn schedule_runs_until_cancelled() {
        let crawler = idle_crawler().await;
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            stopper.cancel();
        });

        let runs = crawler
            .run_every(Duration::from_millis(20), true, &cancel)
            .await;
        assert!(runs >= 2, "expected repeated runs, got {runs}");
    }

    #[tokio::test]
    async fn schedule_without_immediate_run_can_be_cancelled_first() {
        let crawler = idle_crawler().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(crawler.run_on_schedule(6, false, &cancel).await, 0);
    }

    #[tokio::test]
    async fn seeds_default_to_category_pages() {
        let store = NewsRepository::connect("sqlite::memory:", 1).await.unwrap();
        let crawler = Crawler::with_store(Settings::default(), store).await.unwrap();
        let seeds = crawler.seeds();
        assert_eq!(seeds.len(), 24);
        assert_eq!(seeds[0], "https://news.163.com/");
        assert_eq!(crawler.store().categories().await.unwrap().len(), 24);
    }
}
