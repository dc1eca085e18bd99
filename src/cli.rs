//! Command-line interface definitions for News Harvest.
//!
//! Flags override the matching values of the YAML configuration. Every flag
//! can also be supplied through an environment variable.

use crate::config::Settings;
use clap::Parser;

/// Command-line arguments for the News Harvest crawler.
///
/// # Examples
///
/// ```sh
/// # One crawl with the built-in defaults
/// news_harvest
///
/// # One bounded crawl against a custom config
/// news_harvest -c ./config.yaml --max-pages 200
///
/// # Crawl every 6 hours until interrupted
/// news_harvest --schedule --interval-hours 6
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to config.yaml file
    #[arg(short, long, env = "NEWS_HARVEST_CONFIG")]
    pub config: Option<String>,

    /// Database URL, e.g. sqlite://news.db?mode=rwc
    #[arg(short, long, env = "NEWS_HARVEST_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Keep crawling on a fixed interval instead of running once
    #[arg(short, long)]
    pub schedule: bool,

    /// Hours between scheduled runs
    #[arg(long, env = "NEWS_HARVEST_INTERVAL_HOURS")]
    pub interval_hours: Option<u64>,

    /// Wait one full interval before the first scheduled run
    #[arg(long)]
    pub no_immediate: bool,

    /// Stop each run after this many URLs
    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Number of concurrent fetch workers
    #[arg(long)]
    pub concurrency: Option<usize>,
}

impl Cli {
    /// Apply command-line overrides on top of file settings.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.database_url {
            settings.database.url = url.clone();
        }
        if let Some(hours) = self.interval_hours {
            settings.schedule.interval_hours = hours;
        }
        if self.no_immediate {
            settings.schedule.run_on_start = false;
        }
        if let Some(max_pages) = self.max_pages {
            settings.crawler.max_pages = Some(max_pages);
        }
        if let Some(concurrency) = self.concurrency {
            settings.crawler.concurrent_requests = concurrency;
        }
    }
}
