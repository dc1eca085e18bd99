//! # News Harvest
//!
//! Command-line entry point: load configuration, open the database, then run
//! the crawl pipeline once or on a schedule.
//!
//! ## Usage
//!
//! ```sh
//! news_harvest -c ./config.yaml
//! news_harvest --schedule --interval-hours 6
//! ```
//!
//! Ctrl-C stops issuing new fetches; in-flight requests finish and the run
//! report is still written.

use clap::Parser;
use news_harvest::cli::Cli;
use news_harvest::config::Settings;
use news_harvest::pipeline::Crawler;
use std::error::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("news_harvest starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => {
            info!("No config file given; using defaults");
            Settings::default()
        }
    };
    args.apply(&mut settings);

    let crawler = Crawler::new(settings).await?;

    // ---- Ctrl-C stops new fetches ----
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight work");
            on_signal.cancel();
        }
    });

    if args.schedule {
        let schedule = &crawler.settings().schedule;
        let runs = crawler
            .run_on_schedule(schedule.interval_hours, schedule.run_on_start, &cancel)
            .await;
        info!(runs, "Scheduler exited");
    } else {
        let report = crawler.run_once(&cancel).await?;
        info!(report = %serde_json::to_string(&report)?, "Run report");
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );

    Ok(())
}
