//! # News Harvest
//!
//! Crawl a large, many-subdomain news site, extract articles from whatever
//! template each page happens to use, and upsert them into SQLite exactly
//! once per canonical URL.
//!
//! ## Architecture
//!
//! 1. **Frontier** ([`frontier`]): canonical URLs, admission rules, host-fair scheduling
//! 2. **Fetching** ([`fetch`], [`rotation`]): proxy and user-agent rotation,
//!    retry with backoff, adaptive throttling
//! 3. **Extraction** ([`extract`]): ordered selector strategies with a
//!    paragraph-density fallback
//! 4. **Ingestion** ([`storage`]): one transaction per article with tag
//!    reconciliation
//!
//! [`pipeline::Crawler`] drives the loop; [`config::Settings`] holds every tunable.

pub mod cli;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod frontier;
pub mod models;
pub mod pipeline;
pub mod rotation;
pub mod storage;
pub mod utils;
