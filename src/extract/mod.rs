//! Heuristic article extraction.
//!
//! [`Extractor::parse_page`] turns one fetched HTML page into its outbound
//! links and, for article pages, an [`ExtractedRecord`]. Extraction never fails
//! on malformed markup: optional fields degrade to empty values, the publish
//! time falls back to the crawl time, and only a missing title marks the page
//! as [`Extraction::NotContent`].
//!
//! # Modules
//!
//! - [`strategies`]: ordered per-field strategy chains
//! - [`body`]: body container location with a paragraph-density fallback
//! - [`time`]: publish-time formats
//! - [`category`]: category from URL prefix or subdomain

pub mod body;
pub mod category;
pub mod strategies;
pub mod time;

use crate::config::CategorySettings;
use crate::models::{ExtractedRecord, ImageRef, PageKind, RawStats};
use crate::utils::{SUMMARY_CHARS, first_integer, summarize};
use body::{BodyLocator, visible_text};
use category::CategoryResolver;
use chrono::NaiveDateTime;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use strategies::{FieldChain, MetaContent, SelectorAttr, selector};
use tracing::{debug, warn};
use url::Url;

static NTES_BLOB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)window\.NTES\s*=\s*(\{.*?\});").expect("static regex")
});

/// Image attributes tried in order; the latter two are lazy-load sources.
const IMAGE_SOURCE_ATTRS: &[&str] = &["src", "data-src", "data-original"];

/// Outcome of extracting one page.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Content(Box<ExtractedRecord>),
    /// The page has no title and is not an article.
    NotContent,
}

/// Everything a worker needs from one fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    /// Raw `href` values, resolved later by the frontier.
    pub links: Vec<String>,
    /// `None` for listing pages, which are never extracted.
    pub extraction: Option<Extraction>,
}

pub struct Extractor {
    title: FieldChain,
    subtitle: FieldChain,
    source: FieldChain,
    author: FieldChain,
    time: FieldChain,
    keywords: FieldChain,
    view_count: FieldChain,
    body: BodyLocator,
    categories: CategoryResolver,
    links: Selector,
    tags: Selector,
    images: Selector,
    scripts: Selector,
}

impl Extractor {
    pub fn new(categories: &CategorySettings) -> Self {
        Self {
            title: FieldChain::new("title")
                .with_selectors(&["h1.post_title", "h1.title", "div.post_main h1"])
                .with(MetaContent::property("og:title"))
                .with_selectors(&["h1"]),
            subtitle: FieldChain::new("subtitle")
                .with_selectors(&["div.post_subtitle"])
                .with(MetaContent::name("description")),
            source: FieldChain::new("source").with_selectors(&[
                "div.post_info a.source",
                "div.post_info span.source",
                "div.article-info span.source",
                "#ne_article_source",
            ]),
            author: FieldChain::new("author")
                .with_selectors(&[
                    "div.post_author",
                    "div.article-info span.author",
                    "span.byline",
                ])
                .with(MetaContent::name("author")),
            time: FieldChain::new("publish_time")
                .with_selectors(&[
                    "div.post_info span.post_time",
                    "div.post_time_source",
                    "div.post_info",
                    "div.article-info span.time",
                ])
                .with(SelectorAttr::new("time[datetime]", "datetime"))
                .with_selectors(&["time"])
                .with(MetaContent::property("article:published_time")),
            keywords: FieldChain::new("keywords").with(MetaContent::name("keywords")),
            view_count: FieldChain::new("view_count")
                .with_selectors(&["div.post_info span.post_view", "span.post_view"]),
            body: BodyLocator::new(),
            categories: CategoryResolver::new(categories),
            links: selector("a[href]"),
            tags: selector("div.post_tags a, div.tags a, div.article-tags a"),
            images: selector("img"),
            scripts: selector("script"),
        }
    }

    /// Parse a fetched page: collect its links, and extract it when `kind`
    /// is [`PageKind::Content`].
    ///
    /// `url` is the record's identity; `base` is where the page was actually
    /// served from after redirects, and relative image sources resolve
    /// against it.
    pub fn parse_page(
        &self,
        html: &str,
        url: &Url,
        base: &Url,
        kind: PageKind,
        crawl_time: NaiveDateTime,
    ) -> ParsedPage {
        let document = Html::parse_document(html);
        let links = self.links(&document);
        let extraction = match kind {
            PageKind::Listing => None,
            PageKind::Content => Some(self.extract_document(&document, url, base, crawl_time)),
        };
        ParsedPage { links, extraction }
    }

    pub fn extract(&self, html: &str, url: &Url, crawl_time: NaiveDateTime) -> Extraction {
        self.extract_document(&Html::parse_document(html), url, url, crawl_time)
    }

    fn extract_document(
        &self,
        document: &Html,
        url: &Url,
        base: &Url,
        crawl_time: NaiveDateTime,
    ) -> Extraction {
        let Some(title) = self.title.resolve(document) else {
            debug!(%url, "No title; not a content page");
            return Extraction::NotContent;
        };

        let (body_text, body_html, images) = match self.body.locate(document) {
            Some(container) => (
                visible_text(container),
                container.html(),
                self.images(container, base),
            ),
            None => (String::new(), String::new(), Vec::new()),
        };
        let publish_time =
            time::publish_time_or(self.time.resolve(document).as_deref(), crawl_time);

        let record = ExtractedRecord {
            url: url.to_string(),
            title,
            subtitle: self.subtitle.resolve_or_empty(document),
            source: self.source.resolve_or_empty(document),
            author: self.author.resolve_or_empty(document),
            publish_time,
            summary: summarize(&body_text, SUMMARY_CHARS),
            body_text,
            body_html,
            keywords: self.keywords(document),
            images,
            tags: self.tags(document),
            category: self.categories.resolve(url),
            stats: self.stats(document, url),
        };
        debug!(
            %url,
            title = %record.title,
            body_chars = record.body_text.chars().count(),
            images = record.images.len(),
            tags = record.tags.len(),
            "Extracted article"
        );
        Extraction::Content(Box::new(record))
    }

    /// Every `href` on the page except in-page anchors and script/mail links.
    pub fn links(&self, document: &Html) -> Vec<String> {
        document
            .select(&self.links)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|href| {
                !href.is_empty()
                    && !href.starts_with('#')
                    && !href.starts_with("javascript:")
                    && !href.starts_with("mailto:")
            })
            .map(str::to_string)
            .unique()
            .collect()
    }

    fn images(&self, container: ElementRef<'_>, page: &Url) -> Vec<ImageRef> {
        container
            .select(&self.images)
            .filter_map(|img| {
                let element = img.value();
                let source = IMAGE_SOURCE_ATTRS
                    .iter()
                    .filter_map(|attr| element.attr(attr))
                    .map(str::trim)
                    .find(|src| !src.is_empty() && !src.starts_with("data:"))?;
                let resolved = page.join(source).ok()?;
                Some((
                    resolved.to_string(),
                    element.attr("alt").unwrap_or_default().trim().to_string(),
                    element.attr("title").unwrap_or_default().trim().to_string(),
                ))
            })
            .enumerate()
            .map(|(position, (url, title, description))| ImageRef {
                url,
                title,
                description,
                position: position as i64,
                is_cover: position == 0,
            })
            .collect()
    }

    fn tags(&self, document: &Html) -> Vec<String> {
        document
            .select(&self.tags)
            .map(|a| crate::utils::clean_spaces(&a.text().collect::<String>()))
            .filter(|tag| !tag.is_empty())
            .unique()
            .collect()
    }

    fn keywords(&self, document: &Html) -> Vec<String> {
        self.keywords
            .resolve(document)
            .map(|raw| {
                raw.split([',', '，'])
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .unique()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn stats(&self, document: &Html, url: &Url) -> RawStats {
        let mut stats = RawStats {
            view_count: self
                .view_count
                .resolve(document)
                .and_then(|text| first_integer(&text))
                .unwrap_or(0),
            ..RawStats::default()
        };

        let blob = document
            .select(&self.scripts)
            .map(|script| script.text().collect::<String>())
            .find_map(|text| {
                NTES_BLOB
                    .captures(&text)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
            });
        if let Some(blob) = blob {
            match serde_json::from_str::<Value>(&blob) {
                Ok(data) => {
                    if let Some(count) = data.get("commentCount").and_then(as_count) {
                        stats.comment_count = count;
                    }
                    if let Some(count) = data.get("likeCount").and_then(as_count) {
                        stats.like_count = count;
                    }
                }
                Err(e) => warn!(%url, error = %e, "Failed to parse inline page data"),
            }
        }
        stats
    }
}

/// Counters show up both as numbers and as numeric strings.
fn as_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => first_integer(s),
        _ => None,
    }
}
