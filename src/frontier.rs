//! URL frontier: canonicalization, admission, dedup and host-fair scheduling.
//!
//! Every URL is canonicalized before it is looked up, so `a.html#top` and
//! `a.html` are one entry. Pending URLs sit in one queue per host and
//! [`Frontier::next`] walks the hosts round-robin, which keeps a crawl with
//! several subdomains from hammering one of them while the others wait.
//!
//! All state transitions happen under a single lock. In particular
//! [`Frontier::mark_done`] records the finished URL and admits its outbound
//! links in one step, so no worker can observe an idle frontier in between.

use crate::config::FrontierSettings;
use crate::models::PageKind;
use chrono::{DateTime, Utc};
use regex::RegexSet;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use url::Url;

/// Lifecycle of a frontier entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// Bookkeeping for one canonical URL.
#[derive(Debug, Clone)]
pub struct FrontierUrl {
    pub url: Url,
    pub discovered_at: DateTime<Utc>,
    pub state: UrlState,
    pub attempts: u32,
    pub kind: PageKind,
}

/// A URL handed to a worker by [`Frontier::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub url: Url,
    pub kind: PageKind,
    pub attempt: u32,
}

/// Why a discovered URL was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unparseable,
    ForeignDomain,
    NotAllowed,
    Denied,
    Duplicate,
}

#[derive(Debug)]
struct Rules {
    allowed_domains: Vec<String>,
    allow: RegexSet,
    deny: RegexSet,
    listing: RegexSet,
}

impl Rules {
    fn domain_allowed(&self, url: &Url) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        self.allowed_domains.iter().any(|domain| {
            host == domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }

    fn check(&self, url: &Url) -> Result<(), Rejection> {
        if !self.domain_allowed(url) {
            return Err(Rejection::ForeignDomain);
        }
        let raw = url.as_str();
        if !self.allow.is_empty() && !self.allow.is_match(raw) {
            return Err(Rejection::NotAllowed);
        }
        if self.deny.is_match(raw) {
            return Err(Rejection::Denied);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FrontierState {
    entries: HashMap<String, FrontierUrl>,
    queues: HashMap<String, VecDeque<String>>,
    /// Hosts with pending work, in round-robin order.
    hosts: VecDeque<String>,
    in_flight: usize,
}

/// Shared crawl frontier.
#[derive(Debug)]
pub struct Frontier {
    rules: Rules,
    state: Mutex<FrontierState>,
    notify: Notify,
}

impl Frontier {
    /// Compile the admission rules.
    ///
    /// # Errors
    ///
    /// Returns the regex error for the first pattern that does not compile.
    pub fn new(settings: &FrontierSettings) -> Result<Self, regex::Error> {
        Ok(Self {
            rules: Rules {
                allowed_domains: settings
                    .allowed_domains
                    .iter()
                    .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
                    .collect(),
                allow: RegexSet::new(&settings.allow_patterns)?,
                deny: RegexSet::new(&settings.deny_patterns)?,
                listing: RegexSet::new(&settings.listing_patterns)?,
            },
            state: Mutex::new(FrontierState::default()),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FrontierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a seed URL. Seeds skip the allow/deny patterns but are still
    /// canonicalized and deduplicated.
    pub fn seed(&self, raw: &str) -> Result<(), Rejection> {
        let url = canonicalize(raw, None).ok_or(Rejection::Unparseable)?;
        let mut state = self.lock();
        self.insert(&mut state, url)?;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Offer a link found on `source`. Relative links are resolved against it.
    pub fn discover(&self, raw: &str, source: &Url) -> Result<(), Rejection> {
        let url = canonicalize(raw, Some(source)).ok_or(Rejection::Unparseable)?;
        self.rules.check(&url)?;
        let mut state = self.lock();
        self.insert(&mut state, url)?;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    fn insert(&self, state: &mut FrontierState, url: Url) -> Result<(), Rejection> {
        let key = url.as_str().to_string();
        if state.entries.contains_key(&key) {
            return Err(Rejection::Duplicate);
        }
        let host = url.host_str().unwrap_or_default().to_string();
        let kind = self.classify(&url);
        debug!(url = %key, ?kind, "Admitted URL");

        state.entries.insert(
            key.clone(),
            FrontierUrl {
                url,
                discovered_at: Utc::now(),
                state: UrlState::Pending,
                attempts: 0,
                kind,
            },
        );
        match state.queues.get_mut(&host) {
            Some(queue) => queue.push_back(key),
            None => {
                state.queues.insert(host.clone(), VecDeque::from([key]));
                state.hosts.push_back(host);
            }
        }
        Ok(())
    }

    /// Listing pages are scanned for links only; everything else is an article.
    ///
    /// A URL is a listing when it matches a listing pattern or its last path
    /// segment has no file extension (`/`, `/domestic`).
    pub fn classify(&self, url: &Url) -> PageKind {
        if self.rules.listing.is_match(url.as_str()) {
            return PageKind::Listing;
        }
        let last = url
            .path_segments()
            .and_then(|segments| segments.last())
            .unwrap_or_default();
        if last.contains('.') {
            PageKind::Content
        } else {
            PageKind::Listing
        }
    }

    /// Claim the next pending URL, rotating across hosts.
    pub fn next(&self) -> Option<Claim> {
        let mut guard = self.lock();
        let state = &mut *guard;

        while let Some(host) = state.hosts.pop_front() {
            let Some(queue) = state.queues.get_mut(&host) else {
                continue;
            };
            let key = queue.pop_front();
            if queue.is_empty() {
                state.queues.remove(&host);
            } else {
                state.hosts.push_back(host);
            }

            let Some(entry) = key.and_then(|k| state.entries.get_mut(&k)) else {
                continue;
            };
            if entry.state != UrlState::Pending {
                continue;
            }
            entry.state = UrlState::InFlight;
            entry.attempts += 1;
            state.in_flight += 1;
            return Some(Claim {
                url: entry.url.clone(),
                kind: entry.kind,
                attempt: entry.attempts,
            });
        }
        None
    }

    /// Finish `url` and admit the links found on it.
    ///
    /// Returns the number of links admitted.
    pub fn mark_done(&self, url: &Url, links: &[String]) -> usize {
        let mut state = self.lock();
        self.finish(&mut state, url, UrlState::Done);

        let mut admitted = 0;
        for link in links {
            let Some(candidate) = canonicalize(link, Some(url)) else {
                continue;
            };
            if self.rules.check(&candidate).is_ok() && self.insert(&mut state, candidate).is_ok()
            {
                admitted += 1;
            }
        }
        drop(state);

        debug!(%url, found = links.len(), admitted, "URL done");
        self.notify.notify_waiters();
        admitted
    }

    /// Give up on `url` for the rest of the run.
    pub fn mark_failed(&self, url: &Url, reason: &str) {
        let mut state = self.lock();
        self.finish(&mut state, url, UrlState::Failed);
        drop(state);

        warn!(%url, reason, "URL failed");
        self.notify.notify_waiters();
    }

    fn finish(&self, state: &mut FrontierState, url: &Url, outcome: UrlState) {
        let Some(entry) = state.entries.get_mut(url.as_str()) else {
            return;
        };
        if entry.state == UrlState::InFlight {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        entry.state = outcome;
    }

    /// No pending URLs and nothing in flight that could produce more.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.hosts.is_empty() && state.in_flight == 0
    }

    pub fn pending_count(&self) -> usize {
        self.lock().queues.values().map(VecDeque::len).sum()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight
    }

    /// Number of canonical URLs ever admitted this run.
    pub fn seen_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn state_of(&self, url: &Url) -> Option<UrlState> {
        self.lock().entries.get(url.as_str()).map(|e| e.state)
    }

    /// Wait until new work may be available, at most `max_wait`.
    ///
    /// Returns immediately if a URL is already pending or the frontier is idle.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.pending_count() > 0 || self.is_idle() {
            return;
        }
        let _ = tokio::time::timeout(max_wait, notified).await;
    }

    /// Log a one-line summary of the frontier.
    pub fn log_summary(&self) {
        let state = self.lock();
        let done = state
            .entries
            .values()
            .filter(|e| e.state == UrlState::Done)
            .count();
        let failed = state
            .entries
            .values()
            .filter(|e| e.state == UrlState::Failed)
            .count();
        info!(seen = state.entries.len(), done, failed, "Frontier summary");
    }
}

/// Resolve `raw` against `base` and normalize it into a dedup key.
///
/// - Only `http` and `https` URLs survive
/// - The fragment is dropped, as is an empty `?`
/// - A trailing slash is dropped everywhere except the root path
///
/// ```ignore
/// let base = Url::parse("https://news.163.com/domestic/").unwrap();
/// let url = canonicalize("../24/a.html#comments", Some(&base)).unwrap();
/// assert_eq!(url.as_str(), "https://news.163.com/24/a.html");
/// ```
pub fn canonicalize(raw: &str, base: Option<&Url>) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut url = match base {
        Some(base) => base.join(raw).ok()?,
        None => Url::parse(raw).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Some(url)
}
