//! Proxy and user-agent rotation.
//!
//! The [`RotationPool`] hands out one [`CredentialSet`] per fetch attempt and
//! learns from the outcome of each attempt:
//!
//! - Proxies are ranked by observed success rate and one is drawn uniformly
//!   from the top 80%, so healthy-but-lower-ranked proxies still get traffic.
//! - A [`Outcome::HardFailure`] bumps the proxy's consecutive-failure streak;
//!   reaching `max_fail_times` evicts it for the rest of the run.
//! - A [`Outcome::SoftFailure`] lowers the success rate but never evicts.
//! - User agents are drawn uniformly at random, and every URL has a hard cap on
//!   attempts so a page the target keeps blocking cannot loop forever.
//!
//! When the last proxy is evicted and a refill endpoint is configured, the pool
//! repopulates itself in the background.

use crate::config::{ExhaustionPolicy, ProxySettings, UserAgentSettings};
use crate::fetch::FetchError;
use rand::seq::IndexedRandom;
use rand::rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Sent when rotation is disabled or the configured list is empty.
pub const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Share of the ranked proxy list eligible for selection, in percent.
const TOP_PERCENT: usize = 80;

/// Result of one fetch attempt, as far as the credential is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The target answered but refused us (blocked page, 4xx, 429).
    SoftFailure,
    /// Timeout, refused connection, or a 5xx with no payload.
    HardFailure,
}

/// The proxy and user agent used for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSet {
    /// `None` means the request goes out directly.
    pub proxy: Option<String>,
    pub user_agent: String,
}

/// Running statistics for one proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRecord {
    pub address: String,
    pub success_count: u64,
    pub fail_count: u64,
    pub consecutive_fails: u32,
    pub last_used_at: Option<Instant>,
}

impl ProxyRecord {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            success_count: 0,
            fail_count: 0,
            consecutive_fails: 0,
            last_used_at: None,
        }
    }

    /// Smoothed success rate, `(s + 1) / (s + f + 2)`.
    ///
    /// An untried proxy scores 0.5, ahead of one that has only failed, so
    /// fresh proxies from a refill get traffic.
    pub fn success_rate(&self) -> f64 {
        (self.success_count as f64 + 1.0) / ((self.success_count + self.fail_count) as f64 + 2.0)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    proxies: Vec<ProxyRecord>,
    evicted: HashSet<String>,
    url_attempts: HashMap<String, u32>,
}

/// Shared proxy/user-agent pool. Every read-modify-write happens under one lock.
#[derive(Debug)]
pub struct RotationPool {
    state: Mutex<PoolState>,
    proxies_enabled: bool,
    user_agents: Vec<String>,
    settings: ProxySettings,
    max_attempts_per_url: u32,
    refilling: AtomicBool,
}

impl RotationPool {
    /// Build a pool from configuration. Proxy entries are normalized with the
    /// configured scheme.
    pub fn new(
        proxy: &ProxySettings,
        user_agents: &UserAgentSettings,
        max_attempts_per_url: u32,
    ) -> Self {
        let proxies = proxy
            .proxies
            .iter()
            .filter_map(|p| format_proxy(p, &proxy.scheme))
            .map(ProxyRecord::new)
            .collect();
        let user_agents = if user_agents.enabled {
            user_agents.user_agents.clone()
        } else {
            Vec::new()
        };
        info!(
            proxies_enabled = proxy.enabled,
            max_attempts_per_url, "Rotation pool initialized"
        );
        Self {
            state: Mutex::new(PoolState {
                proxies,
                ..PoolState::default()
            }),
            proxies_enabled: proxy.enabled,
            user_agents,
            settings: proxy.clone(),
            max_attempts_per_url,
            refilling: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick credentials for the next attempt at `url`.
    ///
    /// # Errors
    ///
    /// - [`FetchError::AttemptsExhausted`] once `url` has used up its attempt cap
    /// - [`FetchError::ProxyExhausted`] when proxies are enabled, none are left,
    ///   and the pool is configured to fail fast
    pub fn acquire(&self, url: &str) -> Result<CredentialSet, FetchError> {
        let mut state = self.lock();

        let attempts = state.url_attempts.entry(url.to_string()).or_insert(0);
        if *attempts >= self.max_attempts_per_url {
            return Err(FetchError::AttemptsExhausted {
                url: url.to_string(),
                attempts: *attempts,
            });
        }
        *attempts += 1;

        let user_agent = self
            .user_agents
            .choose(&mut rng())
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENT.to_string());

        if !self.proxies_enabled {
            return Ok(CredentialSet {
                proxy: None,
                user_agent,
            });
        }

        match select_proxy(&mut state.proxies) {
            Some(proxy) => Ok(CredentialSet {
                proxy: Some(proxy),
                user_agent,
            }),
            None => match self.settings.on_exhaustion {
                ExhaustionPolicy::Direct => {
                    debug!(%url, "No eligible proxy; fetching directly");
                    Ok(CredentialSet {
                        proxy: None,
                        user_agent,
                    })
                }
                ExhaustionPolicy::FailFast => Err(FetchError::ProxyExhausted),
            },
        }
    }

    /// Record the outcome of an attempt made with `credential`.
    ///
    /// Evicts the proxy once its consecutive hard failures reach
    /// `max_fail_times`, and schedules a background refill if that empties the
    /// pool.
    pub fn report(self: &Arc<Self>, credential: &CredentialSet, outcome: Outcome) {
        let Some(address) = credential.proxy.as_deref() else {
            return;
        };

        let became_empty = {
            let mut state = self.lock();
            let Some(index) = state.proxies.iter().position(|p| p.address == address) else {
                return;
            };
            let record = &mut state.proxies[index];
            match outcome {
                Outcome::Success => {
                    record.success_count += 1;
                    record.consecutive_fails = 0;
                }
                Outcome::SoftFailure => {
                    record.fail_count += 1;
                }
                Outcome::HardFailure => {
                    record.fail_count += 1;
                    record.consecutive_fails += 1;
                }
            }

            if record.consecutive_fails >= self.settings.max_fail_times {
                let evicted = state.proxies.remove(index);
                warn!(
                    proxy = %evicted.address,
                    consecutive_fails = evicted.consecutive_fails,
                    "Proxy failed too many times; evicted"
                );
                state.evicted.insert(evicted.address);
                state.proxies.is_empty()
            } else {
                false
            }
        };

        if became_empty && self.settings.proxy_api.is_some() {
            self.spawn_refill();
        }
    }

    fn spawn_refill(self: &Arc<Self>) {
        if self.refilling.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.refilling.store(false, Ordering::SeqCst);
            return;
        };
        let pool = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = pool.refill().await {
                error!(error = %e, "Proxy refill failed");
            }
            pool.refilling.store(false, Ordering::SeqCst);
        });
    }

    /// Fetch a fresh proxy list from the configured endpoint and add every
    /// entry that is neither present nor evicted during this run.
    ///
    /// Returns the number of proxies added.
    #[instrument(level = "info", skip_all)]
    pub async fn refill(&self) -> Result<usize, FetchError> {
        let Some(endpoint) = self.settings.proxy_api.as_deref() else {
            return Ok(0);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.settings.check_timeout_secs))
            .build()
            .map_err(FetchError::Client)?;
        let mut request = client.get(endpoint);
        if let Some(key) = self.settings.proxy_api_key.as_deref() {
            request = request.query(&[("key", key)]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(endpoint, e))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(FetchError::Http {
                url: endpoint.to_string(),
                status,
                retriable: false,
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(endpoint, e))?;

        let fresh = parse_proxy_list(&body, &self.settings.scheme);
        let added = self.add_proxies(fresh);
        info!(added, "Refilled proxy pool");
        Ok(added)
    }

    /// Add proxies that are not already pooled and were not evicted.
    pub fn add_proxies(&self, addresses: impl IntoIterator<Item = String>) -> usize {
        let mut state = self.lock();
        let mut added = 0;
        for address in addresses {
            if state.evicted.contains(&address)
                || state.proxies.iter().any(|p| p.address == address)
            {
                continue;
            }
            state.proxies.push(ProxyRecord::new(address));
            added += 1;
        }
        added
    }

    /// Probe every pooled proxy against `check_url` and drop the ones that do
    /// not answer with 200.
    #[instrument(level = "info", skip_all)]
    pub async fn health_check(&self) -> usize {
        let candidates: Vec<String> = self.lock().proxies.iter().map(|p| p.address.clone()).collect();
        let timeout = Duration::from_secs(self.settings.check_timeout_secs);

        let mut dead = Vec::new();
        for address in candidates {
            if probe_proxy(&address, &self.settings.check_url, timeout).await {
                info!(proxy = %address, "Proxy reachable");
            } else {
                warn!(proxy = %address, "Proxy unreachable; dropping");
                dead.push(address);
            }
        }

        let mut state = self.lock();
        state.proxies.retain(|p| !dead.contains(&p.address));
        info!(available = state.proxies.len(), "Proxy health check complete");
        state.proxies.len()
    }

    /// Snapshot of the live proxies and their statistics.
    pub fn proxies(&self) -> Vec<ProxyRecord> {
        self.lock().proxies.clone()
    }

    pub fn is_evicted(&self, address: &str) -> bool {
        self.lock().evicted.contains(address)
    }

    /// Attempts already spent on `url` this run.
    pub fn attempts_for(&self, url: &str) -> u32 {
        self.lock().url_attempts.get(url).copied().unwrap_or(0)
    }
}

/// Rank by success rate and draw uniformly from the top 80%, rounded up.
fn select_proxy(proxies: &mut [ProxyRecord]) -> Option<String> {
    if proxies.is_empty() {
        return None;
    }
    let mut ranked: Vec<usize> = (0..proxies.len()).collect();
    ranked.sort_by(|&a, &b| {
        proxies[b]
            .success_rate()
            .total_cmp(&proxies[a].success_rate())
    });
    let top = (ranked.len() * TOP_PERCENT).div_ceil(100).max(1);
    let &chosen = ranked[..top].choose(&mut rng())?;
    let record = &mut proxies[chosen];
    record.last_used_at = Some(Instant::now());
    Some(record.address.clone())
}

async fn probe_proxy(address: &str, check_url: &str, timeout: Duration) -> bool {
    let Ok(proxy) = reqwest::Proxy::all(address) else {
        return false;
    };
    let Ok(client) = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
    else {
        return false;
    };
    match client.get(check_url).send().await {
        Ok(response) => response.status().as_u16() == 200,
        Err(_) => false,
    }
}

/// Normalize a proxy entry to `scheme://host:port`.
///
/// Entries that already carry a scheme are kept as-is; blank entries are
/// dropped.
pub fn format_proxy(entry: &str, scheme: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        None
    } else if entry.contains("://") {
        Some(entry.to_string())
    } else {
        Some(format!("{scheme}://{entry}"))
    }
}

fn format_proxy_value(value: &Value, scheme: &str) -> Option<String> {
    match value {
        Value::String(s) => format_proxy(s, scheme),
        Value::Object(map) => {
            let ip = map.get("ip").and_then(Value::as_str).unwrap_or("");
            let port = match map.get("port") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            };
            if ip.is_empty() || port.is_empty() {
                return None;
            }
            let username = map.get("username").and_then(Value::as_str).unwrap_or("");
            let password = map.get("password").and_then(Value::as_str).unwrap_or("");
            if !username.is_empty() && !password.is_empty() {
                Some(format!("{scheme}://{username}:{password}@{ip}:{port}"))
            } else {
                Some(format!("{scheme}://{ip}:{port}"))
            }
        }
        _ => None,
    }
}

/// Parse a proxy list response.
///
/// Accepts a JSON array, a JSON object with a `data` array (entries may be
/// strings or `{ip, port, username?, password?}` objects), or plain text with
/// one proxy per line.
pub fn parse_proxy_list(body: &str, scheme: &str) -> Vec<String> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => items
            .iter()
            .filter_map(|v| format_proxy_value(v, scheme))
            .collect(),
        Ok(Value::Object(map)) => match map.get("data") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| format_proxy_value(v, scheme))
                .collect(),
            _ => {
                warn!("Proxy list response has no data array");
                Vec::new()
            }
        },
        Ok(_) => Vec::new(),
        Err(_) => body
            .lines()
            .filter_map(|line| format_proxy(line, scheme))
            .collect(),
    }
}
