//! Crawler configuration loaded from YAML.
//!
//! Every section carries `#[serde(default)]`, so a partial file (or no file at
//! all) still yields a working configuration. The defaults describe the
//! NetEase news site the crawler was first pointed at.
//!
//! ```yaml
//! crawler:
//!   concurrent_requests: 8
//!   retry_times: 3
//! proxy:
//!   enabled: true
//!   proxies: ["10.0.0.2:8080"]
//! database:
//!   url: sqlite://news.db?mode=rwc
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, instrument};

/// Errors raised while reading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top-level settings for a crawl.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub crawler: CrawlerSettings,
    pub proxy: ProxySettings,
    pub user_agents: UserAgentSettings,
    pub frontier: FrontierSettings,
    pub categories: CategorySettings,
    pub database: DatabaseSettings,
    pub schedule: ScheduleSettings,
}

impl Settings {
    /// Load settings from a YAML file.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let settings = Self::from_yaml_str(&raw)?;
        info!("Loaded crawler configuration");
        Ok(settings)
    }

    /// Parse settings from a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Fetch-side tunables: concurrency, delays, retry policy and run cutoffs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Name recorded in the crawl log.
    pub name: String,
    /// Maximum number of concurrent fetch workers.
    pub concurrent_requests: usize,
    /// Base delay before each request, in milliseconds.
    pub download_delay_ms: u64,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub randomize_delay: bool,
    pub timeout_secs: u64,
    /// Total attempts per fetch (first try included).
    pub retry_times: usize,
    pub retry_http_codes: Vec<u16>,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Hard cap on fetch attempts for one URL across the whole run.
    pub max_attempts_per_url: u32,
    /// Stop issuing fetches after this many URLs.
    pub max_pages: Option<usize>,
    /// Stop issuing fetches after this many seconds.
    pub max_duration_secs: Option<u64>,
    /// Capacity of the queue between fetch workers and the ingestion writer.
    pub writer_queue: usize,
    pub autothrottle: AutoThrottleSettings,
    pub default_headers: BTreeMap<String, String>,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        let mut default_headers = BTreeMap::new();
        default_headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        );
        default_headers.insert(
            "Accept-Language".to_string(),
            "zh-CN,zh;q=0.9,en;q=0.8".to_string(),
        );
        Self {
            name: "news_harvest".to_string(),
            concurrent_requests: 32,
            download_delay_ms: 1000,
            randomize_delay: true,
            timeout_secs: 30,
            retry_times: 3,
            retry_http_codes: vec![500, 502, 503, 504, 408, 429],
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            max_attempts_per_url: 20,
            max_pages: None,
            max_duration_secs: None,
            writer_queue: 64,
            autothrottle: AutoThrottleSettings::default(),
            default_headers,
        }
    }
}

/// Adaptive delay that chases a target number of in-flight requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoThrottleSettings {
    pub enabled: bool,
    pub start_delay_ms: u64,
    pub max_delay_ms: u64,
    pub target_concurrency: f64,
}

impl Default for AutoThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            start_delay_ms: 3000,
            max_delay_ms: 30_000,
            target_concurrency: 2.0,
        }
    }
}

/// What to do when every proxy has been evicted and refill failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Keep fetching without a proxy.
    #[default]
    Direct,
    /// Fail the fetch immediately.
    FailFast,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    /// Scheme prepended to bare `host:port` entries.
    pub scheme: String,
    pub proxies: Vec<String>,
    /// Endpoint returning a fresh proxy list.
    pub proxy_api: Option<String>,
    pub proxy_api_key: Option<String>,
    pub check_timeout_secs: u64,
    /// Probe every configured proxy before the run starts.
    pub check_on_start: bool,
    pub check_url: String,
    pub max_fail_times: u32,
    pub on_exhaustion: ExhaustionPolicy,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            scheme: "http".to_string(),
            proxies: Vec::new(),
            proxy_api: None,
            proxy_api_key: None,
            check_timeout_secs: 10,
            check_on_start: false,
            check_url: "http://httpbin.org/ip".to_string(),
            max_fail_times: 3,
            on_exhaustion: ExhaustionPolicy::Direct,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UserAgentSettings {
    pub enabled: bool,
    pub user_agents: Vec<String>,
}

impl Default for UserAgentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            user_agents: [
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:89.0) Gecko/20100101 Firefox/89.0",
                "Mozilla/5.0 (X11; Linux i686; rv:89.0) Gecko/20100101 Firefox/89.0",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36 Edg/91.0.864.59",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
            ]
            .iter()
            .map(|ua| ua.to_string())
            .collect(),
        }
    }
}

/// URL admission rules and seeds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FrontierSettings {
    /// Seed URLs. When empty, the category table URLs are used.
    pub seeds: Vec<String>,
    /// Hosts (and their subdomains) the crawl may visit.
    pub allowed_domains: Vec<String>,
    /// A URL must match at least one of these regexes.
    pub allow_patterns: Vec<String>,
    /// A URL matching any of these regexes is rejected.
    pub deny_patterns: Vec<String>,
    /// URLs matching these regexes are parsed for links only.
    pub listing_patterns: Vec<String>,
    /// Skip content pages whose URL is already in storage.
    pub skip_known: bool,
}

impl Default for FrontierSettings {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            allowed_domains: vec!["163.com".to_string()],
            allow_patterns: vec![
                r"163\.com/\d+/\d+/\d+/.*\.html".to_string(),
                r"163\.com/.*\.html".to_string(),
                r"163\.com/.*\?page=\d+".to_string(),
                r"163\.com/[a-z]+/?$".to_string(),
            ],
            deny_patterns: vec![
                r"163\.com/photo".to_string(),
                r"163\.com/video".to_string(),
            ],
            listing_patterns: vec![
                r"_\d+\.html$".to_string(),
                r"[?&]page=\d+".to_string(),
                r"/special/".to_string(),
                r"/index\.html$".to_string(),
            ],
            skip_known: false,
        }
    }
}

/// One row of the static category table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CategoryEntry {
    pub id: i64,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CategorySettings {
    pub table: Vec<CategoryEntry>,
    /// First host label (e.g. `money` in `money.163.com`) to category id.
    pub subdomains: BTreeMap<String, i64>,
    /// Category used when neither the table nor the subdomain map matches.
    pub default_id: i64,
}

impl Default for CategorySettings {
    fn default() -> Self {
        let table = [
            (1, "Headlines", "https://news.163.com/"),
            (2, "Domestic", "https://news.163.com/domestic/"),
            (3, "World", "https://news.163.com/world/"),
            (4, "Military", "https://news.163.com/military/"),
            (5, "Finance", "https://money.163.com/"),
            (6, "Technology", "https://tech.163.com/"),
            (7, "Sports", "https://sports.163.com/"),
            (8, "Entertainment", "https://ent.163.com/"),
            (9, "Auto", "https://auto.163.com/"),
            (10, "Property", "https://house.163.com/"),
            (11, "Education", "https://edu.163.com/"),
            (12, "Health", "https://jiankang.163.com/"),
            (13, "Travel", "https://travel.163.com/"),
            (14, "Government", "https://gov.163.com/"),
            (15, "Data", "https://data.163.com/"),
            (16, "Lifestyle", "https://lady.163.com/"),
            (17, "Mobile", "https://mobile.163.com/"),
            (18, "Lottery", "https://caipiao.163.com/"),
            (19, "Live", "https://live.163.com/"),
            (20, "Local", "https://news.163.com/local/"),
            (21, "Trending", "https://news.163.com/hot/"),
            (22, "Rankings", "https://news.163.com/rank/"),
            (23, "Specials", "https://news.163.com/special/"),
            (24, "Subscriptions", "https://dy.163.com/"),
        ]
        .into_iter()
        .map(|(id, name, url)| CategoryEntry {
            id,
            name: name.to_string(),
            url: url.to_string(),
        })
        .collect();

        let subdomains = [
            ("money", 5),
            ("tech", 6),
            ("sports", 7),
            ("ent", 8),
            ("auto", 9),
            ("house", 10),
            ("edu", 11),
            ("jiankang", 12),
            ("travel", 13),
            ("gov", 14),
            ("data", 15),
            ("lady", 16),
            ("mobile", 17),
            ("caipiao", 18),
            ("live", 19),
            ("dy", 24),
        ]
        .into_iter()
        .map(|(token, id)| (token.to_string(), id))
        .collect();

        Self {
            table,
            subdomains,
            default_id: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://news.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub interval_hours: u64,
    pub run_on_start: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            run_on_start: true,
        }
    }
}
