//! Category resolution from an article URL.
//!
//! 1. Longest matching prefix in the static category table
//! 2. First host label through the subdomain map (`money.163.com` -> Finance)
//! 3. The configured default category

use crate::config::CategorySettings;
use crate::models::CategoryHint;
use std::collections::{BTreeMap, HashMap};
use url::Url;

/// Name used when the default id is missing from the table.
const FALLBACK_NAME: &str = "Headlines";

#[derive(Debug, Clone)]
pub struct CategoryResolver {
    /// `(scheme-less prefix, id)`, longest prefix first.
    prefixes: Vec<(String, i64)>,
    subdomains: BTreeMap<String, i64>,
    names: HashMap<i64, String>,
    default_id: i64,
}

impl CategoryResolver {
    pub fn new(settings: &CategorySettings) -> Self {
        let mut prefixes: Vec<(String, i64)> = settings
            .table
            .iter()
            .map(|entry| (strip_scheme(&entry.url).to_string(), entry.id))
            .collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            prefixes,
            subdomains: settings.subdomains.clone(),
            names: settings
                .table
                .iter()
                .map(|entry| (entry.id, entry.name.clone()))
                .collect(),
            default_id: settings.default_id,
        }
    }

    pub fn resolve(&self, url: &Url) -> CategoryHint {
        let id = self
            .by_prefix(url)
            .or_else(|| self.by_subdomain(url))
            .unwrap_or(self.default_id);
        self.hint(id)
    }

    fn by_prefix(&self, url: &Url) -> Option<i64> {
        let target = strip_scheme(url.as_str());
        self.prefixes
            .iter()
            .find(|(prefix, _)| target.starts_with(prefix.as_str()))
            .map(|(_, id)| *id)
    }

    fn by_subdomain(&self, url: &Url) -> Option<i64> {
        let token = url.host_str()?.split('.').next()?;
        self.subdomains.get(token).copied()
    }

    fn hint(&self, id: i64) -> CategoryHint {
        CategoryHint {
            id,
            name: self
                .names
                .get(&id)
                .cloned()
                .unwrap_or_else(|| FALLBACK_NAME.to_string()),
        }
    }
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}
