//! Ordered field strategies.
//!
//! Each scalar field of an article (title, source, author, ...) is resolved by
//! a [`FieldChain`]: an ordered list of [`FieldStrategy`] objects tried until
//! one yields a non-empty value. Template drift is handled by appending
//! another strategy to a chain, not by adding branches.

use crate::utils::clean_spaces;
use scraper::{Html, Selector};
use tracing::trace;

/// One way of recovering a text field from a parsed document.
pub trait FieldStrategy: Send + Sync {
    /// Short label used in logs.
    fn label(&self) -> &str;

    /// The cleaned, non-empty value, or `None` to let the next strategy try.
    fn try_extract(&self, document: &Html) -> Option<String>;
}

pub(crate) fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

/// Text of the first matching element that has any.
pub struct SelectorText {
    css: String,
    selector: Selector,
}

impl SelectorText {
    pub fn new(css: &str) -> Self {
        Self {
            css: css.to_string(),
            selector: selector(css),
        }
    }
}

impl FieldStrategy for SelectorText {
    fn label(&self) -> &str {
        &self.css
    }

    fn try_extract(&self, document: &Html) -> Option<String> {
        document
            .select(&self.selector)
            .map(|element| clean_spaces(&element.text().collect::<String>()))
            .find(|text| !text.is_empty())
    }
}

/// An attribute of the first matching element, e.g. `time[datetime]`.
pub struct SelectorAttr {
    css: String,
    selector: Selector,
    attr: String,
}

impl SelectorAttr {
    pub fn new(css: &str, attr: &str) -> Self {
        Self {
            css: format!("{css}@{attr}"),
            selector: selector(css),
            attr: attr.to_string(),
        }
    }
}

impl FieldStrategy for SelectorAttr {
    fn label(&self) -> &str {
        &self.css
    }

    fn try_extract(&self, document: &Html) -> Option<String> {
        document
            .select(&self.selector)
            .filter_map(|element| element.value().attr(&self.attr))
            .map(clean_spaces)
            .find(|text| !text.is_empty())
    }
}

/// `<meta name=".." content="..">` or `<meta property=".." content="..">`.
pub struct MetaContent {
    key: String,
    selector: Selector,
}

impl MetaContent {
    pub fn name(key: &str) -> Self {
        Self {
            key: format!("meta:{key}"),
            selector: selector(&format!(r#"meta[name="{key}"]"#)),
        }
    }

    pub fn property(key: &str) -> Self {
        Self {
            key: format!("meta:{key}"),
            selector: selector(&format!(r#"meta[property="{key}"]"#)),
        }
    }
}

impl FieldStrategy for MetaContent {
    fn label(&self) -> &str {
        &self.key
    }

    fn try_extract(&self, document: &Html) -> Option<String> {
        let content = document
            .select(&self.selector)
            .next()?
            .value()
            .attr("content")?;
        non_empty(clean_spaces(content))
    }
}

/// Ordered strategies for one field; first hit wins.
pub struct FieldChain {
    field: &'static str,
    strategies: Vec<Box<dyn FieldStrategy>>,
}

impl FieldChain {
    pub fn new(field: &'static str) -> Self {
        Self {
            field,
            strategies: Vec::new(),
        }
    }

    pub fn with(mut self, strategy: impl FieldStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Texts of several selectors, tried in order.
    pub fn with_selectors(mut self, selectors: &[&str]) -> Self {
        for css in selectors {
            self.strategies.push(Box::new(SelectorText::new(css)));
        }
        self
    }

    pub fn resolve(&self, document: &Html) -> Option<String> {
        self.strategies.iter().find_map(|strategy| {
            let value = strategy.try_extract(document)?;
            trace!(field = self.field, strategy = strategy.label(), "Field resolved");
            Some(value)
        })
    }

    /// Like [`FieldChain::resolve`] but degrades to an empty string.
    pub fn resolve_or_empty(&self, document: &Html) -> String {
        self.resolve(document).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head>
          <meta property="og:title" content="  Meta   Title ">
          <meta name="description" content="">
        </head><body>
          <h1 class="title">   </h1>
          <h1 class="title">Second  heading</h1>
          <time datetime="2024-05-01T10:00:00+08:00">May 1</time>
        </body></html>"#;

    #[test]
    fn test_selector_text_skips_empty_matches() {
        let doc = Html::parse_document(PAGE);
        let strategy = SelectorText::new("h1.title");
        assert_eq!(strategy.try_extract(&doc).as_deref(), Some("Second heading"));
    }

    #[test]
    fn test_meta_and_attr_strategies() {
        let doc = Html::parse_document(PAGE);
        assert_eq!(
            MetaContent::property("og:title").try_extract(&doc).as_deref(),
            Some("Meta Title")
        );
        assert_eq!(MetaContent::name("description").try_extract(&doc), None);
        assert_eq!(
            SelectorAttr::new("time", "datetime").try_extract(&doc).as_deref(),
            Some("2024-05-01T10:00:00+08:00")
        );
    }

    #[test]
    fn test_chain_is_first_match_wins() {
        let doc = Html::parse_document(PAGE);
        let chain = FieldChain::new("title")
            .with_selectors(&["h1.post_title"])
            .with(MetaContent::property("og:title"))
            .with_selectors(&["h1.title"]);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.resolve(&doc).as_deref(), Some("Meta Title"));

        let missing = FieldChain::new("author").with_selectors(&["div.post_author"]);
        assert_eq!(missing.resolve_or_empty(&doc), "");
    }

    #[test]
    fn test_strategy_labels() {
        assert_eq!(MetaContent::name("author").label(), "meta:author");
        assert_eq!(MetaContent::property("og:title").label(), "meta:og:title");
        assert_eq!(SelectorAttr::new("time", "datetime").label(), "time@datetime");
        assert_eq!(SelectorText::new("h1.title").label(), "h1.title");
    }
}
