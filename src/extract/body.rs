//! Article body location and text recovery.
//!
//! Known template containers are tried first. When none of them matches, the
//! body is taken to be the element holding the most direct `<p>` children,
//! counting only paragraphs outside navigation chrome and scripts.

use super::strategies::selector;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

/// Template containers, most specific first.
const BODY_SELECTORS: &[&str] = &[
    "div.post_body",
    "div.post_text",
    "div#endText",
    "div.article-content",
    "div.content",
    "article",
    "div.main-content",
];

/// Elements whose text never belongs to an article body.
const NOISE_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "noscript", "iframe",
];

/// Elements that end a line of body text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "section", "tr",
];

pub struct BodyLocator {
    containers: Vec<Selector>,
    paragraph: Selector,
    body: Selector,
}

impl Default for BodyLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyLocator {
    pub fn new() -> Self {
        Self {
            containers: BODY_SELECTORS.iter().map(|css| selector(css)).collect(),
            paragraph: selector("p"),
            body: selector("body"),
        }
    }

    /// The element holding the article body.
    pub fn locate<'a>(&self, document: &'a Html) -> Option<ElementRef<'a>> {
        self.by_template(document)
            .or_else(|| self.densest_paragraph_container(document))
            .or_else(|| document.select(&self.body).next())
    }

    fn by_template<'a>(&self, document: &'a Html) -> Option<ElementRef<'a>> {
        self.containers.iter().find_map(|container| {
            document
                .select(container)
                .find(|element| !visible_text(*element).is_empty())
        })
    }

    /// The element with the most direct `<p>` children, ignoring paragraphs
    /// nested in noise elements. Ties go to the first in document order.
    pub fn densest_paragraph_container<'a>(&self, document: &'a Html) -> Option<ElementRef<'a>> {
        let mut counts: Vec<(ElementRef<'a>, usize)> = Vec::new();

        for paragraph in document.select(&self.paragraph) {
            if has_noise_ancestor(paragraph) {
                continue;
            }
            let Some(parent) = paragraph.parent().and_then(ElementRef::wrap) else {
                continue;
            };
            match counts.iter_mut().find(|(seen, _)| seen.id() == parent.id()) {
                Some((_, count)) => *count += 1,
                None => counts.push((parent, 1)),
            }
        }

        let best = counts.iter().map(|(_, count)| *count).max()?;
        counts
            .into_iter()
            .find(|(_, count)| *count == best)
            .map(|(element, _)| element)
    }
}

fn is_noise(element: ElementRef<'_>) -> bool {
    NOISE_TAGS.contains(&element.value().name())
}

fn has_noise_ancestor(element: ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(is_noise)
}

/// Visible text of `element`: noise elements are skipped, each block element
/// ends a line, whitespace inside a line is collapsed and blank lines dropped.
pub fn visible_text(element: ElementRef<'_>) -> String {
    let mut raw = String::new();
    collect_text(element, &mut raw);
    raw.lines()
        .map(crate::utils::clean_spaces)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                if is_noise(child) {
                    continue;
                }
                let block = BLOCK_TAGS.contains(&child.value().name());
                if block {
                    out.push('\n');
                }
                collect_text(child, out);
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_container_preferred() {
        let doc = Html::parse_document(
            r#"<html><body>
                <div class="post_body"><p>Lead.</p><p>Second.</p></div>
                <div class="other"><p>1</p><p>2</p><p>3</p></div>
            </body></html>"#,
        );
        let body = BodyLocator::new().locate(&doc).unwrap();
        assert_eq!(visible_text(body), "Lead.\nSecond.");
    }

    #[test]
    fn test_densest_cluster_fallback() {
        let doc = Html::parse_document(
            r#"<html><body>
                <nav><p>Home</p><p>World</p><p>Tech</p><p>Sports</p><p>Ent</p><p>Auto</p></nav>
                <div id="sidebar"><p>Ad one</p><p>Ad two</p></div>
                <div id="story">
                  <p>First paragraph.</p><p>Second paragraph.</p><p>Third paragraph.</p>
                  <p>Fourth paragraph.</p><p>Fifth paragraph.</p>
                  <script>var tracking = 1;</script>
                </div>
            </body></html>"#,
        );
        let body = BodyLocator::new().locate(&doc).unwrap();
        assert_eq!(body.value().attr("id"), Some("story"));
        let text = visible_text(body);
        assert!(text.starts_with("First paragraph."));
        assert!(text.ends_with("Fifth paragraph."));
        assert!(!text.contains("tracking"));
    }

    #[test]
    fn test_empty_template_match_is_skipped() {
        let doc = Html::parse_document(
            r#"<html><body><div class="post_body">  </div>
               <div class="post_text"><p>Real text</p></div></body></html>"#,
        );
        let body = BodyLocator::new().locate(&doc).unwrap();
        assert_eq!(visible_text(body), "Real text");
    }

    #[test]
    fn test_body_element_last_resort() {
        let doc = Html::parse_document("<html><body><span>just a span</span></body></html>");
        let body = BodyLocator::new().locate(&doc).unwrap();
        assert_eq!(body.value().name(), "body");
        assert_eq!(visible_text(body), "just a span");
    }
}
