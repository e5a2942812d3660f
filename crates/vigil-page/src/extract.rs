use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};

/// Tags whose subtrees never contribute content.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "head", "meta", "link", "iframe", "svg", "title",
];

/// Structural tags counted into the structure signature.
const STRUCTURE_TAGS: &[&str] = &[
    "div", "p", "span", "h1", "h2", "h3", "table", "ul", "li", "article", "section", "main",
    "nav", "aside", "header", "footer",
];

const DEFAULT_WEIGHT: f64 = 0.5;

/// Weighted text runs extracted from a document, in document order.
#[derive(Debug, Clone, Default)]
pub struct WeightedText {
    /// One line per text run, prefixed with its weight-class region.
    pub text: String,
    /// Region → share of extracted characters, each in [0, 1].
    pub weights: BTreeMap<String, f64>,
}

/// Semantic weight and region label for an element, or `None` to inherit
/// from the parent.
fn semantic_class(el: &ElementRef<'_>) -> Option<(f64, &'static str)> {
    let name = el.value().name();
    match name {
        "article" => Some((1.0, "article")),
        "main" => Some((0.9, "main")),
        "h1" | "h2" | "h3" => Some((0.8, "heading")),
        "p" => Some((0.7, "paragraph")),
        "aside" => Some((0.3, "aside")),
        "nav" => Some((0.1, "nav")),
        "footer" => Some((0.1, "footer")),
        "div" if el.value().classes().any(|c| c == "content") => Some((0.8, "content")),
        _ => None,
    }
}

/// Walk the document and collect text runs in document order, each prefixed
/// with the region label of the nearest weighted ancestor so downstream
/// similarity preserves the weighting. Unlisted elements inherit the parent
/// weight; the root defaults to 0.5 / `body`.
pub fn extract_weighted_text(html: &str, scope: Option<&str>) -> WeightedText {
    let doc = Html::parse_document(html);
    let root = scoped_root(&doc, scope);

    let mut runs: Vec<(&'static str, f64, String)> = Vec::new();
    collect_runs(root, DEFAULT_WEIGHT, "body", &mut runs);

    let total: usize = runs.iter().map(|(_, _, t)| t.chars().count()).sum();
    let mut by_region: BTreeMap<String, usize> = BTreeMap::new();
    let mut text = String::new();
    for (region, _weight, run) in &runs {
        *by_region.entry((*region).to_string()).or_default() += run.chars().count();
        text.push('[');
        text.push_str(region);
        text.push_str("] ");
        text.push_str(run);
        text.push('\n');
    }

    let weights = by_region
        .into_iter()
        .map(|(region, chars)| {
            let share = if total == 0 {
                0.0
            } else {
                chars as f64 / total as f64
            };
            (region, share)
        })
        .collect();

    WeightedText { text, weights }
}

fn scoped_root<'a>(doc: &'a Html, scope: Option<&str>) -> ElementRef<'a> {
    if let Some(raw) = scope {
        if let Ok(selector) = Selector::parse(raw) {
            if let Some(el) = doc.select(&selector).next() {
                return el;
            }
        }
    }
    doc.root_element()
}

fn collect_runs(
    el: ElementRef<'_>,
    weight: f64,
    region: &'static str,
    out: &mut Vec<(&'static str, f64, String)>,
) {
    if SKIP_TAGS.contains(&el.value().name()) {
        return;
    }
    let (weight, region) = semantic_class(&el).unwrap_or((weight, region));

    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                let trimmed = text.trim();
                if trimmed.chars().count() > 2 {
                    out.push((region, weight, trimmed.to_string()));
                }
            }
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_runs(child_el, weight, region, out);
                }
            }
            _ => {}
        }
    }
}

/// Compact summary of the DOM skeleton: counts of structural tags in
/// alphabetical order, e.g. `div:4 h1:1 p:7`.
pub fn structure_signature(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for node in doc.root_element().descendants() {
        if let Some(el) = node.value().as_element() {
            if let Some(tag) = STRUCTURE_TAGS.iter().find(|t| **t == el.name()) {
                *counts.entry(tag).or_default() += 1;
            }
        }
    }
    counts
        .into_iter()
        .map(|(tag, n)| format!("{tag}:{n}"))
        .collect::<Vec<_>>()
        .join(" ")
}

static DATE_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap());
static SESSION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)session[\s_-]?id\s*[:=]\s*[\w-]+").unwrap());
static LAST_UPDATED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?im)last updated\s*:?[^\n]*").unwrap());
static CLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{1,2}:\d{2}(:\d{2})?\b").unwrap());
static RAY_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)ray\s*id\s*[:=]\s*\w+").unwrap());
static COPYRIGHT_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)copyright\s*©?\s*\d{4}").unwrap());
static COUNTDOWN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?im)time remaining\s*:[^\n]*").unwrap());

/// Strip dynamic noise so equal content hashes equal. Applied to the
/// weighted text before hashing; the result doubles as the diff baseline.
pub fn filter_noise(text: &str) -> String {
    let text = DATE_LITERAL.replace_all(text, "");
    let text = SESSION_ID.replace_all(&text, "");
    let text = LAST_UPDATED.replace_all(&text, "");
    let text = CLOCK.replace_all(&text, "");
    let text = RAY_ID.replace_all(&text, "");
    let text = COPYRIGHT_YEAR.replace_all(&text, "");
    let text = COUNTDOWN.replace_all(&text, "");

    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let lower = line.to_lowercase();
        if lower.contains("advertisement") || lower.contains("cookie notice") {
            continue;
        }
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() || collapsed == "[body]" || is_bare_region_marker(&collapsed) {
            continue;
        }
        out.push_str(&collapsed);
        out.push('\n');
    }
    out
}

// A run reduced to just its region prefix carries no content.
fn is_bare_region_marker(line: &str) -> bool {
    line.starts_with('[') && line.ends_with(']') && !line.contains(' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_text_outweighs_nav() {
        let html = r#"<html><body>
            <nav>Home About Contact</nav>
            <article><p>The main story lives here and it is long enough.</p></article>
        </body></html>"#;
        let extracted = extract_weighted_text(html, None);
        assert!(extracted.text.contains("[article] "));
        assert!(extracted.text.contains("[nav] "));
        let article = extracted.weights.get("article").copied().unwrap_or(0.0);
        let nav = extracted.weights.get("nav").copied().unwrap_or(0.0);
        assert!(article > nav);
        let total: f64 = extracted.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn paragraph_inside_article_keeps_article_region() {
        // `p` re-labels under its own class even inside `article`; plain
        // spans inherit the enclosing region.
        let html = "<article><span>inline run of text</span><p>para text here</p></article>";
        let extracted = extract_weighted_text(html, None);
        assert!(extracted.text.contains("[article] inline run of text"));
        assert!(extracted.text.contains("[paragraph] para text here"));
    }

    #[test]
    fn scripts_and_short_runs_are_dropped() {
        let html = "<body><script>var x = 1;</script><p>kept content run</p><p>ab</p></body>";
        let extracted = extract_weighted_text(html, None);
        assert!(!extracted.text.contains("var x"));
        assert!(extracted.text.contains("kept content run"));
        assert!(!extracted.text.contains("] ab\n"));
    }

    #[test]
    fn scope_selector_limits_extraction() {
        let html = "<body><div id=\"noise\">ignore this part</div>\
                    <div id=\"target\"><p>only the target area</p></div></body>";
        let extracted = extract_weighted_text(html, Some("#target"));
        assert!(extracted.text.contains("only the target area"));
        assert!(!extracted.text.contains("ignore this part"));
    }

    #[test]
    fn invalid_scope_falls_back_to_document() {
        let html = "<body><p>visible everywhere always</p></body>";
        let extracted = extract_weighted_text(html, Some("p["));
        assert!(extracted.text.contains("visible everywhere always"));
    }

    #[test]
    fn noise_filter_strips_dates_and_session_ids() {
        let text = "[paragraph] Release 2024-03-01 notes\n[paragraph] Session ID: abc-123 end\n";
        let filtered = filter_noise(text);
        assert!(!filtered.contains("2024-03-01"));
        assert!(!filtered.contains("abc-123"));
        assert!(filtered.contains("Release"));
    }

    #[test]
    fn noise_filter_drops_ad_and_cookie_lines() {
        let text = "[paragraph] real content stays\n[aside] Advertisement\n[footer] Cookie notice\n";
        let filtered = filter_noise(text);
        assert_eq!(filtered, "[paragraph] real content stays\n");
    }

    #[test]
    fn last_updated_stripped_to_end_of_line() {
        let text = "[footer] Last updated: just now by the cron\n[paragraph] body text stays\n";
        let filtered = filter_noise(text);
        assert!(!filtered.contains("cron"));
        assert!(filtered.contains("body text stays"));
    }

    #[test]
    fn structure_signature_is_deterministic() {
        let html = "<body><div><p>a</p><p>b</p></div><nav>x</nav></body>";
        let sig = structure_signature(html);
        assert_eq!(sig, "div:1 nav:1 p:2");
        assert_eq!(sig, structure_signature(html));
    }
}
