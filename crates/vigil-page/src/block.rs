use scraper::{Html, Selector};

/// Body substrings that mark a bot-challenge or denial page. Matched
/// case-insensitively against the raw document.
const BODY_INDICATORS: &[&str] = &[
    "cloudflare",
    "ddos-guard",
    "captcha",
    "bot detection",
    "access denied",
    "blocked",
    "security check",
    "ray id",
    "cf-ray",
    "please verify you are human",
    "just a moment...",
    "attention required",
];

/// Title substrings that mark a challenge page on their own.
const TITLE_INDICATORS: &[&str] = &["access denied", "blocked", "security check", "captcha"];

/// Minimum visible text length below which a response is treated as a
/// challenge interstitial rather than real content.
const MIN_VISIBLE_TEXT: usize = 100;

/// Why a document was classified as a block page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    TitleIndicator,
    BodyIndicator,
    ThinContent,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::TitleIndicator => "title_indicator",
            BlockReason::BodyIndicator => "body_indicator",
            BlockReason::ThinContent => "thin_content",
        }
    }
}

/// Classify a fetched document before fingerprinting. Returns `Some` when the
/// page is a challenge/denial shell and must not become a baseline.
pub fn detect_block_page(html: &str) -> Option<BlockReason> {
    let doc = Html::parse_document(html);

    if let Some(title) = document_title(&doc) {
        let title = title.to_lowercase();
        if TITLE_INDICATORS.iter().any(|ind| title.contains(ind)) {
            return Some(BlockReason::TitleIndicator);
        }
    }

    let lower = html.to_lowercase();
    if BODY_INDICATORS.iter().any(|ind| lower.contains(ind)) {
        return Some(BlockReason::BodyIndicator);
    }

    if visible_text_len(&doc) < MIN_VISIBLE_TEXT {
        return Some(BlockReason::ThinContent);
    }

    None
}

fn document_title(doc: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    doc.select(&selector)
        .next()
        .map(|el| el.text().collect::<String>())
}

const INVISIBLE_CONTAINERS: &[&str] = &["script", "style", "noscript", "template", "head"];

fn visible_text_len(doc: &Html) -> usize {
    let mut len = 0usize;
    for node in doc.root_element().descendants() {
        if let Some(text) = node.value().as_text() {
            let hidden = node.ancestors().any(|anc| {
                anc.value()
                    .as_element()
                    .is_some_and(|el| INVISIBLE_CONTAINERS.contains(&el.name()))
            });
            if !hidden {
                len += text.trim().chars().count();
            }
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(body: &str) -> String {
        format!("<html><head><title>Example</title></head><body>{body}</body></html>")
    }

    #[test]
    fn cloudflare_ray_id_is_blocked() {
        let html = wrap("<p>Cloudflare Ray ID: abc123 checking your browser</p>");
        assert_eq!(detect_block_page(&html), Some(BlockReason::BodyIndicator));
    }

    #[test]
    fn denial_title_is_blocked() {
        let html = "<html><head><title>Access Denied</title></head><body><p>nope</p></body></html>";
        assert_eq!(detect_block_page(html), Some(BlockReason::TitleIndicator));
    }

    #[test]
    fn thin_content_is_blocked() {
        let html = wrap("<p>almost nothing here</p>");
        assert_eq!(detect_block_page(&html), Some(BlockReason::ThinContent));
    }

    #[test]
    fn real_article_passes() {
        let body = "<article><h1>Quarterly results</h1><p>".to_string()
            + &"Revenue grew steadily across all regions this quarter. ".repeat(5)
            + "</p></article>";
        assert_eq!(detect_block_page(&wrap(&body)), None);
    }

    #[test]
    fn challenge_phrase_beats_long_content() {
        let body = "<p>".to_string()
            + &"Plenty of text that would otherwise pass the length gate. ".repeat(5)
            + "Please verify you are human.</p>";
        assert_eq!(
            detect_block_page(&wrap(&body)),
            Some(BlockReason::BodyIndicator)
        );
    }
}
