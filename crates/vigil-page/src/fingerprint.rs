use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::block::{detect_block_page, BlockReason};
use crate::extract::{extract_weighted_text, filter_noise, structure_signature};

/// Algorithm version stamped into every fingerprint. Bump this whenever the
/// extraction, noise filter, or hashing changes; loaded fingerprints with an
/// older tag are silently re-baselined on the next patrol.
pub const FINGERPRINT_VERSION: &str = "v2.0";

#[derive(Debug, Error)]
pub enum PageError {
    #[error("block page detected ({})", .0.as_str())]
    BlockPage(BlockReason),
}

/// Versioned, weight-aware digest of a page's noise-filtered content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedFingerprint {
    /// SHA-256 (hex) of `content_text`.
    pub hash: String,
    pub version: String,
    /// Structural region → share of extracted characters, each in [0, 1].
    #[serde(default)]
    pub content_weights: BTreeMap<String, f64>,
    /// Compact DOM-skeleton summary, compared for the semantic metric.
    #[serde(default)]
    pub structure_signature: String,
    /// The noise-filtered weighted text the hash covers. Kept so the next
    /// cycle can diff against it without refetching.
    #[serde(default)]
    pub content_text: String,
}

/// Run the full pipeline: block detection, weighted extraction, noise
/// filtering, hashing. `scope` narrows extraction to a user-supplied CSS
/// selector when one is configured.
pub fn generate_fingerprint(
    html: &str,
    scope: Option<&str>,
) -> Result<WeightedFingerprint, PageError> {
    if let Some(reason) = detect_block_page(html) {
        return Err(PageError::BlockPage(reason));
    }

    let extracted = extract_weighted_text(html, scope);
    let content_text = filter_noise(&extracted.text);

    let mut hasher = Sha256::new();
    hasher.update(content_text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Ok(WeightedFingerprint {
        hash,
        version: FINGERPRINT_VERSION.to_string(),
        content_weights: extracted.weights,
        structure_signature: structure_signature(html),
        content_text,
    })
}

impl WeightedFingerprint {
    /// True when this fingerprint was produced by an older algorithm and the
    /// baseline must be silently regenerated.
    pub fn is_stale_version(&self) -> bool {
        self.version != FINGERPRINT_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>Release notes</title></head><body>
        <article>
            <h1>Version 3 shipped</h1>
            <p>The new release improves throughput for every workspace tier
               and reduces cold-start latency across the fleet.</p>
        </article>
        <footer>Last updated: 2024-01-05</footer>
    </body></html>"#;

    #[test]
    fn fingerprint_is_stable_across_noise() {
        let changed = PAGE.replace("2024-01-05", "2025-06-30");
        let a = generate_fingerprint(PAGE, None).unwrap();
        let b = generate_fingerprint(&changed, None).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.content_text, b.content_text);
    }

    #[test]
    fn fingerprint_tracks_content_changes() {
        let changed = PAGE.replace("improves throughput", "degrades throughput");
        let a = generate_fingerprint(PAGE, None).unwrap();
        let b = generate_fingerprint(&changed, None).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn block_page_yields_no_fingerprint() {
        let html = "<html><head><title>Just a checkpoint</title></head>\
                    <body>Cloudflare Ray ID: 7f2a</body></html>";
        assert!(matches!(
            generate_fingerprint(html, None),
            Err(PageError::BlockPage(_))
        ));
    }

    #[test]
    fn version_staleness() {
        let mut fp = generate_fingerprint(PAGE, None).unwrap();
        assert!(!fp.is_stale_version());
        fp.version = "v1.0".into();
        assert!(fp.is_stale_version());
    }

    #[test]
    fn serde_round_trip() {
        let fp = generate_fingerprint(PAGE, None).unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        let back: WeightedFingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);
    }
}
