//! HTML → fingerprint pipeline and content-similarity primitives.
//!
//! This crate is the pure, I/O-free half of the monitoring engine: it turns
//! raw HTML into a versioned [`WeightedFingerprint`] (block-page detection,
//! structure-aware extraction, noise filtering, stable hashing) and computes
//! the similarity metrics the change detector aggregates. Everything here is
//! deterministic so that forensic replay recomputes identical results for an
//! unchanged algorithm version.

mod block;
mod extract;
mod fingerprint;
mod similarity;

pub use block::{detect_block_page, BlockReason};
pub use extract::{extract_weighted_text, filter_noise, structure_signature};
pub use fingerprint::{generate_fingerprint, PageError, WeightedFingerprint, FINGERPRINT_VERSION};
pub use similarity::{
    classify, compare_texts, jaccard, sequence_ratio, signature_agreement, ChangeType,
    SimilarityMetrics, CONTENT_UPDATE_FLOOR, UI_TWEAK_FLOOR, WEIGHT_JACCARD, WEIGHT_LEVENSHTEIN,
    WEIGHT_SEMANTIC,
};
