use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Aggregation weights for the final similarity score.
pub const WEIGHT_JACCARD: f64 = 0.4;
pub const WEIGHT_LEVENSHTEIN: f64 = 0.4;
pub const WEIGHT_SEMANTIC: f64 = 0.2;

/// Classification bands over the final score. Boundaries are inclusive on
/// the lower side: `final >= UI_TWEAK_FLOOR` is a UI tweak, and so on down.
pub const UI_TWEAK_FLOOR: f64 = 0.70;
pub const CONTENT_UPDATE_FLOOR: f64 = 0.30;

/// Magnitude of a detected change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    UiTweak,
    ContentUpdate,
    MajorOverhaul,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::UiTweak => "UI_TWEAK",
            ChangeType::ContentUpdate => "CONTENT_UPDATE",
            ChangeType::MajorOverhaul => "MAJOR_OVERHAUL",
        }
    }
}

/// Individual metrics plus their weighted aggregate, all in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SimilarityMetrics {
    pub jaccard: f64,
    pub levenshtein: f64,
    pub semantic: f64,
    pub final_score: f64,
}

/// Word-set overlap over lowercased whitespace-split tokens. Two empty
/// texts are identical.
pub fn jaccard(old: &str, new: &str) -> f64 {
    let set_a: HashSet<String> = old.split_whitespace().map(str::to_lowercase).collect();
    let set_b: HashSet<String> = new.split_whitespace().map(str::to_lowercase).collect();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 1.0;
    }
    set_a.intersection(&set_b).count() as f64 / union as f64
}

// Character-pair product above which the quadratic matcher is skipped in
// favour of a cheap token-level approximation.
const QUADRATIC_LIMIT: usize = 16_000_000;

/// Ratcliff–Obershelp similarity over characters: twice the matched-block
/// length over the combined length, the classic sequence-matcher ratio that
/// stands in for a normalized Levenshtein distance.
pub fn sequence_ratio(old: &str, new: &str) -> f64 {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.len().saturating_mul(b.len()) > QUADRATIC_LIMIT {
        // Very large documents: match on whitespace-split tokens instead of
        // characters, which keeps the same shape at a fraction of the cost.
        let ta: Vec<&str> = old.split_whitespace().collect();
        let tb: Vec<&str> = new.split_whitespace().collect();
        if ta.is_empty() || tb.is_empty() {
            return 0.0;
        }
        let matched = matching_len(&ta, &tb);
        return 2.0 * matched as f64 / (ta.len() + tb.len()) as f64;
    }
    let matched = matching_len(&a, &b);
    2.0 * matched as f64 / (a.len() + b.len()) as f64
}

/// Total length of greedily matched blocks: take the longest common run,
/// then recurse on both unmatched sides.
fn matching_len<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let (ai, bi, len) = longest_common_run(a, b);
    if len == 0 {
        return 0;
    }
    len + matching_len(&a[..ai], &b[..bi]) + matching_len(&a[ai + len..], &b[bi + len..])
}

fn longest_common_run<T: PartialEq>(a: &[T], b: &[T]) -> (usize, usize, usize) {
    let mut best = (0usize, 0usize, 0usize);
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for (i, item) in a.iter().enumerate() {
        for (j, other) in b.iter().enumerate() {
            if item == other {
                let run = prev[j] + 1;
                cur[j + 1] = run;
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            } else {
                cur[j + 1] = 0;
            }
        }
        std::mem::swap(&mut prev, &mut cur);
        cur.fill(0);
    }
    best
}

/// Agreement between two structure signatures (`tag:count` summaries).
/// Missing or empty signatures on both sides count as full agreement.
pub fn signature_agreement(old: &str, new: &str) -> f64 {
    let a = parse_signature(old);
    let b = parse_signature(new);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let mut diff = 0i64;
    let mut total = 0i64;
    let tags: HashSet<&str> = a.keys().chain(b.keys()).copied().collect();
    for tag in tags {
        let ca = *a.get(tag).unwrap_or(&0);
        let cb = *b.get(tag).unwrap_or(&0);
        diff += (ca - cb).abs();
        total += ca + cb;
    }
    if total == 0 {
        return 1.0;
    }
    1.0 - diff as f64 / total as f64
}

fn parse_signature(sig: &str) -> BTreeMap<&str, i64> {
    sig.split_whitespace()
        .filter_map(|part| {
            let (tag, count) = part.split_once(':')?;
            Some((tag, count.parse().ok()?))
        })
        .collect()
}

/// Compute all metrics between the old and new filtered texts plus their
/// structure signatures.
pub fn compare_texts(
    old_text: &str,
    new_text: &str,
    old_signature: &str,
    new_signature: &str,
) -> SimilarityMetrics {
    let jaccard = jaccard(old_text, new_text);
    let levenshtein = sequence_ratio(old_text, new_text);
    let semantic = signature_agreement(old_signature, new_signature);
    let final_score =
        jaccard * WEIGHT_JACCARD + levenshtein * WEIGHT_LEVENSHTEIN + semantic * WEIGHT_SEMANTIC;
    SimilarityMetrics {
        jaccard,
        levenshtein,
        semantic,
        final_score,
    }
}

/// Map a final score below the alert threshold onto a change magnitude.
pub fn classify(final_score: f64) -> ChangeType {
    if final_score >= UI_TWEAK_FLOOR {
        ChangeType::UiTweak
    } else if final_score >= CONTENT_UPDATE_FLOOR {
        ChangeType::ContentUpdate
    } else {
        ChangeType::MajorOverhaul
    }
}
