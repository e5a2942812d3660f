use std::fmt::Write as _;
use std::io::{Read as _, Write as _};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use similar::{ChangeTag, TextDiff};
use vigil_page::{
    classify, jaccard, sequence_ratio, ChangeType, SimilarityMetrics, WeightedFingerprint,
    WEIGHT_JACCARD, WEIGHT_LEVENSHTEIN, WEIGHT_SEMANTIC,
};

use crate::errors::EngineError;
use crate::models::{ForensicSnapshot, Monitor, SNAPSHOT_LIMIT};

/// Longest diff delivered untruncated; above it the first
/// `TRUNCATED_DIFF_CHARS` survive plus a warning and a summary line.
pub const MAX_DIFF_CHARS: usize = 3_000;
pub const TRUNCATED_DIFF_CHARS: usize = 2_800;

/// Outcome of comparing the stored baseline against a fresh fingerprint.
#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    pub metrics: SimilarityMetrics,
    /// `None` when the final score clears the monitor's threshold.
    pub change: Option<ChangeType>,
}

pub fn evaluate(
    old: &WeightedFingerprint,
    new: &WeightedFingerprint,
    threshold: f64,
) -> Evaluation {
    let metrics = vigil_page::compare_texts(
        &old.content_text,
        &new.content_text,
        &old.structure_signature,
        &new.structure_signature,
    );
    let change = if metrics.final_score >= threshold {
        None
    } else {
        Some(classify(metrics.final_score))
    };
    Evaluation { metrics, change }
}

/// Unified line diff bounded for chat delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct SafeDiff {
    pub text: String,
    pub truncated: bool,
    /// One-line `+N lines added` / `N lines removed` / `N lines modified`.
    pub summary: String,
}

pub fn safe_diff(old_text: &str, new_text: &str) -> SafeDiff {
    let diff = TextDiff::from_lines(old_text, new_text);
    let mut unified = diff.unified_diff();
    unified.context_radius(2);
    let mut full = String::new();
    let mut added = 0usize;
    let mut removed = 0usize;
    for hunk in unified.iter_hunks() {
        let _ = writeln!(full, "{}", hunk.header());
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => {
                    removed += 1;
                    '-'
                }
                ChangeTag::Insert => {
                    added += 1;
                    '+'
                }
                ChangeTag::Equal => ' ',
            };
            full.push(sign);
            full.push_str(change.value().trim_end_matches('\n'));
            full.push('\n');
        }
    }

    let summary = if added > removed {
        format!("+{} lines added", added - removed)
    } else if removed > added {
        format!("{} lines removed", removed - added)
    } else {
        format!("{} lines modified", added)
    };

    let total = full.chars().count();
    if total <= MAX_DIFF_CHARS {
        return SafeDiff {
            text: full,
            truncated: false,
            summary,
        };
    }

    let mut kept: String = full.chars().take(TRUNCATED_DIFF_CHARS).collect();
    if let Some(cut) = kept.rfind('\n') {
        kept.truncate(cut + 1);
    }
    let _ = writeln!(kept, "... diff truncated ({total} chars total)");
    let _ = writeln!(kept, "{summary}");
    SafeDiff {
        text: kept,
        truncated: true,
        summary,
    }
}

pub fn compress_content(text: &str) -> Result<String, EngineError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|err| EngineError::Storage(format!("compressing snapshot: {err}")))?;
    let bytes = encoder
        .finish()
        .map_err(|err| EngineError::Storage(format!("compressing snapshot: {err}")))?;
    Ok(BASE64.encode(bytes))
}

pub fn decompress_content(encoded: &str) -> Result<String, EngineError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|err| EngineError::Storage(format!("snapshot is not valid base64: {err}")))?;
    let mut out = String::new();
    ZlibDecoder::new(bytes.as_slice())
        .read_to_string(&mut out)
        .map_err(|err| EngineError::Storage(format!("decompressing snapshot: {err}")))?;
    Ok(out)
}

/// Build a forensic snapshot of a change decision. The new side carries
/// the raw fetched document, pre-filter; the old side carries the
/// canonical filtered baseline, the only form of the previous revision
/// that survives a cycle.
pub fn create_snapshot(
    old_text: &str,
    new_raw: &str,
    change_type: ChangeType,
    metrics: SimilarityMetrics,
    diff: &SafeDiff,
) -> Result<ForensicSnapshot, EngineError> {
    Ok(ForensicSnapshot {
        timestamp: Utc::now(),
        old_content_compressed: compress_content(old_text)?,
        new_content_compressed: compress_content(new_raw)?,
        change_type,
        similarity_metrics: metrics,
        diff_summary: diff.summary.clone(),
        diff_truncated: diff.truncated,
    })
}

/// Newest snapshot first; the ring never exceeds the limit.
pub fn push_snapshot(monitor: &mut Monitor, snapshot: ForensicSnapshot) {
    monitor.forensic_snapshots.insert(0, snapshot);
    monitor.forensic_snapshots.truncate(SNAPSHOT_LIMIT);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayResult {
    pub metrics: SimilarityMetrics,
    pub change_type: ChangeType,
}

/// Decompress a snapshot and recompute the decision with the current
/// algorithms: the raw new-side document is reduced to canonical text
/// again before comparison, through the same extraction and noise filter
/// the live pipeline uses. `scope` is the monitor's custom selector when
/// one was configured at decision time. The structural metric is carried
/// from the snapshot since the old DOM skeleton is not retained.
pub fn replay(
    snapshot: &ForensicSnapshot,
    scope: Option<&str>,
) -> Result<ReplayResult, EngineError> {
    let old_text = decompress_content(&snapshot.old_content_compressed)?;
    let new_raw = decompress_content(&snapshot.new_content_compressed)?;
    let new_text = vigil_page::filter_noise(&vigil_page::extract_weighted_text(&new_raw, scope).text);
    let jaccard = jaccard(&old_text, &new_text);
    let levenshtein = sequence_ratio(&old_text, &new_text);
    let semantic = snapshot.similarity_metrics.semantic;
    let final_score =
        jaccard * WEIGHT_JACCARD + levenshtein * WEIGHT_LEVENSHTEIN + semantic * WEIGHT_SEMANTIC;
    let metrics = SimilarityMetrics {
        jaccard,
        levenshtein,
        semantic,
        final_score,
    };
    Ok(ReplayResult {
        metrics,
        change_type: classify(final_score),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(text: &str, signature: &str) -> WeightedFingerprint {
        WeightedFingerprint {
            hash: format!("{:x}", md5ish(text)),
            version: vigil_page::FINGERPRINT_VERSION.to_string(),
            content_weights: Default::default(),
            structure_signature: signature.to_string(),
            content_text: text.to_string(),
        }
    }

    fn md5ish(text: &str) -> u64 {
        // Stable stand-in hash for fixtures; the real pipeline uses SHA-256.
        text.bytes().fold(0u64, |acc, b| {
            acc.wrapping_mul(31).wrapping_add(u64::from(b))
        })
    }

    #[test]
    fn minor_edit_clears_the_default_threshold() {
        let old = fingerprint("The quick brown fox jumps over the lazy dog", "p:1");
        let new = fingerprint("The quick brown fox leaps over the lazy dog", "p:1");
        let eval = evaluate(&old, &new, 0.85);
        assert!(eval.metrics.final_score >= 0.85);
        assert!(eval.change.is_none());
    }

    #[test]
    fn rewrite_is_flagged_as_major_overhaul() {
        let old = fingerprint("Original article about technology trends", "article:1 p:4");
        let new = fingerprint(
            "Completely different article about cooking recipes",
            "div:9 table:2",
        );
        let eval = evaluate(&old, &new, 0.85);
        assert!(eval.metrics.final_score < 0.30);
        assert_eq!(eval.change, Some(ChangeType::MajorOverhaul));
    }

    #[test]
    fn threshold_one_alerts_on_any_drift() {
        let old = fingerprint("alpha beta gamma", "p:1");
        let new = fingerprint("alpha beta gamma delta", "p:1");
        let eval = evaluate(&old, &new, 1.0);
        assert!(eval.change.is_some());
    }

    #[test]
    fn short_diff_is_untruncated() {
        let diff = safe_diff("line one\nline two\n", "line one\nline 2\n");
        assert!(!diff.truncated);
        assert!(diff.text.contains("-line two"));
        assert!(diff.text.contains("+line 2"));
        assert_eq!(diff.summary, "1 lines modified");
    }

    #[test]
    fn truncation_boundary_is_exact() {
        // Build old/new whose diff is long and check both sides of the cap.
        let old: String = (0..400).map(|i| format!("stable line {i}\n")).collect();
        let new: String = (0..400).map(|i| format!("rewritten line {i}\n")).collect();
        let diff = safe_diff(&old, &new);
        assert!(diff.text.chars().count() > TRUNCATED_DIFF_CHARS);
        assert!(diff.truncated);
        assert!(diff.text.contains("diff truncated"));
        assert!(diff.text.contains(&diff.summary));

        let small = safe_diff("a\nb\n", "a\nc\n");
        assert!(small.text.chars().count() <= MAX_DIFF_CHARS);
        assert!(!small.truncated);
    }

    #[test]
    fn added_and_removed_counts_summarise() {
        let diff = safe_diff("a\n", "a\nb\nc\n");
        assert_eq!(diff.summary, "+2 lines added");
        let diff = safe_diff("a\nb\nc\n", "a\n");
        assert_eq!(diff.summary, "2 lines removed");
    }

    #[test]
    fn snapshot_round_trips_and_replays_identically() {
        // The decision compares canonical texts; the snapshot keeps the old
        // baseline text plus the raw new document.
        let old_html = "<article><p>Original article about technology trends \
                        and the quarterly outlook.</p></article>";
        let new_html = "<div class=\"content\"><table><tr><td>Completely different \
                        article about cooking recipes and weekend menus.</td></tr>\
                        </table></div>";
        let old_text =
            vigil_page::filter_noise(&vigil_page::extract_weighted_text(old_html, None).text);
        let new_text =
            vigil_page::filter_noise(&vigil_page::extract_weighted_text(new_html, None).text);
        let metrics =
            vigil_page::compare_texts(&old_text, &new_text, "article:1 p:1", "div:1 table:1");
        let diff = safe_diff(&old_text, &new_text);
        let snapshot =
            create_snapshot(&old_text, new_html, classify(metrics.final_score), metrics, &diff)
                .unwrap();

        assert_eq!(
            decompress_content(&snapshot.old_content_compressed).unwrap(),
            old_text
        );
        assert_eq!(
            decompress_content(&snapshot.new_content_compressed).unwrap(),
            new_html
        );

        let replayed = replay(&snapshot, None).unwrap();
        assert_eq!(replayed.change_type, snapshot.change_type);
        assert!((replayed.metrics.final_score - metrics.final_score).abs() < 1e-9);
        assert!((replayed.metrics.jaccard - metrics.jaccard).abs() < 1e-9);
    }

    #[test]
    fn snapshot_ring_keeps_newest_three() {
        let mut monitor = crate::models::Monitor::new(
            "https://a.example".into(),
            "https://a.example/".into(),
            Utc::now(),
        );
        for i in 0..5 {
            let diff = safe_diff("a", "b");
            let snapshot = create_snapshot(
                &format!("old {i}"),
                &format!("new {i}"),
                ChangeType::ContentUpdate,
                SimilarityMetrics::default(),
                &diff,
            )
            .unwrap();
            push_snapshot(&mut monitor, snapshot);
        }
        assert_eq!(monitor.forensic_snapshots.len(), SNAPSHOT_LIMIT);
        let newest = decompress_content(&monitor.forensic_snapshots[0].new_content_compressed)
            .unwrap();
        assert_eq!(newest, "new 4");
    }

    #[test]
    fn corrupt_snapshot_payload_is_reported() {
        assert!(matches!(
            decompress_content("!!! not base64 !!!"),
            Err(EngineError::Storage(_))
        ));
    }
}
