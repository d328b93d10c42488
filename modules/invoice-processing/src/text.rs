//! Text comparison helpers shared by the matching services.

/// Case-insensitive sequence-ratio similarity in [0, 1].
///
/// Empty input on either side compares as fully dissimilar, which keeps the
/// matching strategies conservative on missing fields.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
}
