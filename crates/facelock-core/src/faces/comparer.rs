use serde::Serialize;

use crate::faces::extractor::FeatureVector;

/// Pearson correlation of two vectors, with negative correlation clamped to 0.
///
/// Zero-variance input yields 0. Vectors of different lengths are a
/// programming error and panic.
pub fn score(lhs: &FeatureVector, rhs: &FeatureVector) -> f64 {
    assert_eq!(
        lhs.len(),
        rhs.len(),
        "feature vectors must have equal length"
    );
    pearson(lhs.values(), rhs.values()).clamp(0.0, 1.0)
}

fn pearson(lhs: &[f32], rhs: &[f32]) -> f64 {
    if lhs.is_empty() {
        return 0.0;
    }
    let n = lhs.len() as f64;
    let mean_lhs = lhs.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let mean_rhs = rhs.iter().map(|&v| f64::from(v)).sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut var_lhs = 0.0;
    let mut var_rhs = 0.0;
    for (&l, &r) in lhs.iter().zip(rhs) {
        let dl = f64::from(l) - mean_lhs;
        let dr = f64::from(r) - mean_rhs;
        covariance += dl * dr;
        var_lhs += dl * dl;
        var_rhs += dr * dr;
    }

    let denominator = (var_lhs * var_rhs).sqrt();
    if denominator <= f64::EPSILON || !denominator.is_finite() {
        return 0.0;
    }
    let correlation = covariance / denominator;
    if correlation.is_nan() {
        0.0
    } else {
        correlation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemplateMatch {
    pub template_index: usize,
    pub similarity: f64,
}

/// First template, in stored order, scoring at or above `tolerance`.
pub fn first_match<'a, I>(candidate: &FeatureVector, templates: I, tolerance: f64) -> Option<TemplateMatch>
where
    I: IntoIterator<Item = &'a FeatureVector>,
{
    templates
        .into_iter()
        .enumerate()
        .map(|(template_index, template)| TemplateMatch {
            template_index,
            similarity: score(candidate, template),
        })
        .find(|candidate| candidate.similarity >= tolerance)
}

/// Highest-scoring template regardless of tolerance; first wins on ties.
pub fn best_match<'a, I>(candidate: &FeatureVector, templates: I) -> Option<TemplateMatch>
where
    I: IntoIterator<Item = &'a FeatureVector>,
{
    let mut best: Option<TemplateMatch> = None;
    for (template_index, template) in templates.into_iter().enumerate() {
        let similarity = score(candidate, template);
        if best.map_or(true, |current| similarity > current.similarity) {
            best = Some(TemplateMatch {
                template_index,
                similarity,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    #[test]
    fn identical_vectors_score_one() {
        let a = vector(&[0.1, 0.4, 0.9, 0.3, 0.7]);
        assert!((score(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_is_symmetric() {
        let a = vector(&[0.1, 0.4, 0.9, 0.3, 0.7]);
        let b = vector(&[0.2, 0.1, 0.8, 0.5, 0.6]);
        assert!((score(&a, &b) - score(&b, &a)).abs() < 1e-12);
    }

    #[test]
    fn anti_correlated_vectors_clamp_to_zero() {
        let a = vector(&[0.0, 0.25, 0.5, 0.75, 1.0]);
        let b = vector(&[1.0, 0.75, 0.5, 0.25, 0.0]);
        assert_eq!(score(&a, &b), 0.0);
    }

    #[test]
    fn zero_variance_scores_zero_not_nan() {
        let flat = vector(&[0.5; 6]);
        let other = vector(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        assert_eq!(score(&flat, &other), 0.0);
        assert_eq!(score(&other, &flat), 0.0);
        assert_eq!(score(&flat, &flat), 0.0);
    }

    #[test]
    #[should_panic(expected = "equal length")]
    fn mismatched_lengths_panic() {
        score(&vector(&[0.1, 0.2]), &vector(&[0.1, 0.2, 0.3]));
    }

    #[test]
    fn first_match_stops_at_first_template_above_tolerance() {
        let candidate = vector(&[0.1, 0.5, 0.9, 0.2]);
        let unrelated = vector(&[0.9, 0.1, 0.2, 0.8]);
        let templates = [unrelated, candidate.clone(), candidate.clone()];
        let found = first_match(&candidate, templates.iter(), 0.7).unwrap();
        assert_eq!(found.template_index, 1);
        assert!(found.similarity >= 0.7);
    }

    #[test]
    fn first_match_returns_none_below_tolerance() {
        let candidate = vector(&[0.1, 0.5, 0.9, 0.2]);
        let templates = [vector(&[0.9, 0.1, 0.2, 0.8])];
        assert!(first_match(&candidate, templates.iter(), 0.7).is_none());
    }

    #[test]
    fn best_match_picks_highest_similarity() {
        let candidate = vector(&[0.1, 0.5, 0.9, 0.2]);
        let near = vector(&[0.1, 0.5, 0.8, 0.3]);
        let templates = [vector(&[0.9, 0.1, 0.2, 0.8]), near, candidate.clone()];
        let best = best_match(&candidate, templates.iter()).unwrap();
        assert_eq!(best.template_index, 2);
    }
}
