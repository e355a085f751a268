//! Candidate selection
//!
//! Ranks masks by a [`SelectionPolicy`] score. Missing signals count as zero,
//! non-finite scores rank as zero, and ties go to the earliest mask, so the
//! outcome depends only on the candidates and their order.

use crate::config::SelectionPolicy;
use crate::types::Mask;

/// Ranking value of one mask under `policy`
#[must_use]
pub fn score(mask: &Mask, policy: SelectionPolicy) -> f64 {
    let area = mask.area().unwrap_or(0.0);
    let confidence = f64::from(mask.confidence().unwrap_or(0.0));
    let value = match policy {
        SelectionPolicy::Salience { epsilon } => area * confidence.max(f64::from(epsilon)),
        SelectionPolicy::Area => area,
        SelectionPolicy::Confidence => confidence,
    };
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Index of the winning mask, `None` when there are no candidates
#[must_use]
pub fn select(masks: &[Mask], policy: SelectionPolicy) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, mask) in masks.iter().enumerate() {
        let value = score(mask, policy);
        match best {
            Some((_, top)) if value <= top => {},
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

/// Every index, best first; equal scores keep their original order
#[must_use]
pub fn rank(masks: &[Mask], policy: SelectionPolicy) -> Vec<usize> {
    let scores: Vec<f64> = masks.iter().map(|m| score(m, policy)).collect();
    let mut order: Vec<usize> = (0..masks.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SALIENCE_EPSILON;

    fn candidates(confidences: [f32; 3]) -> Vec<Mask> {
        [10.0, 50.0, 30.0]
            .iter()
            .zip(confidences)
            .map(|(&area, conf)| Mask::filled(2, 2, 1.0).with_area(area).with_confidence(conf))
            .collect()
    }

    fn salience() -> SelectionPolicy {
        SelectionPolicy::Salience {
            epsilon: DEFAULT_SALIENCE_EPSILON,
        }
    }

    #[test]
    fn test_salience_prefers_confident_area() {
        let masks = candidates([0.9, 0.1, 0.9]);
        let scores: Vec<f64> = masks.iter().map(|m| score(m, salience())).collect();
        assert!((scores[0] - 9.0).abs() < 1e-4);
        assert!((scores[1] - 5.0).abs() < 1e-4);
        assert!((scores[2] - 27.0).abs() < 1e-4);
        assert_eq!(select(&masks, salience()), Some(2));
    }

    #[test]
    fn test_salience_epsilon_floor() {
        let masks = candidates([0.0, 0.0, 0.0]);
        let scores: Vec<f64> = masks.iter().map(|m| score(m, salience())).collect();
        assert!((scores[0] - 0.1).abs() < 1e-6);
        assert!((scores[1] - 0.5).abs() < 1e-6);
        assert!((scores[2] - 0.3).abs() < 1e-6);
        assert_eq!(select(&masks, salience()), Some(1));
    }

    #[test]
    fn test_area_and_confidence_policies() {
        let masks = candidates([0.9, 0.1, 0.95]);
        assert_eq!(select(&masks, SelectionPolicy::Area), Some(1));
        assert_eq!(select(&masks, SelectionPolicy::Confidence), Some(2));
    }

    #[test]
    fn test_empty_is_none() {
        assert_eq!(select(&[], salience()), None);
        assert!(rank(&[], SelectionPolicy::Area).is_empty());
    }

    #[test]
    fn test_ties_go_to_first_and_missing_signals_are_zero() {
        let masks = vec![
            Mask::filled(1, 1, 1.0),
            Mask::filled(1, 1, 1.0).with_area(5.0),
            Mask::filled(1, 1, 1.0).with_area(5.0),
        ];
        assert_eq!(select(&masks, SelectionPolicy::Area), Some(1));
        assert_eq!(select(&masks, SelectionPolicy::Confidence), Some(0));
        assert_eq!(rank(&masks, SelectionPolicy::Area), vec![1, 2, 0]);
    }

    #[test]
    fn test_non_finite_scores_rank_as_zero() {
        let masks = vec![
            Mask::filled(1, 1, 1.0).with_area(f64::INFINITY),
            Mask::filled(1, 1, 1.0).with_area(f64::NAN),
            Mask::filled(1, 1, 1.0).with_area(1.0),
        ];
        assert_eq!(score(&masks[0], SelectionPolicy::Area), 0.0);
        assert_eq!(score(&masks[1], SelectionPolicy::Area), 0.0);
        assert_eq!(select(&masks, SelectionPolicy::Area), Some(2));
    }

    #[test]
    fn test_rank_orders_by_score() {
        let masks = candidates([0.9, 0.1, 0.9]);
        assert_eq!(rank(&masks, salience()), vec![2, 0, 1]);
    }
}
