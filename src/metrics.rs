use ndarray::ArrayView1;
use crate::error::{SurvError, Result};

/// Harrell's C-index with tie handling - how often higher risk = shorter survival.
/// tied risk scores count one half.
pub fn harrell_c_index(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: &[bool],
) -> Result<f64> {
    let n = risk_scores.len();
    if n != times.len() || n != events.len() {
        return Err(SurvError::invalid_dimensions(
            "risk scores, times, and events must have same length",
        ));
    }

    let mut concordant = 0.0;
    let mut discordant = 0.0;
    let mut tied_risk = 0.0;

    for i in 0..n {
        if !events[i] {
            continue; // censored obs can't anchor a pair
        }

        for j in 0..n {
            if i == j {
                continue;
            }

            // j is comparable to i if j outlived i (event or censored)
            if times[j] > times[i] || (!events[j] && times[j] >= times[i]) {
                if risk_scores[i] > risk_scores[j] {
                    concordant += 1.0;
                } else if risk_scores[i] < risk_scores[j] {
                    discordant += 1.0;
                } else {
                    tied_risk += 1.0;
                }
            }
        }
    }

    let total_pairs = concordant + discordant + tied_risk;
    if total_pairs == 0.0 {
        return Err(SurvError::numerical_error("no comparable pairs for C-index"));
    }

    Ok((concordant + 0.5 * tied_risk) / total_pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use approx::assert_relative_eq;

    #[test]
    fn test_perfect_concordance() {
        let times = Array1::from(vec![1.0, 2.0, 3.0, 4.0]);
        let events = vec![true, true, true, true];
        let risk_scores = Array1::from(vec![4.0, 3.0, 2.0, 1.0]);

        let c_index = harrell_c_index(risk_scores.view(), times.view(), &events).unwrap();
        assert_relative_eq!(c_index, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_binary_labels_tie_half() {
        let times = Array1::from(vec![1.0, 2.0]);
        let events = vec![true, true];
        let risk_scores = Array1::from(vec![1.0, 1.0]);
        let c_index = harrell_c_index(risk_scores.view(), times.view(), &events).unwrap();
        assert_relative_eq!(c_index, 0.5, epsilon = 1e-10);
    }

    #[test]
    fn test_dimension_mismatch_error() {
        let risk_scores = Array1::from(vec![1.0, 2.0]);
        let times = Array1::from(vec![1.0, 2.0, 3.0]);
        let events = vec![true, false];
        assert!(harrell_c_index(risk_scores.view(), times.view(), &events).is_err());
    }
}
