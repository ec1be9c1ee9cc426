use tracing::debug;

use crate::{
    cohort::Cohort,
    error::{SurvError, Result},
};

pub const DEFAULT_MIN_NONZERO_FRACTION: f64 = 0.9;

/// fraction of samples with a measured, non-zero value for each gene
pub fn nonzero_fractions(cohort: &Cohort) -> Vec<f64> {
    let n = cohort.n_samples();
    cohort
        .matrix()
        .rows()
        .into_iter()
        .map(|row| {
            if n == 0 {
                return 0.0;
            }
            let expressed = row.iter().filter(|&&v| v.is_finite() && v != 0.0).count();
            expressed as f64 / n as f64
        })
        .collect()
}

/// drop genes expressed (non-missing, non-zero) in fewer than
/// `min_nonzero_fraction` of the samples
pub fn filter_low_expression(cohort: &Cohort, min_nonzero_fraction: f64) -> Result<Cohort> {
    if !(0.0..=1.0).contains(&min_nonzero_fraction) {
        return Err(SurvError::invalid_parameter(
            "min_nonzero_fraction",
            min_nonzero_fraction.to_string(),
        ));
    }
    if cohort.n_samples() == 0 {
        return Err(SurvError::empty_result(format!("{} has no samples", cohort.cancer())));
    }

    let keep: Vec<usize> = nonzero_fractions(cohort)
        .iter()
        .enumerate()
        .filter(|(_, &f)| f >= min_nonzero_fraction)
        .map(|(i, _)| i)
        .collect();

    if keep.is_empty() {
        return Err(SurvError::empty_result(format!(
            "no gene in {} passes {:.0}% non-zero",
            cohort.cancer(),
            min_nonzero_fraction * 100.0
        )));
    }

    debug!(
        cancer = cohort.cancer(),
        kept = keep.len(),
        dropped = cohort.n_genes() - keep.len(),
        "low-expression filter"
    );
    let all_samples: Vec<usize> = (0..cohort.n_samples()).collect();
    cohort.select(&keep, &all_samples)
}

/// restrict to `sample_ids`, in the order given
pub fn subset(cohort: &Cohort, sample_ids: &[String]) -> Result<Cohort> {
    let mut cols = Vec::with_capacity(sample_ids.len());
    for id in sample_ids {
        match cohort.sample_position(id) {
            Some(j) => cols.push(j),
            None => {
                return Err(SurvError::invalid_parameter(
                    "sample",
                    format!("{} not in {}", id, cohort.cancer()),
                ))
            }
        }
    }
    if cols.is_empty() {
        return Err(SurvError::empty_result(format!(
            "subset of {} selects no samples",
            cohort.cancer()
        )));
    }
    if cohort.n_genes() == 0 {
        return Err(SurvError::empty_result(format!("{} has no genes", cohort.cancer())));
    }

    let all_genes: Vec<usize> = (0..cohort.n_genes()).collect();
    cohort.select(&all_genes, &cols)
}

/// keep only the listed genes (order of `genes`); unknown names are skipped
pub fn select_genes(cohort: &Cohort, genes: &[String]) -> Result<Cohort> {
    let rows: Vec<usize> = genes
        .iter()
        .filter_map(|g| cohort.genes().iter().position(|have| have == g))
        .collect();
    if rows.is_empty() {
        return Err(SurvError::empty_result(format!(
            "none of the requested genes are in {}",
            cohort.cancer()
        )));
    }
    let all_samples: Vec<usize> = (0..cohort.n_samples()).collect();
    cohort.select(&rows, &all_samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::Sample;
    use crate::data::Outcome;
    use ndarray::Array2;

    fn cohort() -> Cohort {
        let samples = (0..10)
            .map(|i| Sample::new(format!("S{}", i), Outcome::new(i as f64 + 1.0, true)))
            .collect();
        let mut values = Vec::new();
        // ALWAYS: expressed everywhere
        values.extend((0..10).map(|i| i as f64 + 1.0));
        // NINE: one zero -> exactly 90%
        values.extend((0..10).map(|i| if i == 0 { 0.0 } else { 2.0 }));
        // SPARSE: one zero + one missing -> 80%
        values.extend((0..10).map(|i| match i {
            0 => 0.0,
            1 => f64::NAN,
            _ => 3.0,
        }));
        let expression = Array2::from_shape_vec((3, 10), values).unwrap();
        let genes = vec!["ALWAYS".into(), "NINE".into(), "SPARSE".into()];
        Cohort::new("LUAD", genes, samples, expression).unwrap()
    }

    #[test]
    fn test_default_threshold_is_inclusive() {
        let filtered = filter_low_expression(&cohort(), DEFAULT_MIN_NONZERO_FRACTION).unwrap();
        assert_eq!(filtered.genes(), &["ALWAYS".to_string(), "NINE".to_string()]);
        assert_eq!(filtered.n_samples(), 10);
    }

    #[test]
    fn test_filter_everything_is_an_error() {
        let only_sparse = select_genes(&cohort(), &["SPARSE".to_string()]).unwrap();
        assert!(matches!(
            filter_low_expression(&only_sparse, 0.9),
            Err(SurvError::EmptyResult { .. })
        ));
        assert!(filter_low_expression(&cohort(), 1.5).is_err());
    }

    #[test]
    fn test_subset_preserves_requested_order() {
        let ids: Vec<String> = vec!["S7".into(), "S2".into(), "S5".into()];
        let sub = subset(&cohort(), &ids).unwrap();
        assert_eq!(sub.sample_ids(), ids);
        assert_eq!(sub.expression("ALWAYS").unwrap().to_vec(), vec![8.0, 3.0, 6.0]);
        assert_eq!(sub.samples()[0].outcome.time, 8.0);
    }

    #[test]
    fn test_subset_empty_and_unknown() {
        assert!(matches!(subset(&cohort(), &[]), Err(SurvError::EmptyResult { .. })));
        assert!(subset(&cohort(), &["nope".to_string()]).is_err());
    }

    #[test]
    fn test_subgroup_recomputes_sparsity() {
        // within S0..S4 the NINE gene is only 80% expressed
        let ids: Vec<String> = (0..5).map(|i| format!("S{}", i)).collect();
        let sub = subset(&cohort(), &ids).unwrap();
        let filtered = filter_low_expression(&sub, 0.9).unwrap();
        assert_eq!(filtered.genes(), &["ALWAYS".to_string()]);
    }
}
