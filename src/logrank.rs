use ndarray::{Array1, Array2};
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use crate::{
    data::Outcome,
    error::{SurvError, Result},
    optimization::solve_linear_system,
};

/// result of a (k-group) log-rank test
#[derive(Debug, Clone, Serialize)]
pub struct LogRankResult {
    pub statistic: f64,
    pub degrees_of_freedom: usize,
    pub p_value: f64,
    pub observed: Vec<f64>, // events per group
    pub expected: Vec<f64>, // expected events per group under H0
}

/// outcomes pre-sorted into blocks of tied times, reusable across many
/// labelings of the same samples (the cutoff search relabels O(n) times).
#[derive(Debug, Clone)]
pub struct LogRankTable {
    order: Vec<usize>,              // sample indices, descending time
    blocks: Vec<(usize, usize)>,    // [start, end) into `order`, one per distinct time
    events: Vec<bool>,
}

impl LogRankTable {
    pub fn new(outcomes: &[Outcome]) -> Self {
        let mut order: Vec<usize> = (0..outcomes.len()).collect();
        order.sort_by(|&a, &b| outcomes[b].time.total_cmp(&outcomes[a].time).then(a.cmp(&b)));

        let mut blocks = Vec::new();
        let mut start = 0;
        while start < order.len() {
            let t = outcomes[order[start]].time;
            let mut end = start + 1;
            while end < order.len() && outcomes[order[end]].time == t {
                end += 1;
            }
            blocks.push((start, end));
            start = end;
        }

        Self {
            order,
            blocks,
            events: outcomes.iter().map(|o| o.event).collect(),
        }
    }

    pub fn n_samples(&self) -> usize {
        self.events.len()
    }

    /// chi-square statistic (1 df) for `in_group` vs the rest.
    /// `None` when the variance is zero (no information to compare).
    pub fn two_group_statistic(&self, in_group: &[bool]) -> Option<f64> {
        let mut n = 0usize;
        let mut n1 = 0usize;
        let mut observed = 0.0;
        let mut expected = 0.0;
        let mut variance = 0.0;

        // walk from the latest time back so the risk set only ever grows
        for &(start, end) in &self.blocks {
            let mut d = 0usize;
            let mut d1 = 0usize;
            for &i in &self.order[start..end] {
                n += 1;
                if in_group[i] {
                    n1 += 1;
                }
                if self.events[i] {
                    d += 1;
                    if in_group[i] {
                        d1 += 1;
                    }
                }
            }
            if d == 0 {
                continue;
            }
            let (nf, n1f, df) = (n as f64, n1 as f64, d as f64);
            observed += d1 as f64;
            expected += df * n1f / nf;
            if n > 1 {
                variance += df * (n1f / nf) * (1.0 - n1f / nf) * (nf - df) / (nf - 1.0);
            }
        }

        if variance <= 0.0 {
            return None;
        }
        Some((observed - expected).powi(2) / variance)
    }

    /// k-group test; `labels[i]` in `0..n_groups`
    pub fn test(&self, labels: &[usize], n_groups: usize) -> Result<LogRankResult> {
        if labels.len() != self.n_samples() {
            return Err(SurvError::invalid_dimensions(format!(
                "labels len ({}) != samples ({})",
                labels.len(),
                self.n_samples()
            )));
        }
        if n_groups < 2 {
            return Err(SurvError::invalid_parameter("n_groups", n_groups.to_string()));
        }
        if let Some(&bad) = labels.iter().find(|&&g| g >= n_groups) {
            return Err(SurvError::invalid_parameter("label", bad.to_string()));
        }

        let k = n_groups;
        let mut at_risk = vec![0usize; k];
        let mut observed = vec![0.0; k];
        let mut expected = vec![0.0; k];
        let mut covariance = Array2::<f64>::zeros((k, k));

        for &(start, end) in &self.blocks {
            let mut deaths = vec![0usize; k];
            for &i in &self.order[start..end] {
                at_risk[labels[i]] += 1;
                if self.events[i] {
                    deaths[labels[i]] += 1;
                }
            }
            let d: usize = deaths.iter().sum();
            if d == 0 {
                continue;
            }
            let n: usize = at_risk.iter().sum();
            let (nf, df) = (n as f64, d as f64);
            let scale = if n > 1 { df * (nf - df) / (nf - 1.0) } else { 0.0 };
            for g in 0..k {
                let pg = at_risk[g] as f64 / nf;
                observed[g] += deaths[g] as f64;
                expected[g] += df * pg;
                for h in 0..k {
                    let ph = at_risk[h] as f64 / nf;
                    let delta = if g == h { 1.0 } else { 0.0 };
                    covariance[[g, h]] += scale * pg * (delta - ph);
                }
            }
        }

        // drop the last group - the full covariance matrix is singular
        let m = k - 1;
        let u = Array1::from_shape_fn(m, |g| observed[g] - expected[g]);
        let v = covariance.slice(ndarray::s![0..m, 0..m]).to_owned();
        let solved = solve_linear_system(&v, &u).map_err(|_| {
            SurvError::degenerate_group("all", "log-rank variance is singular")
        })?;
        let statistic = u.dot(&solved).max(0.0);

        let dist = ChiSquared::new(m as f64).map_err(|e| SurvError::numerical_error(e.to_string()))?;
        Ok(LogRankResult {
            statistic,
            degrees_of_freedom: m,
            p_value: dist.sf(statistic),
            observed,
            expected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> (Vec<Outcome>, Vec<usize>) {
        let raw = [
            (1.0, true, 1),
            (2.0, true, 1),
            (3.0, true, 0),
            (4.0, false, 1),
            (5.0, true, 1),
            (6.0, true, 0),
            (7.0, false, 0),
            (8.0, true, 0),
        ];
        let outcomes = raw.iter().map(|&(t, e, _)| Outcome::new(t, e)).collect();
        let labels = raw.iter().map(|&(_, _, g)| g).collect();
        (outcomes, labels)
    }

    #[test]
    fn test_two_group_matches_k_group() {
        let (outcomes, labels) = sample();
        let table = LogRankTable::new(&outcomes);
        let in_group: Vec<bool> = labels.iter().map(|&g| g == 1).collect();

        let fast = table.two_group_statistic(&in_group).unwrap();
        let full = table.test(&labels, 2).unwrap();
        assert_relative_eq!(fast, full.statistic, epsilon = 1e-10);
        assert_eq!(full.degrees_of_freedom, 1);
        assert_relative_eq!(full.observed.iter().sum::<f64>(), 6.0, epsilon = 1e-12);
        assert_relative_eq!(
            full.observed.iter().sum::<f64>(),
            full.expected.iter().sum::<f64>(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_hand_computed_statistic() {
        // t=1: 4 at risk, 2 in group 1, one group-1 death
        // t=2: 3 at risk, 1 in group 1, one group-0 death
        let outcomes = vec![
            Outcome::new(1.0, true),
            Outcome::new(3.0, false),
            Outcome::new(2.0, true),
            Outcome::new(3.0, false),
        ];
        let labels = vec![1, 1, 0, 0];
        let result = LogRankTable::new(&outcomes).test(&labels, 2).unwrap();
        // O1 - E1 = 1 - (1/2 + 1/3) = 1/6, V = 1/4 + 2/9 = 17/36
        assert_relative_eq!(result.statistic, 1.0 / 17.0, epsilon = 1e-12);
        assert!(result.p_value > 0.5 && result.p_value < 1.0);
    }

    #[test]
    fn test_identical_groups_have_no_signal() {
        let outcomes: Vec<Outcome> = (0..20).map(|i| Outcome::new((i / 2) as f64 + 1.0, true)).collect();
        let labels: Vec<usize> = (0..20).map(|i| i % 2).collect();
        let result = LogRankTable::new(&outcomes).test(&labels, 2).unwrap();
        assert!(result.statistic < 1e-9);
    }

    #[test]
    fn test_three_groups() {
        let (outcomes, mut labels) = sample();
        labels[6] = 2;
        labels[7] = 2;
        labels[0] = 2;
        let result = LogRankTable::new(&outcomes).test(&labels, 3).unwrap();
        assert_eq!(result.degrees_of_freedom, 2);
        assert!(result.p_value > 0.0 && result.p_value <= 1.0);
    }

    #[test]
    fn test_bad_labels() {
        let (outcomes, labels) = sample();
        assert!(LogRankTable::new(&outcomes).test(&labels[..3], 2).is_err());
        assert!(LogRankTable::new(&outcomes).test(&labels, 1).is_err());
        let mut bad = labels.clone();
        bad[0] = 5;
        assert!(LogRankTable::new(&outcomes).test(&bad, 2).is_err());
    }

    #[test]
    fn test_no_variance() {
        let outcomes = vec![Outcome::new(1.0, false), Outcome::new(2.0, false)];
        let table = LogRankTable::new(&outcomes);
        assert_eq!(table.two_group_statistic(&[true, false]), None);
    }
}
