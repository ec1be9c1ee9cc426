use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    data::Outcome,
    error::{SurvError, Result},
    logrank::LogRankTable,
};

/// how the high/low threshold is chosen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CutoffMethod {
    /// scan every observed value, keep the split with the largest log-rank statistic
    Optimal,
    Median,
    /// fixed percentile in (0, 100)
    Percentile(f64),
}

/// chosen split for one gene within one (sub)cohort
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CutoffResult {
    /// optimal search: midpoint between the largest low and the smallest high
    /// value, so it is usually not an observed expression. fixed modes report
    /// the quantile itself
    pub cutoff: f64,
    pub method: CutoffMethod,
    pub high: Vec<bool>, // per sample, input order; true = expression > cutoff
    pub n_low: usize,
    pub n_high: usize,
    pub statistic: Option<f64>, // log-rank chi-square of this split
    pub candidates_tested: usize,
    pub log2_scale: bool,
}

impl CutoffResult {
    /// 0 = low, 1 = high
    pub fn labels(&self) -> Vec<usize> {
        self.high.iter().map(|&h| usize::from(h)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct CutoffOptimizer {
    method: CutoffMethod,
    min_group_fraction: f64,
    transform_to_log2: bool,
}

impl Default for CutoffOptimizer {
    fn default() -> Self {
        Self {
            method: CutoffMethod::Optimal,
            min_group_fraction: 0.1,
            transform_to_log2: false,
        }
    }
}

impl CutoffOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: CutoffMethod) -> Self {
        self.method = method;
        self
    }

    /// smallest allowed group as a fraction of the samples
    pub fn with_min_group_fraction(mut self, fraction: f64) -> Self {
        self.min_group_fraction = fraction;
        self
    }

    pub fn with_log2(mut self, transform: bool) -> Self {
        self.transform_to_log2 = transform;
        self
    }

    pub fn min_group_size(&self, n_samples: usize) -> usize {
        ((self.min_group_fraction * n_samples as f64).ceil() as usize).max(1)
    }

    pub fn optimize(&self, expression: &[f64], outcomes: &[Outcome]) -> Result<CutoffResult> {
        if expression.len() != outcomes.len() {
            return Err(SurvError::invalid_dimensions(format!(
                "expression len ({}) != outcomes len ({})",
                expression.len(),
                outcomes.len()
            )));
        }
        if !(self.min_group_fraction > 0.0 && self.min_group_fraction <= 0.5) {
            return Err(SurvError::invalid_parameter(
                "min_group_fraction",
                self.min_group_fraction.to_string(),
            ));
        }

        let values: Vec<f64> = if self.transform_to_log2 {
            expression.iter().map(|&x| (x + 1.0).log2()).collect()
        } else {
            expression.to_vec()
        };
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SurvError::invalid_parameter(
                "expression",
                "non-finite value (missing samples must be dropped first)",
            ));
        }

        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        let distinct = count_distinct(&values, &order);
        if distinct < 2 {
            return Err(SurvError::insufficient_data(format!(
                "{} distinct expression value(s) across {} samples",
                distinct,
                values.len()
            )));
        }

        let table = LogRankTable::new(outcomes);
        match self.method {
            CutoffMethod::Optimal => self.search(&values, &order, &table),
            CutoffMethod::Median => self.fixed(&values, &order, &table, 50.0),
            CutoffMethod::Percentile(p) => {
                if !(p > 0.0 && p < 100.0) {
                    return Err(SurvError::invalid_parameter("percentile", p.to_string()));
                }
                self.fixed(&values, &order, &table, p)
            }
        }
    }

    /// ascending scan over distinct values; strict `>` keeps the lowest cutoff on ties
    fn search(&self, values: &[f64], order: &[usize], table: &LogRankTable) -> Result<CutoffResult> {
        let n = values.len();
        let min_size = self.min_group_size(n);
        let mut high = vec![true; n];
        let mut best: Option<(f64, usize, f64, Vec<bool>)> = None; // (statistic, n_low, cutoff, labels)
        let mut tested = 0usize;

        let mut pos = 0;
        while pos < n {
            let value = values[order[pos]];
            while pos < n && values[order[pos]] == value {
                high[order[pos]] = false;
                pos += 1;
            }
            if pos == n {
                break; // the maximum can't be a cutoff
            }
            let n_low = pos;
            if n_low < min_size || n - n_low < min_size {
                continue;
            }
            tested += 1;

            let Some(statistic) = table.two_group_statistic(&high) else {
                continue;
            };
            trace!(cutoff = value, statistic, "cutoff candidate");
            if best.as_ref().map_or(true, |(s, ..)| statistic > *s) {
                // report the midpoint to the next observed value
                let cutoff = 0.5 * (value + values[order[pos]]);
                best = Some((statistic, n_low, cutoff, high.clone()));
            }
        }

        let Some((statistic, n_low, cutoff, high)) = best else {
            return Err(SurvError::insufficient_data(format!(
                "no cutoff leaves >= {} samples on both sides of {} ({} candidates tested)",
                min_size, n, tested
            )));
        };

        Ok(CutoffResult {
            cutoff,
            method: CutoffMethod::Optimal,
            high,
            n_low,
            n_high: n - n_low,
            statistic: Some(statistic),
            candidates_tested: tested,
            log2_scale: self.transform_to_log2,
        })
    }

    fn fixed(
        &self,
        values: &[f64],
        order: &[usize],
        table: &LogRankTable,
        percentile: f64,
    ) -> Result<CutoffResult> {
        let sorted: Vec<f64> = order.iter().map(|&i| values[i]).collect();
        let cutoff = quantile_sorted(&sorted, percentile / 100.0);
        let high: Vec<bool> = values.iter().map(|&v| v > cutoff).collect();
        let n_high = high.iter().filter(|&&h| h).count();
        let n_low = values.len() - n_high;
        if n_high == 0 || n_low == 0 {
            return Err(SurvError::insufficient_data(format!(
                "cutoff {} puts every sample on one side",
                cutoff
            )));
        }

        Ok(CutoffResult {
            cutoff,
            method: self.method,
            statistic: table.two_group_statistic(&high),
            high,
            n_low,
            n_high,
            candidates_tested: 1,
            log2_scale: self.transform_to_log2,
        })
    }
}

fn count_distinct(values: &[f64], order: &[usize]) -> usize {
    let mut count = 0;
    let mut last: Option<f64> = None;
    for &i in order {
        if last != Some(values[i]) {
            count += 1;
            last = Some(values[i]);
        }
    }
    count
}

/// linear-interpolated quantile of already sorted values (R type 7)
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}
