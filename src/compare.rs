use ndarray::{Array1, Array2};
use serde::Serialize;
use tracing::warn;

use crate::{
    data::{apply_horizon, Outcome, SurvivalData},
    error::{SurvError, Result},
    kaplan_meier::KaplanMeierCurve,
    logrank::{LogRankResult, LogRankTable},
    metrics::harrell_c_index,
    model::{CoxModel, CoxModelSummary, CoxTerm},
};

/// ridge applied to the group dummies unless configured otherwise; keeps the
/// hazard ratio finite when the groups are completely separated
pub const DEFAULT_COX_L2_PENALTY: f64 = 0.01;

/// per-group view of the comparison
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub label: String,
    pub n: usize,
    pub events: usize,
    pub median_survival: Option<f64>,
    pub curve: KaplanMeierCurve,
}

/// raw (time, event, group) triple a plotting layer needs to redraw the curves
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurveData {
    pub times: Vec<f64>,
    pub events: Vec<bool>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SurvivalComparison {
    pub groups: Vec<GroupSummary>,
    pub logrank: LogRankResult,
    /// one term per non-reference group; the first group is the reference.
    /// empty when the Cox fit failed (log-rank still stands)
    pub cox_terms: Vec<CoxTerm>,
    /// likelihood-ratio test of all group terms together
    pub cox_lr_p_value: Option<f64>,
    pub c_index: Option<f64>,
    pub curve_data: CurveData,
}

impl SurvivalComparison {
    /// the single hazard ratio term of a two-group comparison
    pub fn binary_term(&self) -> Option<&CoxTerm> {
        match self.cox_terms.as_slice() {
            [term] => Some(term),
            _ => None,
        }
    }
}

/// Kaplan-Meier + log-rank + Cox for one labelling of one sample set
#[derive(Debug, Clone)]
pub struct SurvivalComparator {
    horizon: Option<f64>,
    cox_l2_penalty: f64,
    cox_max_iterations: usize,
    cox_tolerance: f64,
}

impl Default for SurvivalComparator {
    fn default() -> Self {
        Self {
            horizon: None,
            cox_l2_penalty: DEFAULT_COX_L2_PENALTY,
            cox_max_iterations: 100,
            cox_tolerance: 1e-9,
        }
    }
}

impl SurvivalComparator {
    pub fn new() -> Self {
        Self::default()
    }

    /// right-censor everything past `days` before any statistic
    pub fn with_horizon(mut self, days: Option<f64>) -> Self {
        self.horizon = days;
        self
    }

    pub fn with_cox_settings(mut self, l2_penalty: f64, max_iterations: usize, tolerance: f64) -> Self {
        self.cox_l2_penalty = l2_penalty;
        self.cox_max_iterations = max_iterations;
        self.cox_tolerance = tolerance;
        self
    }

    pub fn horizon(&self) -> Option<f64> {
        self.horizon
    }

    /// low (reference) vs high
    pub fn compare_binary(&self, high: &[bool], outcomes: &[Outcome]) -> Result<SurvivalComparison> {
        let labels: Vec<usize> = high.iter().map(|&h| usize::from(h)).collect();
        self.compare(&labels, &["low".to_string(), "high".to_string()], outcomes)
    }

    /// `labels[i]` indexes into `group_names`; group 0 is the Cox reference
    pub fn compare(
        &self,
        labels: &[usize],
        group_names: &[String],
        outcomes: &[Outcome],
    ) -> Result<SurvivalComparison> {
        let k = group_names.len();
        if labels.len() != outcomes.len() {
            return Err(SurvError::invalid_dimensions(format!(
                "labels len ({}) != outcomes len ({})",
                labels.len(),
                outcomes.len()
            )));
        }
        if k < 2 {
            return Err(SurvError::invalid_parameter("group_names", k.to_string()));
        }
        if let Some(&bad) = labels.iter().find(|&&g| g >= k) {
            return Err(SurvError::invalid_parameter("label", bad.to_string()));
        }

        let outcomes = apply_horizon(outcomes, self.horizon);

        let mut groups = Vec::with_capacity(k);
        for (g, name) in group_names.iter().enumerate() {
            let members: Vec<Outcome> = labels
                .iter()
                .zip(&outcomes)
                .filter(|(&l, _)| l == g)
                .map(|(_, &o)| o)
                .collect();
            if members.is_empty() {
                return Err(SurvError::insufficient_data(format!("group '{}' is empty", name)));
            }
            let curve = KaplanMeierCurve::from_outcomes(&members);
            let events = curve.total_events();
            if events == 0 {
                // hazard ratio against a zero-event group is unbounded
                return Err(SurvError::degenerate_group(
                    name.clone(),
                    format!("0 events among {} samples", members.len()),
                ));
            }
            groups.push(GroupSummary {
                label: name.clone(),
                n: members.len(),
                events,
                median_survival: curve.median_survival(),
                curve,
            });
        }

        let logrank = LogRankTable::new(&outcomes).test(labels, k)?;

        let covariates = Array2::from_shape_fn((labels.len(), k - 1), |(i, j)| {
            if labels[i] == j + 1 {
                1.0
            } else {
                0.0
            }
        });
        let data = SurvivalData::from_outcomes(&outcomes, covariates)?;
        let (cox_terms, cox_lr_p_value, c_index) = match self.fit_cox(&data, group_names) {
            Ok((summary, risk)) => {
                let c_index = harrell_c_index(risk.view(), data.times(), data.events()).ok();
                (summary.terms, Some(summary.lr_p_value), c_index)
            }
            Err(e) if e.is_recoverable() => {
                warn!(groups = k, error = %e, "cox fit failed, keeping log-rank only");
                (Vec::new(), None, None)
            }
            Err(e) => return Err(e),
        };

        let curve_data = CurveData {
            times: outcomes.iter().map(|o| o.time).collect(),
            events: outcomes.iter().map(|o| o.event).collect(),
            labels: labels.iter().map(|&g| group_names[g].clone()).collect(),
        };

        Ok(SurvivalComparison {
            groups,
            logrank,
            cox_terms,
            cox_lr_p_value,
            c_index,
            curve_data,
        })
    }

    fn fit_cox(&self, data: &SurvivalData, group_names: &[String]) -> Result<(CoxModelSummary, Array1<f64>)> {
        let mut model = CoxModel::new()
            .with_l2_penalty(self.cox_l2_penalty)
            .with_max_iterations(self.cox_max_iterations)
            .with_tolerance(self.cox_tolerance)
            .with_feature_names(group_names[1..].to_vec());
        model.fit(data)?;
        let summary = model.summary()?;
        let risk = model.predict(data.covariates())?;
        Ok((summary, risk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// high group dies within 100 days, low group deaths spread out to ~1200
    fn stratified(n_per_group: usize) -> (Vec<bool>, Vec<Outcome>) {
        let mut high = Vec::new();
        let mut outcomes = Vec::new();
        for i in 0..n_per_group {
            high.push(true);
            outcomes.push(Outcome::new(10.0 + i as f64 * 3.0, true));
            high.push(false);
            outcomes.push(Outcome::new(50.0 + i as f64 * 40.0, i % 2 == 0));
        }
        (high, outcomes)
    }

    #[test]
    fn test_binary_comparison() {
        let (high, outcomes) = stratified(30);
        let result = SurvivalComparator::new().compare_binary(&high, &outcomes).unwrap();

        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.groups[0].label, "low");
        assert_eq!(result.groups[1].n, 30);
        assert!(result.logrank.p_value < 1e-6);
        let term = result.binary_term().unwrap();
        assert!(term.hazard_ratio > 1.0);
        assert!(term.p_value < 0.05);
        assert!(result.c_index.unwrap() > 0.5);
        assert!(result.cox_lr_p_value.unwrap() < 0.05);
        assert_eq!(result.curve_data.labels[0], "high");
    }

    #[test]
    fn test_separated_groups_keep_a_finite_hazard_ratio() {
        // every low-group death comes after every high-group death
        let high: Vec<bool> = (0..100).map(|i| i >= 50).collect();
        let outcomes: Vec<Outcome> = (0..100)
            .map(|i| {
                let time = if i < 50 { 1000.0 + 5.0 * i as f64 } else { 100.0 + (i - 50) as f64 };
                Outcome::new(time, true)
            })
            .collect();
        let result = SurvivalComparator::new().compare_binary(&high, &outcomes).unwrap();

        let term = result.binary_term().unwrap();
        assert!(term.hazard_ratio.is_finite() && term.hazard_ratio > 1.0);
        assert!(term.ci_lower > 1.0 && term.ci_upper.is_finite());
        assert!(term.p_value < 0.05);
        assert!(result.cox_lr_p_value.unwrap() < 1e-10);
        assert!(result.logrank.p_value < 1e-10);
        // same-group pairs tie on risk and earn half credit
        assert!((result.c_index.unwrap() - 3725.0 / 4950.0).abs() < 1e-12);
    }

    #[test]
    fn test_horizon_censors_before_testing() {
        let (high, outcomes) = stratified(30);
        let result = SurvivalComparator::new()
            .with_horizon(Some(600.0))
            .compare_binary(&high, &outcomes)
            .unwrap();
        assert!(result.curve_data.times.iter().all(|&t| t <= 600.0));
        // low-group deaths after day 600 became censorings
        assert_eq!(result.groups[0].events, 7);
        assert_eq!(result.groups[1].events, 30);
    }

    #[test]
    fn test_zero_event_group_is_degenerate() {
        let (high, mut outcomes) = stratified(20);
        for (o, &h) in outcomes.iter_mut().zip(&high) {
            if !h {
                o.event = false;
            }
        }
        let res = SurvivalComparator::new().compare_binary(&high, &outcomes);
        match res {
            Err(SurvError::DegenerateGroup { group, .. }) => assert_eq!(group, "low"),
            other => panic!("expected DegenerateGroup, got {:?}", other),
        }
    }

    #[test]
    fn test_three_groups() {
        let (high, outcomes) = stratified(30);
        let labels: Vec<usize> = high
            .iter()
            .enumerate()
            .map(|(i, &h)| if h { 2 } else if (i / 2) % 4 < 2 { 1 } else { 0 })
            .collect();
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = SurvivalComparator::new().compare(&labels, &names, &outcomes).unwrap();
        assert_eq!(result.cox_terms.len(), 2);
        assert_eq!(result.logrank.degrees_of_freedom, 2);
        assert!(result.binary_term().is_none());
        assert_eq!(result.cox_terms[1].name, "c");
    }

    #[test]
    fn test_input_validation() {
        let (high, outcomes) = stratified(5);
        assert!(SurvivalComparator::new().compare_binary(&high[..3], &outcomes).is_err());
        let all_low = vec![false; outcomes.len()];
        assert!(matches!(
            SurvivalComparator::new().compare_binary(&all_low, &outcomes),
            Err(SurvError::InsufficientData { .. })
        ));
    }
}
