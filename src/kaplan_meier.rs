use serde::Serialize;

use crate::data::Outcome;

/// product-limit curve, one entry per distinct event time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KaplanMeierCurve {
    pub times: Vec<f64>,
    pub survival_prob: Vec<f64>,
    pub std_error: Vec<f64>, // greenwood
    pub at_risk: Vec<usize>, // time >= t
    pub events: Vec<usize>,
    pub n_subjects: usize,
}

impl KaplanMeierCurve {
    /// ```
    /// # use expr_survival::{data::Outcome, kaplan_meier::KaplanMeierCurve};
    /// let curve = KaplanMeierCurve::from_outcomes(&[
    ///     Outcome::new(10.0, true),
    ///     Outcome::new(20.0, false),
    ///     Outcome::new(30.0, true),
    /// ]);
    /// assert_eq!(curve.times, vec![10.0, 30.0]);
    /// assert!((curve.survival_at(15.0) - 2.0 / 3.0).abs() < 1e-12);
    /// ```
    #[must_use]
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        let mut data = outcomes.to_vec();
        data.sort_by(|a, b| a.time.total_cmp(&b.time));

        let total = data.len();
        let mut times = vec![];
        let mut survival_prob = vec![];
        let mut std_error = vec![];
        let mut at_risk_vec = vec![];
        let mut events_vec = vec![];

        let mut current_survival = 1.0;
        let mut greenwood_sum = 0.0;

        let mut i = 0;
        while i < data.len() {
            let current_time = data[i].time;
            let at_risk = total - i;

            let mut event_count = 0;
            let mut j = i;
            while j < data.len() && data[j].time == current_time {
                if data[j].event {
                    event_count += 1;
                }
                j += 1;
            }

            if event_count > 0 {
                let d = event_count as f64;
                let n = at_risk as f64;
                current_survival *= 1.0 - d / n;
                if at_risk > event_count {
                    greenwood_sum += d / (n * (n - d));
                }

                times.push(current_time);
                survival_prob.push(current_survival);
                std_error.push(current_survival * greenwood_sum.sqrt());
                at_risk_vec.push(at_risk);
                events_vec.push(event_count);
            }

            i = j;
        }

        Self {
            times,
            survival_prob,
            std_error,
            at_risk: at_risk_vec,
            events: events_vec,
            n_subjects: total,
        }
    }

    /// first event time with survival <= 0.5; `None` if never reached
    #[must_use]
    pub fn median_survival(&self) -> Option<f64> {
        self.survival_prob
            .iter()
            .position(|&s| s <= 0.5)
            .map(|idx| self.times[idx])
    }

    /// right-continuous step lookup
    #[must_use]
    pub fn survival_at(&self, time: f64) -> f64 {
        match self.times.iter().rposition(|&t| t <= time) {
            Some(idx) => self.survival_prob[idx],
            None => 1.0,
        }
    }

    #[must_use]
    pub fn total_events(&self) -> usize {
        self.events.iter().sum()
    }
}
