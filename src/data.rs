use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use crate::error::{SurvError, Result};

/// one patient's follow-up: time in days + whether the event was observed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub time: f64,
    pub event: bool,
}

impl Outcome {
    pub fn new(time: f64, event: bool) -> Self {
        Self { time, event }
    }

    /// right-censor at `horizon`: anything observed past it becomes
    /// "alive at horizon". idempotent.
    pub fn censored_at(self, horizon: f64) -> Self {
        if self.time > horizon {
            Self { time: horizon, event: false }
        } else {
            self
        }
    }
}

/// apply an optional censoring horizon to a whole outcome vector
pub fn apply_horizon(outcomes: &[Outcome], horizon: Option<f64>) -> Vec<Outcome> {
    match horizon {
        Some(h) => outcomes.iter().map(|o| o.censored_at(h)).collect(),
        None => outcomes.to_vec(),
    }
}

/// survival data - times, events, and per-patient covariates
#[derive(Debug, Clone)]
pub struct SurvivalData {
    times: Array1<f64>,      // time to event/censoring
    events: Vec<bool>,       // true = event, false = censored
    covariates: Array2<f64>, // n_samples x n_features
    order: Vec<usize>,       // sample indices sorted by ascending time
}

impl SurvivalData {
    pub fn new(times: Vec<f64>, events: Vec<bool>, covariates: Array2<f64>) -> Result<Self> {
        let n_samples = times.len();

        if events.len() != n_samples {
            return Err(SurvError::invalid_dimensions(format!(
                "times len ({}) != events len ({})",
                n_samples,
                events.len()
            )));
        }

        if covariates.nrows() != n_samples {
            return Err(SurvError::invalid_dimensions(format!(
                "covariates rows ({}) != n_samples ({})",
                covariates.nrows(),
                n_samples
            )));
        }

        if times.iter().any(|&t| t < 0.0 || !t.is_finite()) {
            return Err(SurvError::invalid_survival_data(
                "survival times must be non-negative & finite",
            ));
        }

        let mut order: Vec<usize> = (0..n_samples).collect();
        order.sort_by(|&a, &b| times[a].total_cmp(&times[b]).then(a.cmp(&b)));

        Ok(Self {
            times: Array1::from(times),
            events,
            covariates,
            order,
        })
    }

    /// outcomes + covariate matrix in one go
    pub fn from_outcomes(outcomes: &[Outcome], covariates: Array2<f64>) -> Result<Self> {
        let times = outcomes.iter().map(|o| o.time).collect();
        let events = outcomes.iter().map(|o| o.event).collect();
        Self::new(times, events, covariates)
    }

    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    pub fn n_features(&self) -> usize {
        self.covariates.ncols()
    }

    pub fn n_events(&self) -> usize {
        self.events.iter().filter(|&&e| e).count()
    }

    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    /// event indicators (true = event, false = censored)
    pub fn events(&self) -> &[bool] {
        &self.events
    }

    pub fn covariates(&self) -> ArrayView2<'_, f64> {
        self.covariates.view()
    }

    /// sample indices in ascending time order (ties keep input order)
    pub fn time_order(&self) -> &[usize] {
        &self.order
    }
}
