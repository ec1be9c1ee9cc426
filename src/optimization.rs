use ndarray::{Array1, Array2};
use tracing::debug;
use crate::{
    data::SurvivalData,
    error::{SurvError, Result},
};

/// Configuration for the Cox partial-likelihood solver
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    pub l2_penalty: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub max_step_halvings: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            l2_penalty: 0.0,
            max_iterations: 100,
            tolerance: 1e-9,
            max_step_halvings: 20,
        }
    }
}

/// what the solver hands back: coefficients plus the curvature at the optimum
#[derive(Debug, Clone)]
pub struct CoxFit {
    pub beta: Array1<f64>,
    pub log_likelihood: f64,      // unpenalized, at beta
    pub null_log_likelihood: f64, // at beta = 0
    pub information: Array2<f64>, // observed information (-hessian), penalty included
    pub iterations: usize,
}

/// log partial likelihood + first/second derivatives at one beta
#[derive(Debug, Clone)]
pub(crate) struct Derivatives {
    pub loglik: f64,
    pub gradient: Array1<f64>,
    pub hessian: Array2<f64>,
}

/// Newton-Raphson maximizer of the Cox partial likelihood (Breslow ties)
pub struct CoxOptimizer {
    config: OptimizationConfig,
}

impl CoxOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        Self { config }
    }

    pub fn optimize(&self, data: &SurvivalData) -> Result<CoxFit> {
        if data.n_events() == 0 {
            return Err(SurvError::invalid_survival_data("no events - partial likelihood is flat"));
        }

        let n_features = data.n_features();
        let mut beta = Array1::zeros(n_features);
        let null = compute_likelihood_derivatives(data, &beta)?;
        let null_log_likelihood = null.loglik;

        let mut current = null;
        let mut prev_penalized = self.penalized(current.loglik, &beta);

        for iteration in 0..self.config.max_iterations {
            let penalized_gradient = &current.gradient - &(self.config.l2_penalty * &beta);
            let mut penalized_hessian = current.hessian.clone();
            for i in 0..n_features {
                penalized_hessian[[i, i]] -= self.config.l2_penalty;
            }

            let step = match solve_linear_system(&penalized_hessian, &penalized_gradient) {
                Ok(step) => step,
                // singular curvature: crawl along the gradient instead
                Err(_) => -0.01 * &penalized_gradient,
            };

            // newton step w/ halving until the penalized likelihood stops dropping
            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..=self.config.max_step_halvings {
                let candidate = &beta - &(scale * &step);
                if candidate.iter().all(|b| b.is_finite()) {
                    if let Ok(derivs) = compute_likelihood_derivatives(data, &candidate) {
                        let penalized = self.penalized(derivs.loglik, &candidate);
                        if penalized >= prev_penalized - self.config.tolerance {
                            accepted = Some((candidate, derivs, penalized));
                            break;
                        }
                    }
                }
                scale *= 0.5;
            }

            let Some((next_beta, derivs, penalized)) = accepted else {
                return Err(SurvError::optimization_failed(
                    "newton step could not improve the partial likelihood",
                ));
            };

            beta = next_beta;
            current = derivs;
            let delta = (penalized - prev_penalized).abs();
            prev_penalized = penalized;

            if delta < self.config.tolerance {
                debug!(iterations = iteration + 1, loglik = current.loglik, "cox fit converged");
                let mut information = -current.hessian;
                for i in 0..n_features {
                    information[[i, i]] += self.config.l2_penalty;
                }
                return Ok(CoxFit {
                    beta,
                    log_likelihood: current.loglik,
                    null_log_likelihood,
                    information,
                    iterations: iteration + 1,
                });
            }
        }

        Err(SurvError::optimization_failed(format!(
            "Newton-Raphson failed to converge in {} iterations",
            self.config.max_iterations
        )))
    }

    fn penalized(&self, loglik: f64, beta: &Array1<f64>) -> f64 {
        loglik - 0.5 * self.config.l2_penalty * beta.dot(beta)
    }
}

/// log partial likelihood and its derivatives, one pass over descending time.
/// risk-set sums are accumulated so each distinct time costs O(p^2).
pub(crate) fn compute_likelihood_derivatives(
    data: &SurvivalData,
    beta: &Array1<f64>,
) -> Result<Derivatives> {
    let n_features = data.n_features();
    let x = data.covariates();
    let times = data.times();
    let events = data.events();
    let order = data.time_order();

    let eta: Vec<f64> = (0..data.n_samples()).map(|i| x.row(i).dot(beta)).collect();
    // shift by max eta so exp never overflows; cancels out of every ratio
    let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !shift.is_finite() && data.n_samples() > 0 {
        return Err(SurvError::numerical_error(format!("linear predictor is {}", shift)));
    }

    let mut loglik = 0.0;
    let mut gradient = Array1::zeros(n_features);
    let mut hessian = Array2::zeros((n_features, n_features));

    let mut s0 = 0.0;
    let mut s1 = Array1::<f64>::zeros(n_features);
    let mut s2 = Array2::<f64>::zeros((n_features, n_features));

    let mut pos = order.len();
    while pos > 0 {
        let t = times[order[pos - 1]];
        let mut start = pos;
        while start > 0 && times[order[start - 1]] == t {
            start -= 1;
        }

        let mut n_deaths = 0usize;
        let mut death_eta = 0.0;
        let mut death_x = Array1::<f64>::zeros(n_features);
        for &i in &order[start..pos] {
            let w = (eta[i] - shift).exp();
            let row = x.row(i);
            s0 += w;
            for j in 0..n_features {
                s1[j] += w * row[j];
                for k in 0..n_features {
                    s2[[j, k]] += w * row[j] * row[k];
                }
            }
            if events[i] {
                n_deaths += 1;
                death_eta += eta[i] - shift;
                death_x += &row;
            }
        }

        if n_deaths > 0 {
            if s0 <= 0.0 || !s0.is_finite() {
                return Err(SurvError::numerical_error("risk set sum is non-positive"));
            }
            let d = n_deaths as f64;
            let mean = &s1 / s0;
            loglik += death_eta - d * s0.ln();
            gradient += &(&death_x - &(d * &mean));
            for j in 0..n_features {
                for k in 0..n_features {
                    hessian[[j, k]] -= d * (s2[[j, k]] / s0 - mean[j] * mean[k]);
                }
            }
        }

        pos = start;
    }

    Ok(Derivatives { loglik, gradient, hessian })
}

/// Solve linear system Ax = b (partial pivoting)
pub(crate) fn solve_linear_system(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return Err(SurvError::invalid_dimensions("Matrix dimensions mismatch"));
    }

    let mut a_copy = a.clone();
    let mut b_copy = b.clone();

    for i in 0..n {
        let mut max_row = i;
        for k in i + 1..n {
            if a_copy[[k, i]].abs() > a_copy[[max_row, i]].abs() {
                max_row = k;
            }
        }

        if a_copy[[max_row, i]].abs() < 1e-12 {
            return Err(SurvError::numerical_error("Matrix is singular"));
        }

        if max_row != i {
            for j in 0..n {
                a_copy.swap([i, j], [max_row, j]);
            }
            b_copy.swap(i, max_row);
        }

        for k in i + 1..n {
            let factor = a_copy[[k, i]] / a_copy[[i, i]];
            for j in i..n {
                a_copy[[k, j]] -= factor * a_copy[[i, j]];
            }
            b_copy[k] -= factor * b_copy[i];
        }
    }

    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        x[i] = b_copy[i];
        for j in i + 1..n {
            x[i] -= a_copy[[i, j]] * x[j];
        }
        x[i] /= a_copy[[i, i]];
    }

    Ok(x)
}

/// dense inverse by solving against each unit vector
pub(crate) fn invert_matrix(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    let mut inverse = Array2::zeros((n, n));
    for j in 0..n {
        let mut unit = Array1::zeros(n);
        unit[j] = 1.0;
        let column = solve_linear_system(a, &unit)?;
        inverse.column_mut(j).assign(&column);
    }
    Ok(inverse)
}
