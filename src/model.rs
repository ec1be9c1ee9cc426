use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use crate::{
    data::SurvivalData,
    error::{SurvError, Result},
    optimization::{invert_matrix, CoxFit, CoxOptimizer, OptimizationConfig},
};

/// z for a two-sided 95% interval
const Z_95: f64 = 1.959_963_984_540_054;

/// cox proportional hazards model (optionally ridge-penalized)
#[derive(Debug, Clone)]
pub struct CoxModel {
    fit: Option<CoxFit>,
    l2_penalty: f64,                    // ridge penalty
    max_iterations: usize,              // newton iteration limit
    tolerance: f64,                     // convergence threshold on loglik
    feature_names: Option<Vec<String>>, // optional covariate labels
}

impl Default for CoxModel {
    fn default() -> Self {
        let defaults = OptimizationConfig::default();
        Self {
            fit: None,
            l2_penalty: defaults.l2_penalty,
            max_iterations: defaults.max_iterations,
            tolerance: defaults.tolerance,
            feature_names: None,
        }
    }
}

impl CoxModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// ridge penalty (L2) - keeps near-separated fits finite
    pub fn with_l2_penalty(mut self, penalty: f64) -> Self {
        self.l2_penalty = penalty.max(0.0);
        self
    }

    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    /// give names to your covariates for nicer output
    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = Some(names);
        self
    }

    pub fn fit(&mut self, data: &SurvivalData) -> Result<&mut Self> {
        let config = OptimizationConfig {
            l2_penalty: self.l2_penalty,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            ..OptimizationConfig::default()
        };

        self.fit = Some(CoxOptimizer::new(config).optimize(data)?);
        Ok(self)
    }

    fn fitted(&self) -> Result<&CoxFit> {
        self.fit.as_ref().ok_or(SurvError::ModelNotFitted)
    }

    /// fitted coefficients (log hazard ratios)
    pub fn coefficients(&self) -> Result<ArrayView1<'_, f64>> {
        Ok(self.fitted()?.beta.view())
    }

    /// sqrt of the diagonal of the inverse information matrix
    pub fn standard_errors(&self) -> Result<Array1<f64>> {
        let fit = self.fitted()?;
        let covariance = invert_matrix(&fit.information)?;
        let se = covariance.diag().mapv(|v| v.max(0.0).sqrt());
        if se.iter().any(|s| !s.is_finite()) {
            return Err(SurvError::numerical_error("non-finite standard error"));
        }
        Ok(se)
    }

    /// linear predictor for each row of `covariates`
    pub fn predict(&self, covariates: ArrayView2<f64>) -> Result<Array1<f64>> {
        let coefs = self.coefficients()?;

        if covariates.ncols() != coefs.len() {
            return Err(SurvError::invalid_dimensions(format!(
                "feature count mismatch: expected {}, got {}",
                coefs.len(),
                covariates.ncols()
            )));
        }

        Ok(covariates.dot(&coefs))
    }

    /// likelihood-ratio test of the full model against beta = 0
    pub fn likelihood_ratio_test(&self) -> Result<(f64, f64)> {
        let fit = self.fitted()?;
        let statistic = (2.0 * (fit.log_likelihood - fit.null_log_likelihood)).max(0.0);
        let dist = ChiSquared::new(fit.beta.len() as f64)
            .map_err(|e| SurvError::numerical_error(e.to_string()))?;
        Ok((statistic, dist.sf(statistic)))
    }

    pub fn is_fitted(&self) -> bool {
        self.fit.is_some()
    }

    pub fn summary(&self) -> Result<CoxModelSummary> {
        let fit = self.fitted()?;
        let se = self.standard_errors()?;
        let normal = Normal::new(0.0, 1.0).map_err(|e| SurvError::numerical_error(e.to_string()))?;
        let (lr_statistic, lr_p_value) = self.likelihood_ratio_test()?;

        let terms = fit
            .beta
            .iter()
            .zip(se.iter())
            .enumerate()
            .map(|(i, (&coef, &se))| {
                let z = if se > 0.0 { coef / se } else { 0.0 };
                CoxTerm {
                    name: self
                        .feature_names
                        .as_ref()
                        .and_then(|names| names.get(i).cloned())
                        .unwrap_or_else(|| format!("x{}", i)),
                    coefficient: coef,
                    hazard_ratio: coef.exp(),
                    standard_error: se,
                    ci_lower: (coef - Z_95 * se).exp(),
                    ci_upper: (coef + Z_95 * se).exp(),
                    z,
                    p_value: 2.0 * normal.sf(z.abs()),
                }
            })
            .collect();

        Ok(CoxModelSummary {
            terms,
            log_likelihood: fit.log_likelihood,
            null_log_likelihood: fit.null_log_likelihood,
            lr_statistic,
            lr_p_value,
            iterations: fit.iterations,
        })
    }
}

/// one covariate's row in the summary (Wald inference)
#[derive(Debug, Clone, Serialize)]
pub struct CoxTerm {
    pub name: String,
    pub coefficient: f64,
    pub hazard_ratio: f64,
    pub standard_error: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub z: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone)]
pub struct CoxModelSummary {
    pub terms: Vec<CoxTerm>,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub lr_statistic: f64,
    pub lr_p_value: f64,
    pub iterations: usize,
}
