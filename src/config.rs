use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    compare::DEFAULT_COX_L2_PENALTY,
    cutoff::CutoffMethod,
    error::{SurvError, Result},
    filter::DEFAULT_MIN_NONZERO_FRACTION,
};

/// clinical columns that are outcomes themselves, never stratifiers
const OUTCOME_FIELDS: &[&str] = &[
    "os",
    "pfi",
    "dss",
    "dfi",
    "pfs",
    "dfs",
    "efs",
    "rfs",
    "os_time",
    "pfi_time",
    "dss_time",
    "dfi_time",
    "vital_status",
    "status",
    "event",
    "time",
];

const OUTCOME_PATTERNS: &[&str] = &[
    "vital_status",
    "days_to",
    "survival",
    "follow_up",
    "followup",
    "last_contact",
    "death",
];

/// where the low-expression gene filter is evaluated for a subgroup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneFilterScope {
    /// recompute the non-zero fraction on the subgroup's own samples
    Subgroup,
    /// reuse the gene set that passed on the whole cohort
    Inherited,
}

/// every policy knob of an analysis run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub min_nonzero_fraction: f64,
    pub gene_filter_scope: GeneFilterScope,
    pub transform_to_log2: bool,
    pub auto_cutoff: bool,
    /// percentile used instead of the median when `auto_cutoff` is off
    pub fixed_percentile: Option<f64>,
    pub min_group_fraction: f64,
    pub censor_horizon_days: Option<f64>,
    /// a subgroup is analysed only when it has strictly more samples
    pub min_subgroup_size: usize,
    pub min_distinct_categories: usize,
    pub max_distinct_categories: usize,
    pub max_combination_size: usize,
    pub outcome_field_denylist: Vec<String>,
    pub outcome_field_patterns: Vec<String>,
    pub include_all_samples: bool,
    pub threads: usize,
    pub retain_curves: bool,
    pub cox_max_iterations: usize,
    pub cox_tolerance: f64,
    /// ridge on the group terms; 0 turns it off and lets separated splits diverge
    pub cox_l2_penalty: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_nonzero_fraction: DEFAULT_MIN_NONZERO_FRACTION,
            gene_filter_scope: GeneFilterScope::Subgroup,
            transform_to_log2: false,
            auto_cutoff: true,
            fixed_percentile: None,
            min_group_fraction: 0.1,
            censor_horizon_days: Some(1825.0),
            min_subgroup_size: 40,
            min_distinct_categories: 2,
            max_distinct_categories: 10,
            max_combination_size: 1,
            outcome_field_denylist: OUTCOME_FIELDS.iter().map(|s| s.to_string()).collect(),
            outcome_field_patterns: OUTCOME_PATTERNS.iter().map(|s| s.to_string()).collect(),
            include_all_samples: true,
            threads: 1,
            retain_curves: false,
            cox_max_iterations: 100,
            cox_tolerance: 1e-9,
            cox_l2_penalty: DEFAULT_COX_L2_PENALTY,
        }
    }
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// read a (possibly partial) JSON config; missing keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SurvError::io(path.display().to_string(), e))?;
        Self::from_json_str(&text, &path.display().to_string())
    }

    pub fn from_json_str(text: &str, origin: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| SurvError::malformed(origin, e.line(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_min_nonzero_fraction(mut self, fraction: f64) -> Self {
        self.min_nonzero_fraction = fraction;
        self
    }

    pub fn with_gene_filter_scope(mut self, scope: GeneFilterScope) -> Self {
        self.gene_filter_scope = scope;
        self
    }

    pub fn with_log2(mut self, transform: bool) -> Self {
        self.transform_to_log2 = transform;
        self
    }

    pub fn with_auto_cutoff(mut self, auto: bool) -> Self {
        self.auto_cutoff = auto;
        self
    }

    pub fn with_fixed_percentile(mut self, percentile: Option<f64>) -> Self {
        self.fixed_percentile = percentile;
        self
    }

    pub fn with_min_group_fraction(mut self, fraction: f64) -> Self {
        self.min_group_fraction = fraction;
        self
    }

    pub fn with_censor_horizon(mut self, days: Option<f64>) -> Self {
        self.censor_horizon_days = days;
        self
    }

    pub fn with_min_subgroup_size(mut self, size: usize) -> Self {
        self.min_subgroup_size = size;
        self
    }

    pub fn with_max_combination_size(mut self, size: usize) -> Self {
        self.max_combination_size = size;
        self
    }

    pub fn with_include_all_samples(mut self, include: bool) -> Self {
        self.include_all_samples = include;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_retain_curves(mut self, retain: bool) -> Self {
        self.retain_curves = retain;
        self
    }

    /// extra exact names to treat as outcome fields
    pub fn deny_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outcome_field_denylist.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn cutoff_method(&self) -> CutoffMethod {
        match (self.auto_cutoff, self.fixed_percentile) {
            (true, _) => CutoffMethod::Optimal,
            (false, None) => CutoffMethod::Median,
            (false, Some(p)) => CutoffMethod::Percentile(p),
        }
    }

    /// true when `name` looks like survival time or vital status
    pub fn is_outcome_field(&self, name: &str) -> bool {
        let name = normalize_field(name);
        self.outcome_field_denylist
            .iter()
            .any(|denied| normalize_field(denied) == name)
            || self
                .outcome_field_patterns
                .iter()
                .any(|pattern| name.contains(&normalize_field(pattern)))
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_nonzero_fraction) {
            return Err(SurvError::invalid_parameter(
                "min_nonzero_fraction",
                self.min_nonzero_fraction.to_string(),
            ));
        }
        if !(self.min_group_fraction > 0.0 && self.min_group_fraction <= 0.5) {
            return Err(SurvError::invalid_parameter(
                "min_group_fraction",
                self.min_group_fraction.to_string(),
            ));
        }
        if let Some(p) = self.fixed_percentile {
            if !(p > 0.0 && p < 100.0) {
                return Err(SurvError::invalid_parameter("fixed_percentile", p.to_string()));
            }
        }
        if let Some(h) = self.censor_horizon_days {
            if !(h > 0.0 && h.is_finite()) {
                return Err(SurvError::invalid_parameter("censor_horizon_days", h.to_string()));
            }
        }
        if self.min_distinct_categories < 2 || self.min_distinct_categories >= self.max_distinct_categories {
            return Err(SurvError::invalid_parameter(
                "distinct_categories",
                format!("[{}, {})", self.min_distinct_categories, self.max_distinct_categories),
            ));
        }
        if self.max_combination_size == 0 {
            return Err(SurvError::invalid_parameter("max_combination_size", "0"));
        }
        if self.threads == 0 {
            return Err(SurvError::invalid_parameter("threads", "0"));
        }
        if self.cox_max_iterations == 0 || !(self.cox_tolerance > 0.0) || self.cox_l2_penalty < 0.0 {
            return Err(SurvError::invalid_parameter(
                "cox",
                format!(
                    "max_iterations={} tolerance={} l2={}",
                    self.cox_max_iterations, self.cox_tolerance, self.cox_l2_penalty
                ),
            ));
        }
        Ok(())
    }
}

/// lowercase, with `.`, `-` and spaces folded to `_`
fn normalize_field(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '.' | '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}
