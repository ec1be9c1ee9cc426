use std::collections::{BTreeMap, BTreeSet, HashMap};

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::{
    data::Outcome,
    error::{SurvError, Result},
};

/// spellings of "no value" found in clinical exports
const MISSING_SENTINELS: &[&str] = &[
    "",
    "na",
    "nan",
    "null",
    "none",
    "--",
    "'--",
    "[not available]",
    "[not applicable]",
    "[not evaluated]",
    "[unknown]",
    "[discrepancy]",
];

/// one clinical cell, typed once at load time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClinicalValue {
    Numeric(f64),
    Categorical(String),
    Missing,
}

impl ClinicalValue {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if MISSING_SENTINELS.contains(&trimmed.to_ascii_lowercase().as_str()) {
            return Self::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => Self::Numeric(v),
            Ok(_) => Self::Missing,
            Err(_) => Self::Categorical(trimmed.to_string()),
        }
    }

    /// label used when the value acts as a subgroup category
    pub fn category_label(&self) -> Option<String> {
        match self {
            Self::Numeric(v) => Some(format!("{}", v)),
            Self::Categorical(s) => Some(s.clone()),
            Self::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub outcome: Outcome,
    pub clinical: BTreeMap<String, ClinicalValue>,
}

impl Sample {
    pub fn new(id: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            id: id.into(),
            outcome,
            clinical: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, name: impl Into<String>, value: ClinicalValue) -> Self {
        self.clinical.insert(name.into(), value);
        self
    }

    /// `Missing` for annotations this sample doesn't carry
    pub fn annotation(&self, name: &str) -> &ClinicalValue {
        self.clinical.get(name).unwrap_or(&ClinicalValue::Missing)
    }
}

/// one cancer type: samples + a genes x samples expression matrix.
/// immutable - every filter/subset hands back a new cohort.
#[derive(Debug, Clone)]
pub struct Cohort {
    cancer: String,
    genes: Vec<String>,
    samples: Vec<Sample>,
    expression: Array2<f64>, // NaN = not measured
    gene_index: HashMap<String, usize>,
    sample_index: HashMap<String, usize>,
}

impl Cohort {
    pub fn new(
        cancer: impl Into<String>,
        genes: Vec<String>,
        samples: Vec<Sample>,
        expression: Array2<f64>,
    ) -> Result<Self> {
        if expression.dim() != (genes.len(), samples.len()) {
            return Err(SurvError::invalid_dimensions(format!(
                "expression is {:?} but cohort has {} genes x {} samples",
                expression.dim(),
                genes.len(),
                samples.len()
            )));
        }

        let mut gene_index = HashMap::with_capacity(genes.len());
        for (i, gene) in genes.iter().enumerate() {
            if gene_index.insert(gene.clone(), i).is_some() {
                return Err(SurvError::invalid_parameter("gene", format!("{} (duplicate)", gene)));
            }
        }

        let mut sample_index = HashMap::with_capacity(samples.len());
        for (i, sample) in samples.iter().enumerate() {
            if sample_index.insert(sample.id.clone(), i).is_some() {
                return Err(SurvError::invalid_parameter("sample", format!("{} (duplicate)", sample.id)));
            }
            let t = sample.outcome.time;
            if t < 0.0 || !t.is_finite() {
                return Err(SurvError::invalid_survival_data(format!(
                    "sample {} has survival time {}",
                    sample.id, t
                )));
            }
        }

        Ok(Self {
            cancer: cancer.into(),
            genes,
            samples,
            expression,
            gene_index,
            sample_index,
        })
    }

    pub fn cancer(&self) -> &str {
        &self.cancer
    }

    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample_ids(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.id.clone()).collect()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.samples.iter().map(|s| s.outcome).collect()
    }

    pub fn has_gene(&self, gene: &str) -> bool {
        self.gene_index.contains_key(gene)
    }

    pub fn sample_position(&self, id: &str) -> Option<usize> {
        self.sample_index.get(id).copied()
    }

    /// expression of one gene across all samples (NaN where missing)
    pub fn expression(&self, gene: &str) -> Option<ArrayView1<'_, f64>> {
        self.gene_index.get(gene).map(|&i| self.expression.row(i))
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.expression
    }

    /// every clinical annotation name seen on any sample
    pub fn annotation_names(&self) -> BTreeSet<String> {
        self.samples
            .iter()
            .flat_map(|s| s.clinical.keys().cloned())
            .collect()
    }

    /// new cohort with a signature row appended: the per-sample mean of the
    /// member genes' non-missing values. members absent here are ignored.
    pub fn with_signature(&self, name: &str, members: &[String]) -> Result<Self> {
        if self.has_gene(name) {
            return Err(SurvError::invalid_parameter("signature", format!("{} clashes with a gene", name)));
        }
        let rows: Vec<usize> = members
            .iter()
            .filter_map(|g| self.gene_index.get(g).copied())
            .collect();
        if rows.is_empty() {
            return Err(SurvError::empty_result(format!(
                "signature {} has no member genes in {}",
                name, self.cancer
            )));
        }

        let score = Array1::from_shape_fn(self.n_samples(), |j| {
            let mut sum = 0.0;
            let mut count = 0usize;
            for &r in &rows {
                let v = self.expression[[r, j]];
                if v.is_finite() {
                    sum += v;
                    count += 1;
                }
            }
            if count == 0 {
                f64::NAN
            } else {
                sum / count as f64
            }
        });

        let mut expression = self.expression.clone();
        expression
            .push_row(score.view())
            .map_err(|e| SurvError::invalid_dimensions(e.to_string()))?;
        let mut genes = self.genes.clone();
        genes.push(name.to_string());
        Self::new(self.cancer.clone(), genes, self.samples.clone(), expression)
    }

    /// rows/columns picked by position; used by the filter functions
    pub(crate) fn select(&self, gene_rows: &[usize], sample_cols: &[usize]) -> Result<Self> {
        let expression = self
            .expression
            .select(Axis(0), gene_rows)
            .select(Axis(1), sample_cols);
        let genes = gene_rows.iter().map(|&i| self.genes[i].clone()).collect();
        let samples = sample_cols.iter().map(|&j| self.samples[j].clone()).collect();
        Self::new(self.cancer.clone(), genes, samples, expression)
    }
}
