use std::{
    cmp::Ordering,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    compare::CurveData,
    error::{SurvError, Result},
};

/// one analysed (gene, cancer, subgroup) combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurvivalStatistic {
    pub gene: String,
    pub cancer: String,
    pub annotation: String,
    pub category: String,
    pub n_samples: usize,
    pub n_low: usize,
    pub n_high: usize,
    pub events_low: usize,
    pub events_high: usize,
    pub cutoff: f64,
    pub log2_scale: bool,
    /// high vs low; `None` when the Cox fit gave nothing usable
    pub hazard_ratio: Option<f64>,
    pub hr_ci_lower: Option<f64>,
    pub hr_ci_upper: Option<f64>,
    /// Cox likelihood-ratio p-value
    pub cox_p_value: Option<f64>,
    pub logrank_statistic: f64,
    /// log-rank p-value; the one FDR correction is applied to
    pub p_value: f64,
    pub adjusted_p_value: Option<f64>,
    pub median_survival_low: Option<f64>,
    pub median_survival_high: Option<f64>,
    pub c_index: Option<f64>,
}

/// a combination that produced no statistic, and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipMarker {
    pub gene: String,
    pub cancer: String,
    pub annotation: String,
    pub category: String,
    pub reason: String,
    pub message: String,
    pub n_samples: usize,
    pub n_low: Option<usize>,
    pub n_high: Option<usize>,
}

/// Kaplan-Meier input for one analysed row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubgroupCurve {
    pub gene: String,
    pub cancer: String,
    pub annotation: String,
    pub category: String,
    pub data: CurveData,
}

/// what one (target, subgroup) analysis turned into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubgroupOutcome {
    Analyzed {
        row: SurvivalStatistic,
        #[serde(skip)]
        curve: Option<CurveData>,
    },
    Skipped(SkipMarker),
}

impl SubgroupOutcome {
    /// the target (gene or signature) this outcome belongs to
    pub fn gene(&self) -> &str {
        match self {
            Self::Analyzed { row, .. } => &row.gene,
            Self::Skipped(marker) => &marker.gene,
        }
    }
}

/// finalized, FDR-corrected output of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultTable {
    /// ascending p-value
    pub rows: Vec<SurvivalStatistic>,
    pub skips: Vec<SkipMarker>,
    pub curves: Vec<SubgroupCurve>,
}

#[derive(Debug, Default)]
struct AggregatorState {
    rows: Vec<SurvivalStatistic>,
    skips: Vec<SkipMarker>,
    curves: Vec<SubgroupCurve>,
    finalized: Option<ResultTable>,
}

/// thread-safe collector; `finalize` seals it
#[derive(Debug, Default)]
pub struct ResultAggregator {
    state: Mutex<AggregatorState>,
    retain_curves: bool,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retain_curves(mut self, retain: bool) -> Self {
        self.retain_curves = retain;
        self
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        // a panicked writer can't leave a half-pushed row behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self) -> Result<MutexGuard<'_, AggregatorState>> {
        let state = self.lock();
        if state.finalized.is_some() {
            return Err(SurvError::AggregatorSealed);
        }
        Ok(state)
    }

    pub fn add(&self, row: SurvivalStatistic) -> Result<()> {
        self.open()?.rows.push(row);
        Ok(())
    }

    pub fn skip(&self, marker: SkipMarker) -> Result<()> {
        self.open()?.skips.push(marker);
        Ok(())
    }

    pub fn record(&self, outcome: SubgroupOutcome) -> Result<()> {
        match outcome {
            SubgroupOutcome::Analyzed { row, curve } => {
                let mut state = self.open()?;
                if let (true, Some(data)) = (self.retain_curves, curve) {
                    state.curves.push(SubgroupCurve {
                        gene: row.gene.clone(),
                        cancer: row.cancer.clone(),
                        annotation: row.annotation.clone(),
                        category: row.category.clone(),
                        data,
                    });
                }
                state.rows.push(row);
                Ok(())
            }
            SubgroupOutcome::Skipped(marker) => self.skip(marker),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn n_skips(&self) -> usize {
        self.lock().skips.len()
    }

    /// BH-correct every collected p-value and sort by significance.
    /// later calls return the same table.
    pub fn finalize(&self) -> ResultTable {
        let mut state = self.lock();
        if let Some(table) = &state.finalized {
            return table.clone();
        }

        let mut rows = std::mem::take(&mut state.rows);
        rows.sort_by(|a, b| {
            a.p_value
                .total_cmp(&b.p_value)
                .then_with(|| row_key(a).cmp(&row_key(b)))
        });
        let p_values: Vec<f64> = rows.iter().map(|r| r.p_value).collect();
        for (row, q) in rows.iter_mut().zip(benjamini_hochberg(&p_values)) {
            row.adjusted_p_value = Some(q);
        }

        let mut skips = std::mem::take(&mut state.skips);
        skips.sort_by(|a, b| skip_key(a).cmp(&skip_key(b)));
        let mut curves = std::mem::take(&mut state.curves);
        curves.sort_by(|a, b| {
            (&a.cancer, &a.gene, &a.annotation, &a.category).cmp(&(&b.cancer, &b.gene, &b.annotation, &b.category))
        });

        info!(rows = rows.len(), skips = skips.len(), "results finalized");
        let table = ResultTable { rows, skips, curves };
        state.finalized = Some(table.clone());
        table
    }
}

fn row_key(row: &SurvivalStatistic) -> (&str, &str, &str, &str) {
    (&row.cancer, &row.gene, &row.annotation, &row.category)
}

fn skip_key(skip: &SkipMarker) -> (&str, &str, &str, &str) {
    (&skip.cancer, &skip.gene, &skip.annotation, &skip.category)
}

/// BH step-up q-values, returned in input order
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| {
        p_values[i]
            .partial_cmp(&p_values[j])
            .unwrap_or(Ordering::Equal)
            .then(i.cmp(&j))
    });

    let mut q = vec![1.0; m];
    let mut prev = 1.0_f64;
    for (rank0, &idx) in order.iter().enumerate().rev() {
        let adjusted = (p_values[idx] * m as f64 / (rank0 + 1) as f64).min(1.0);
        prev = prev.min(adjusted);
        q[idx] = prev.max(0.0);
    }
    q
}

impl ResultTable {
    pub fn significant(&self, alpha: f64) -> impl Iterator<Item = &SurvivalStatistic> + '_ {
        self.rows
            .iter()
            .filter(move |r| r.adjusted_p_value.map_or(false, |q| q <= alpha))
    }

    pub fn write_tsv(&self, path: impl AsRef<Path>) -> Result<()> {
        write_tsv_file(path.as_ref(), &self.rows)
    }

    /// the run log of skipped combinations
    pub fn write_skips_tsv(&self, path: impl AsRef<Path>) -> Result<()> {
        write_tsv_file(path.as_ref(), &self.skips)
    }

    pub fn write_rows<W: Write>(&self, writer: W) -> Result<()> {
        write_tsv(writer, &self.rows, "<writer>")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SurvError::io("<json>", e))
    }
}

fn write_tsv_file<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let file = File::create(path).map_err(|e| SurvError::io(path.display().to_string(), e))?;
    write_tsv(BufWriter::new(file), records, &path.display().to_string())
}

fn write_tsv<W: Write, T: Serialize>(writer: W, records: &[T], origin: &str) -> Result<()> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    for record in records {
        out.serialize(record).map_err(|e| SurvError::io(origin, e))?;
    }
    out.flush().map_err(|e| SurvError::io(origin, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn row(gene: &str, p: f64) -> SurvivalStatistic {
        SurvivalStatistic {
            gene: gene.into(),
            cancer: "BRCA".into(),
            annotation: "all".into(),
            category: "all".into(),
            n_samples: 100,
            n_low: 50,
            n_high: 50,
            events_low: 10,
            events_high: 20,
            cutoff: 3.5,
            log2_scale: false,
            hazard_ratio: Some(2.0),
            hr_ci_lower: Some(1.1),
            hr_ci_upper: Some(3.6),
            cox_p_value: Some(p),
            logrank_statistic: 4.0,
            p_value: p,
            adjusted_p_value: None,
            median_survival_low: None,
            median_survival_high: Some(800.0),
            c_index: Some(0.6),
        }
    }

    #[test]
    fn test_benjamini_hochberg_known_values() {
        let q = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.005]);
        assert_relative_eq!(q[3], 0.02, epsilon = 1e-12);
        assert_relative_eq!(q[0], 0.02, epsilon = 1e-12);
        assert_relative_eq!(q[2], 0.04, epsilon = 1e-12);
        assert_relative_eq!(q[1], 0.04, epsilon = 1e-12);
        assert!(benjamini_hochberg(&[]).is_empty());
        assert_eq!(benjamini_hochberg(&[0.9, 0.95]), vec![0.95, 0.95]);
    }

    #[test]
    fn test_finalize_sorts_and_corrects() {
        let aggregator = ResultAggregator::new();
        for (i, p) in [0.2, 0.001, 0.04, 0.5, 0.01].iter().enumerate() {
            aggregator.add(row(&format!("G{}", i), *p)).unwrap();
        }
        let table = aggregator.finalize();
        let ps: Vec<f64> = table.rows.iter().map(|r| r.p_value).collect();
        assert_eq!(ps, vec![0.001, 0.01, 0.04, 0.2, 0.5]);

        let qs: Vec<f64> = table.rows.iter().map(|r| r.adjusted_p_value.unwrap()).collect();
        assert!(qs.windows(2).all(|w| w[0] <= w[1]));
        assert!(qs.iter().all(|&q| (0.0..=1.0).contains(&q)));
        assert!(qs.iter().zip(&ps).all(|(q, p)| q >= p));
        assert_eq!(table.significant(0.05).count(), 2);
    }

    #[test]
    fn test_finalize_is_idempotent_and_seals() {
        let aggregator = ResultAggregator::new();
        aggregator.add(row("A", 0.03)).unwrap();
        let first = aggregator.finalize();
        let second = aggregator.finalize();
        assert_eq!(first, second);
        assert_eq!(aggregator.add(row("B", 0.01)), Err(SurvError::AggregatorSealed));
        assert!(aggregator.finalize().rows.len() == 1);
    }

    #[test]
    fn test_concurrent_writers() {
        use rayon::prelude::*;
        let aggregator = ResultAggregator::new();
        (0..200).into_par_iter().for_each(|i| {
            aggregator.add(row(&format!("G{:03}", i), (i as f64 + 1.0) / 400.0)).unwrap();
        });
        assert_eq!(aggregator.n_rows(), 200);
        let table = aggregator.finalize();
        assert_eq!(table.rows[0].gene, "G000");
    }

    #[test]
    fn test_curves_retained_on_request() {
        let curve = CurveData {
            times: vec![1.0, 2.0],
            events: vec![true, false],
            labels: vec!["low".into(), "high".into()],
        };
        let keep = ResultAggregator::new().with_retain_curves(true);
        keep.record(SubgroupOutcome::Analyzed { row: row("A", 0.1), curve: Some(curve.clone()) })
            .unwrap();
        assert_eq!(keep.finalize().curves.len(), 1);

        let drop = ResultAggregator::new();
        drop.record(SubgroupOutcome::Analyzed { row: row("A", 0.1), curve: Some(curve) })
            .unwrap();
        assert!(drop.finalize().curves.is_empty());
    }

    #[test]
    fn test_tsv_and_json_export() {
        let aggregator = ResultAggregator::new();
        aggregator.add(row("TP53", 0.01)).unwrap();
        aggregator
            .skip(SkipMarker {
                gene: "TP53".into(),
                cancer: "BRCA".into(),
                annotation: "stage".into(),
                category: "IV".into(),
                reason: "subgroup_too_small".into(),
                message: "12 samples".into(),
                n_samples: 12,
                n_low: None,
                n_high: None,
            })
            .unwrap();
        let table = aggregator.finalize();

        let mut buf = Vec::new();
        table.write_rows(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("gene\tcancer\tannotation\tcategory\t"));
        assert!(header.contains("adjusted_p_value"));
        assert!(lines.next().unwrap().starts_with("TP53\tBRCA\tall\tall\t100\t"));

        let dir = tempfile::tempdir().unwrap();
        let skips = dir.path().join("skips.tsv");
        table.write_skips_tsv(&skips).unwrap();
        let logged = std::fs::read_to_string(&skips).unwrap();
        assert!(logged.contains("subgroup_too_small"));

        let json: serde_json::Value = serde_json::from_str(&table.to_json().unwrap()).unwrap();
        assert_eq!(json["rows"][0]["gene"], "TP53");
        assert_eq!(json["skips"][0]["category"], "IV");
    }
}
