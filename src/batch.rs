use std::{
    collections::{BTreeSet, HashSet},
    time::Instant,
};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    aggregate::{ResultAggregator, ResultTable},
    checkpoint::{Checkpoint, CheckpointRecord},
    cohort::Cohort,
    config::AnalysisConfig,
    error::{SurvError, Result},
    filter,
    store::{CohortKey, CohortStore},
    subgroup::{AnalysisTarget, Subgroup, SubgroupEnumerator},
};

/// a cohort the batch had to give up on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortFailure {
    pub cancer: String,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub table: ResultTable,
    pub failed_cohorts: Vec<CohortFailure>,
    pub elapsed_ms: u64,
}

/// cancers x targets x subgroups, one worker loop
pub struct BatchRunner<S: CohortStore> {
    store: S,
    config: AnalysisConfig,
    data_source: String,
    subtype: String,
    checkpoint: Option<Checkpoint>,
}

impl<S: CohortStore> BatchRunner<S> {
    pub fn new(store: S, config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            data_source: "tcga".to_string(),
            subtype: "rnaseq".to_string(),
            checkpoint: None,
        })
    }

    pub fn with_data(mut self, data_source: impl Into<String>, subtype: impl Into<String>) -> Self {
        self.data_source = data_source.into();
        self.subtype = subtype.into();
        self
    }

    /// skip (subgroup, target) pairs the checkpoint already holds and log new ones to it
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn run(&self, cancers: &[String], targets: &[AnalysisTarget]) -> Result<BatchReport> {
        let start = Instant::now();
        info!(
            cohorts = cancers.len(),
            targets = targets.len(),
            threads = self.config.threads,
            "batch started"
        );

        let aggregator = ResultAggregator::new().with_retain_curves(self.config.retain_curves);
        if let Some(checkpoint) = &self.checkpoint {
            // replayed rows take part in the FDR correction like fresh ones,
            // but only those this run would have produced itself
            let names: HashSet<&str> = targets.iter().map(AnalysisTarget::name).collect();
            let mut replayed = 0usize;
            for record in checkpoint.records() {
                let key = &record.cohort;
                if key.data_source != self.data_source
                    || key.subtype != self.subtype
                    || !cancers.contains(&key.cancer)
                {
                    continue;
                }
                for outcome in record.outcomes.iter().filter(|o| names.contains(o.gene())) {
                    aggregator.record(outcome.clone())?;
                    replayed += 1;
                }
            }
            info!(path = %checkpoint.path().display(), outcomes = replayed, "checkpoint replayed");
        }

        let pool = if self.config.threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.threads)
                .build()
                .map_err(|e| SurvError::invalid_parameter("threads", format!("failed to build thread pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };

        let enumerator = SubgroupEnumerator::new(self.config.clone());
        let wanted = target_genes(targets);
        let mut failed_cohorts = Vec::new();

        for cancer in cancers {
            let key = CohortKey::new(cancer.as_str(), self.data_source.as_str(), self.subtype.as_str());
            let cohort = match self.load(&key, &wanted) {
                Ok(cohort) => cohort,
                Err(e) if e.is_recoverable() || matches!(e, SurvError::DataUnavailable { .. }) => {
                    warn!(
                        cancer = %cancer,
                        data_source = %self.data_source,
                        subtype = %self.subtype,
                        error = %e,
                        "cohort skipped"
                    );
                    failed_cohorts.push(CohortFailure {
                        cancer: cancer.clone(),
                        reason: e.kind().to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            let base = match enumerator.prepare(&cohort) {
                Ok(base) => base,
                Err(e) if e.is_recoverable() => {
                    warn!(cancer = %cancer, error = %e, "no genes survive the cohort-wide filter");
                    failed_cohorts.push(CohortFailure {
                        cancer: cancer.clone(),
                        reason: e.kind().to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            let process = |(subgroup, todo): &(Subgroup, Vec<AnalysisTarget>)| -> Result<()> {
                let outcomes = enumerator.analyze_subgroup(&base, subgroup, todo)?;
                if let Some(checkpoint) = &self.checkpoint {
                    checkpoint.append(&CheckpointRecord::new(&key, subgroup, outcomes.clone()))?;
                }
                for outcome in outcomes {
                    aggregator.record(outcome)?;
                }
                Ok(())
            };
            let pending = enumerator.subgroups(&base).filter_map(|subgroup| {
                let todo = self.pending_targets(&key, &subgroup, targets);
                (!todo.is_empty()).then_some((subgroup, todo))
            });

            match &pool {
                Some(pool) => {
                    let pending: Vec<(Subgroup, Vec<AnalysisTarget>)> = pending.collect();
                    pool.install(|| pending.par_iter().try_for_each(&process))?;
                }
                None => {
                    for task in pending {
                        process(&task)?;
                    }
                }
            }
        }

        let table = aggregator.finalize();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            rows = table.rows.len(),
            skips = table.skips.len(),
            failed_cohorts = failed_cohorts.len(),
            elapsed_ms,
            "batch finished"
        );
        Ok(BatchReport {
            table,
            failed_cohorts,
            elapsed_ms,
        })
    }

    /// targets the checkpoint has no outcome for in this subgroup
    fn pending_targets(&self, key: &CohortKey, subgroup: &Subgroup, targets: &[AnalysisTarget]) -> Vec<AnalysisTarget> {
        match &self.checkpoint {
            Some(checkpoint) => targets
                .iter()
                .filter(|t| !checkpoint.is_done(key, subgroup, t.name()))
                .cloned()
                .collect(),
            None => targets.to_vec(),
        }
    }

    /// load and narrow to the genes the targets touch
    fn load(&self, key: &CohortKey, wanted: &[String]) -> Result<Cohort> {
        let cohort = self.store.load_key(key)?;
        match filter::select_genes(&cohort, wanted) {
            Ok(selected) => Ok(selected),
            // nothing requested is here; every target will log its own skip
            Err(SurvError::EmptyResult { .. }) => Ok(cohort),
            Err(e) => Err(e),
        }
    }
}

fn target_genes(targets: &[AnalysisTarget]) -> Vec<String> {
    let genes: BTreeSet<&String> = targets
        .iter()
        .flat_map(|t| match t {
            AnalysisTarget::Gene(g) => std::slice::from_ref(g),
            AnalysisTarget::Signature { genes, .. } => genes.as_slice(),
        })
        .collect();
    genes.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cohort::{ClinicalValue, Sample},
        data::Outcome,
        store::MemoryStore,
    };
    use ndarray::Array2;

    fn cohort(cancer: &str, n: usize) -> Cohort {
        let samples: Vec<Sample> = (0..n)
            .map(|i| {
                // interleave survival so no split separates perfectly
                let time = 50.0 + ((i * 37) % n) as f64 * 20.0 + if i < n / 2 { 400.0 } else { 0.0 };
                Sample::new(format!("{}-{:03}", cancer, i), Outcome::new(time, i % 4 != 3))
                    .with_annotation("gender", ClinicalValue::Categorical(if i % 2 == 0 { "F" } else { "M" }.into()))
            })
            .collect();
        let values: Vec<f64> = (0..n).map(|i| 1.0 + i as f64).chain((0..n).map(|i| 2.0 + (i % 7) as f64)).collect();
        let expression = Array2::from_shape_vec((2, n), values).unwrap();
        Cohort::new(cancer, vec!["GENE1".into(), "GENE2".into()], samples, expression).unwrap()
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert(CohortKey::new("BRCA", "tcga", "rnaseq"), cohort("BRCA", 100));
        store.insert(CohortKey::new("LUAD", "tcga", "rnaseq"), cohort("LUAD", 90));
        store
    }

    #[test]
    fn test_target_genes_are_deduplicated() {
        let targets = vec![
            AnalysisTarget::gene("B"),
            AnalysisTarget::signature("S", vec!["A".into(), "B".into()]),
        ];
        assert_eq!(target_genes(&targets), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_unavailable_cohort_does_not_abort() {
        let runner = BatchRunner::new(store(), AnalysisConfig::default()).unwrap();
        let cancers = vec!["BRCA".to_string(), "GBM".to_string()];
        let report = runner.run(&cancers, &[AnalysisTarget::gene("GENE1")]).unwrap();
        assert_eq!(report.failed_cohorts.len(), 1);
        assert_eq!(report.failed_cohorts[0].reason, "data_unavailable");
        // all + F + M for BRCA, one outcome each
        assert_eq!(report.table.rows.len() + report.table.skips.len(), 3);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let cancers = vec!["BRCA".to_string(), "LUAD".to_string()];
        let targets = vec![AnalysisTarget::gene("GENE1"), AnalysisTarget::gene("GENE2")];
        let sequential = BatchRunner::new(store(), AnalysisConfig::default())
            .unwrap()
            .run(&cancers, &targets)
            .unwrap();
        let parallel = BatchRunner::new(store(), AnalysisConfig::default().with_threads(4))
            .unwrap()
            .run(&cancers, &targets)
            .unwrap();
        assert_eq!(sequential.table.rows, parallel.table.rows);
        assert_eq!(sequential.table.skips, parallel.table.skips);
    }

    #[test]
    fn test_resume_skips_completed_subgroups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.jsonl");
        let cancers = vec!["BRCA".to_string()];
        let targets = vec![AnalysisTarget::gene("GENE1")];

        let first = BatchRunner::new(store(), AnalysisConfig::default())
            .unwrap()
            .with_checkpoint(Checkpoint::open(&path).unwrap())
            .run(&cancers, &targets)
            .unwrap();

        // nothing left to compute: the second run only replays
        let checkpoint = Checkpoint::open(&path).unwrap();
        assert_eq!(checkpoint.records().len(), 3);
        let second = BatchRunner::new(store(), AnalysisConfig::default())
            .unwrap()
            .with_checkpoint(checkpoint)
            .run(&cancers, &targets)
            .unwrap();
        assert_eq!(first.table.rows, second.table.rows);
        assert_eq!(first.table.skips, second.table.skips);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_resume_with_added_target_analyses_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.jsonl");
        let cancers = vec!["BRCA".to_string()];

        let first = BatchRunner::new(store(), AnalysisConfig::default())
            .unwrap()
            .with_checkpoint(Checkpoint::open(&path).unwrap())
            .run(&cancers, &[AnalysisTarget::gene("GENE1")])
            .unwrap();

        let targets = vec![AnalysisTarget::gene("GENE1"), AnalysisTarget::gene("GENE2")];
        let resumed = BatchRunner::new(store(), AnalysisConfig::default())
            .unwrap()
            .with_checkpoint(Checkpoint::open(&path).unwrap())
            .run(&cancers, &targets)
            .unwrap();
        let fresh = BatchRunner::new(store(), AnalysisConfig::default())
            .unwrap()
            .run(&cancers, &targets)
            .unwrap();

        let gene2 = |table: &ResultTable| {
            table.rows.iter().filter(|r| r.gene == "GENE2").count()
                + table.skips.iter().filter(|m| m.gene == "GENE2").count()
        };
        assert_eq!(gene2(&first.table), 0);
        // all + F + M, each now with a GENE2 outcome
        assert_eq!(gene2(&resumed.table), 3);
        assert_eq!(resumed.table.rows, fresh.table.rows);
        assert_eq!(resumed.table.skips, fresh.table.skips);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 6);
    }

    #[test]
    fn test_checkpoint_of_another_subtype_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.jsonl");
        let cancers = vec!["BRCA".to_string()];
        let targets = vec![AnalysisTarget::gene("GENE1")];

        let mirna = MemoryStore::new();
        mirna.insert(CohortKey::new("BRCA", "tcga", "mirna"), cohort("BRCA", 100));
        BatchRunner::new(mirna, AnalysisConfig::default())
            .unwrap()
            .with_data("tcga", "mirna")
            .with_checkpoint(Checkpoint::open(&path).unwrap())
            .run(&cancers, &targets)
            .unwrap();

        let rnaseq = BatchRunner::new(store(), AnalysisConfig::default())
            .unwrap()
            .with_checkpoint(Checkpoint::open(&path).unwrap())
            .run(&cancers, &targets)
            .unwrap();
        // computed afresh, and the mirna outcomes are not replayed into it
        assert_eq!(rnaseq.table.rows.len() + rnaseq.table.skips.len(), 3);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 6);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(BatchRunner::new(MemoryStore::new(), AnalysisConfig::default().with_threads(0)).is_err());
    }
}
