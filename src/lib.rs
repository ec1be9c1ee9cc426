//! # expr survival
//!
//! expression-stratified survival analysis for cancer cohorts - pick the
//! high/low cutoff for a gene, compare survival, repeat across clinical subgroups
//!
//! ## what you get
//!
//! - optimal (max log-rank) cutoff search, or median / percentile splits
//! - Kaplan-Meier curves, k-group log-rank, Cox hazard ratios w/ CIs
//! - subgroup enumeration over clinical annotations w/ size + outcome-field guards
//! - Benjamini-Hochberg corrected result tables (TSV / JSON)
//! - on-disk cohort cache, checkpoint/resume, rayon when you want it
//!
//! ## quick start
//!
//! ```rust
//! use expr_survival::{
//!     AnalysisConfig, AnalysisTarget, ClinicalValue, Cohort, Outcome, ResultAggregator, Sample,
//!     SubgroupEnumerator,
//! };
//! use ndarray::Array2;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 66 patients, one gene; high expressers die sooner
//! let n = 66;
//! let samples: Vec<Sample> = (0..n)
//!     .map(|i| {
//!         let time = 100.0 + ((i * 23) % n) as f64 * 15.0 + if i < n / 2 { 600.0 } else { 0.0 };
//!         Sample::new(format!("P{}", i), Outcome::new(time, i % 5 != 0))
//!             .with_annotation("stage", ClinicalValue::parse(if i % 3 == 0 { "I" } else { "II" }))
//!     })
//!     .collect();
//! let expression = Array2::from_shape_fn((1, n), |(_, j)| 1.0 + j as f64);
//! let cohort = Cohort::new("BRCA", vec!["TP53".into()], samples, expression)?;
//!
//! let enumerator = SubgroupEnumerator::new(AnalysisConfig::default());
//! let aggregator = ResultAggregator::new();
//! for outcome in enumerator.analyze_cohort(&cohort, &[AnalysisTarget::gene("TP53")])? {
//!     aggregator.record(outcome)?;
//! }
//!
//! let table = aggregator.finalize();
//! // "all" and stage II (44 patients) are big enough, stage I (22) is not
//! assert_eq!(table.rows.len() + table.skips.len(), 3);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod batch;
pub mod checkpoint;
pub mod cohort;
pub mod compare;
pub mod config;
pub mod cutoff;
pub mod data;
pub mod error;
pub mod filter;
pub mod kaplan_meier;
pub mod logrank;
pub mod metrics;
pub mod model;
pub mod optimization;
pub mod store;
pub mod subgroup;

pub use aggregate::{ResultAggregator, ResultTable, SkipMarker, SubgroupOutcome, SurvivalStatistic};
pub use batch::{BatchReport, BatchRunner};
pub use checkpoint::Checkpoint;
pub use cohort::{ClinicalValue, Cohort, Sample};
pub use compare::{SurvivalComparator, SurvivalComparison};
pub use config::{AnalysisConfig, GeneFilterScope};
pub use cutoff::{CutoffMethod, CutoffOptimizer, CutoffResult};
pub use data::{Outcome, SurvivalData};
pub use error::{Result, SurvError};
pub use kaplan_meier::KaplanMeierCurve;
pub use model::CoxModel;
pub use store::{CohortKey, CohortStore, DirectoryStore, MemoryStore};
pub use subgroup::{AnalysisTarget, Subgroup, SubgroupEnumerator};
