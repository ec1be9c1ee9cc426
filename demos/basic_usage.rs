use expr_survival::data::apply_horizon;
use expr_survival::{
    AnalysisConfig, AnalysisTarget, BatchRunner, ClinicalValue, Cohort, CohortKey, CutoffOptimizer,
    MemoryStore, Outcome, Sample, SurvivalComparator,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// one cancer: MKI67 raises the hazard, ESR1 lowers it, GAPDH does nothing
fn generate_synthetic_cohort(cancer: &str, n_samples: usize, seed: u64) -> expr_survival::Result<Cohort> {
    let mut rng = StdRng::seed_from_u64(seed);
    let genes = vec!["MKI67".to_string(), "ESR1".to_string(), "GAPDH".to_string()];
    let mut expression = Array2::zeros((genes.len(), n_samples));
    let mut samples = Vec::with_capacity(n_samples);

    for j in 0..n_samples {
        let mki67: f64 = rng.gen_range(0.0..12.0);
        let esr1: f64 = rng.gen_range(0.0..12.0);
        expression[[0, j]] = mki67;
        expression[[1, j]] = esr1;
        expression[[2, j]] = rng.gen_range(8.0..10.0);

        let hazard = 0.0005 * (0.25 * mki67 - 0.1 * esr1).exp();
        let time = (-rng.gen::<f64>().ln() / hazard).max(1.0);
        let censoring_time = rng.gen_range(300.0..5000.0);
        let outcome = if time < censoring_time {
            Outcome::new(time.round(), true)
        } else {
            Outcome::new(censoring_time.round(), false)
        };

        let stage = ["I", "II", "III"][rng.gen_range(0..3)];
        let gender = if rng.gen_bool(0.5) { "female" } else { "male" };
        samples.push(
            Sample::new(format!("{}-{:04}", cancer, j), outcome)
                .with_annotation("stage", ClinicalValue::parse(stage))
                .with_annotation("gender", ClinicalValue::parse(gender))
                .with_annotation("vital_status", ClinicalValue::parse(if outcome.event { "dead" } else { "alive" })),
        );
    }

    Cohort::new(cancer, genes, samples, expression)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Expression-Stratified Survival - Basic Usage Example");
    println!("====================================================\n");

    let brca = generate_synthetic_cohort("BRCA", 300, 42)?;
    let luad = generate_synthetic_cohort("LUAD", 180, 7)?;

    // Example 1: a single gene in a single cohort
    println!("Example 1: Optimal Cutoff for MKI67 in BRCA");
    println!("-------------------------------------------");

    let expression: Vec<f64> = brca.expression("MKI67").map(|row| row.to_vec()).unwrap_or_default();
    // five-year horizon before the search, so the split sees what the comparison sees
    let outcomes = apply_horizon(&brca.outcomes(), Some(1825.0));
    let split = CutoffOptimizer::new().optimize(&expression, &outcomes)?;
    let comparison = SurvivalComparator::new().compare_binary(&split.high, &outcomes)?;

    println!("  cutoff:        {:.3} ({} candidates tested)", split.cutoff, split.candidates_tested);
    println!("  groups:        {} low / {} high", split.n_low, split.n_high);
    println!("  log-rank p:    {:.3e}", comparison.logrank.p_value);
    if let Some(term) = comparison.binary_term() {
        println!(
            "  hazard ratio:  {:.2} [{:.2}, {:.2}]",
            term.hazard_ratio, term.ci_lower, term.ci_upper
        );
    }
    for group in &comparison.groups {
        match group.median_survival {
            Some(median) => println!("  median ({:>4}): {:.0} days", group.label, median),
            None => println!("  median ({:>4}): not reached", group.label),
        }
    }
    println!();

    // Example 2: batch over cancers, genes and clinical subgroups
    println!("Example 2: Subgroup Sweep Across Cohorts");
    println!("----------------------------------------");

    let store = MemoryStore::new();
    store.insert(CohortKey::new("BRCA", "tcga", "rnaseq"), brca);
    store.insert(CohortKey::new("LUAD", "tcga", "rnaseq"), luad);

    let config = AnalysisConfig::default()
        .with_censor_horizon(Some(1825.0))
        .with_max_combination_size(2)
        .with_threads(4);
    let runner = BatchRunner::new(store, config)?;

    let cancers = vec!["BRCA".to_string(), "LUAD".to_string(), "GBM".to_string()];
    let targets = vec![
        AnalysisTarget::gene("MKI67"),
        AnalysisTarget::gene("ESR1"),
        AnalysisTarget::gene("GAPDH"),
        AnalysisTarget::signature("PROLIF", vec!["MKI67".to_string(), "GAPDH".to_string()]),
    ];
    let report = runner.run(&cancers, &targets)?;

    println!(
        "  {} rows, {} skipped, {} cohorts unavailable, {} ms",
        report.table.rows.len(),
        report.table.skips.len(),
        report.failed_cohorts.len(),
        report.elapsed_ms
    );
    println!();
    println!(
        "  {:<8} {:<6} {:<14} {:<16} {:>6} {:>10} {:>10}",
        "gene", "cancer", "annotation", "category", "HR", "p", "q"
    );
    for row in report.table.rows.iter().take(10) {
        println!(
            "  {:<8} {:<6} {:<14} {:<16} {:>6.2} {:>10.2e} {:>10.2e}",
            row.gene,
            row.cancer,
            row.annotation,
            row.category,
            row.hazard_ratio.unwrap_or(f64::NAN),
            row.p_value,
            row.adjusted_p_value.unwrap_or(f64::NAN)
        );
    }
    println!();
    println!("  significant at q <= 0.05: {}", report.table.significant(0.05).count());

    let out = std::env::temp_dir().join("expr_survival_demo.tsv");
    report.table.write_tsv(&out)?;
    println!("  full table written to {}", out.display());

    Ok(())
}
