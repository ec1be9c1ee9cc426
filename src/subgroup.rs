use std::{borrow::Cow, collections::BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    aggregate::{SkipMarker, SubgroupOutcome, SurvivalStatistic},
    cohort::{Cohort, Sample},
    compare::SurvivalComparator,
    config::{AnalysisConfig, GeneFilterScope},
    cutoff::CutoffOptimizer,
    data::{apply_horizon, Outcome},
    error::{SurvError, Result},
    filter,
};

/// label used for the whole-cohort subgroup
pub const ALL_SAMPLES: &str = "all";

/// what gets stratified: one gene, or the mean of several
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisTarget {
    Gene(String),
    Signature { name: String, genes: Vec<String> },
}

impl AnalysisTarget {
    pub fn gene(name: impl Into<String>) -> Self {
        Self::Gene(name.into())
    }

    pub fn signature(name: impl Into<String>, genes: Vec<String>) -> Self {
        Self::Signature {
            name: name.into(),
            genes,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Gene(name) | Self::Signature { name, .. } => name,
        }
    }
}

/// a sample subset defined by clinical categories
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subgroup {
    All,
    Categories {
        annotation: String,
        categories: Vec<String>,
    },
}

impl Subgroup {
    pub fn annotation(&self) -> &str {
        match self {
            Self::All => ALL_SAMPLES,
            Self::Categories { annotation, .. } => annotation,
        }
    }

    /// categories joined with `|`
    pub fn category(&self) -> String {
        match self {
            Self::All => ALL_SAMPLES.to_string(),
            Self::Categories { categories, .. } => categories.join("|"),
        }
    }

    pub fn contains(&self, sample: &Sample) -> bool {
        match self {
            Self::All => true,
            Self::Categories {
                annotation,
                categories,
            } => sample
                .annotation(annotation)
                .category_label()
                .map_or(false, |label| categories.contains(&label)),
        }
    }

    /// member ids in cohort order
    pub fn members(&self, cohort: &Cohort) -> Vec<String> {
        cohort
            .samples()
            .iter()
            .filter(|s| self.contains(s))
            .map(|s| s.id.clone())
            .collect()
    }
}

/// an annotation usable as a stratifier, with its sorted categories
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub name: String,
    pub categories: Vec<String>,
}

/// annotations with a workable number of categories that aren't outcome fields
pub fn admissible_annotations(cohort: &Cohort, config: &AnalysisConfig) -> Vec<Annotation> {
    let mut admissible = Vec::new();
    for name in cohort.annotation_names() {
        if config.is_outcome_field(&name) {
            debug!(cancer = cohort.cancer(), annotation = %name, "outcome field excluded");
            continue;
        }
        let categories: BTreeSet<String> = cohort
            .samples()
            .iter()
            .filter_map(|s| s.annotation(&name).category_label())
            .collect();
        let k = categories.len();
        if k < config.min_distinct_categories || k >= config.max_distinct_categories {
            debug!(cancer = cohort.cancer(), annotation = %name, categories = k, "annotation not admissible");
            continue;
        }
        admissible.push(Annotation {
            name,
            categories: categories.into_iter().collect(),
        });
    }
    admissible
}

/// k-subsets of 0..n in lexicographic order
#[derive(Debug, Clone)]
struct Combinations {
    n: usize,
    indices: Vec<usize>,
    started: bool,
    done: bool,
}

fn combinations(n: usize, k: usize) -> Combinations {
    Combinations {
        n,
        indices: (0..k).collect(),
        started: false,
        done: k == 0 || k > n,
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.indices.clone());
        }
        let k = self.indices.len();
        for i in (0..k).rev() {
            if self.indices[i] < self.n - k + i {
                self.indices[i] += 1;
                for j in i + 1..k {
                    self.indices[j] = self.indices[j - 1] + 1;
                }
                return Some(self.indices.clone());
            }
        }
        self.done = true;
        None
    }
}

/// singles first, then pairs, ... up to `largest` categories of one annotation
struct CategorySets {
    annotation: Annotation,
    size: usize,
    largest: usize,
    current: Combinations,
}

impl CategorySets {
    fn new(annotation: Annotation, max_combination_size: usize) -> Self {
        let n = annotation.categories.len();
        // the union of every category is just the annotated samples, never a subgroup
        let largest = max_combination_size.min(n.saturating_sub(1));
        Self {
            current: combinations(n, 1.min(largest)),
            annotation,
            size: 1,
            largest,
        }
    }
}

impl Iterator for CategorySets {
    type Item = Subgroup;

    fn next(&mut self) -> Option<Subgroup> {
        loop {
            if let Some(picked) = self.current.next() {
                return Some(Subgroup::Categories {
                    annotation: self.annotation.name.clone(),
                    categories: picked
                        .into_iter()
                        .map(|i| self.annotation.categories[i].clone())
                        .collect(),
                });
            }
            if self.size >= self.largest {
                return None;
            }
            self.size += 1;
            self.current = combinations(self.annotation.categories.len(), self.size);
        }
    }
}

/// drives cutoff search + comparison over every subgroup of a cohort
#[derive(Debug, Clone)]
pub struct SubgroupEnumerator {
    config: AnalysisConfig,
    optimizer: CutoffOptimizer,
    comparator: SurvivalComparator,
}

impl SubgroupEnumerator {
    pub fn new(config: AnalysisConfig) -> Self {
        let optimizer = CutoffOptimizer::new()
            .with_method(config.cutoff_method())
            .with_min_group_fraction(config.min_group_fraction)
            .with_log2(config.transform_to_log2);
        let comparator = SurvivalComparator::new()
            .with_horizon(config.censor_horizon_days)
            .with_cox_settings(config.cox_l2_penalty, config.cox_max_iterations, config.cox_tolerance);
        Self {
            config,
            optimizer,
            comparator,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// lazy sequence of subgroups: "all" first, then each admissible annotation
    pub fn subgroups(&self, cohort: &Cohort) -> impl Iterator<Item = Subgroup> {
        let max_k = self.config.max_combination_size;
        self.config
            .include_all_samples
            .then_some(Subgroup::All)
            .into_iter()
            .chain(
                admissible_annotations(cohort, &self.config)
                    .into_iter()
                    .flat_map(move |a| CategorySets::new(a, max_k)),
            )
    }

    /// the cohort subgroups are cut from; the inherited scope filters once, here
    pub fn prepare<'a>(&self, cohort: &'a Cohort) -> Result<Cow<'a, Cohort>> {
        match self.config.gene_filter_scope {
            GeneFilterScope::Subgroup => Ok(Cow::Borrowed(cohort)),
            GeneFilterScope::Inherited => {
                filter::filter_low_expression(cohort, self.config.min_nonzero_fraction).map(Cow::Owned)
            }
        }
    }

    /// every target x subgroup of one cohort, sequentially
    pub fn analyze_cohort(&self, cohort: &Cohort, targets: &[AnalysisTarget]) -> Result<Vec<SubgroupOutcome>> {
        let base = self.prepare(cohort)?;
        let mut outcomes = Vec::new();
        for subgroup in self.subgroups(&base) {
            outcomes.extend(self.analyze_subgroup(&base, &subgroup, targets)?);
        }
        Ok(outcomes)
    }

    /// one outcome per target; only unrecoverable errors come back as `Err`
    pub fn analyze_subgroup(
        &self,
        base: &Cohort,
        subgroup: &Subgroup,
        targets: &[AnalysisTarget],
    ) -> Result<Vec<SubgroupOutcome>> {
        let members = subgroup.members(base);
        let n = members.len();
        if n <= self.config.min_subgroup_size {
            info!(
                cancer = base.cancer(),
                annotation = subgroup.annotation(),
                category = %subgroup.category(),
                n_samples = n,
                min = self.config.min_subgroup_size,
                "subgroup too small, skipped"
            );
            let message = format!("{} samples, need more than {}", n, self.config.min_subgroup_size);
            return Ok(targets
                .iter()
                .map(|t| {
                    SubgroupOutcome::Skipped(marker(base, subgroup, t, "subgroup_too_small", message.clone(), n, None))
                })
                .collect());
        }

        let view = match self.subgroup_view(base, &members) {
            Ok(view) => view,
            Err(e) => {
                return targets
                    .iter()
                    .map(|t| self.recover(base, subgroup, t, e.clone(), n, None))
                    .collect()
            }
        };
        targets
            .iter()
            .map(|t| self.analyze_target(&view, subgroup, t))
            .collect()
    }

    fn subgroup_view(&self, base: &Cohort, members: &[String]) -> Result<Cohort> {
        let view = filter::subset(base, members)?;
        match self.config.gene_filter_scope {
            GeneFilterScope::Subgroup => filter::filter_low_expression(&view, self.config.min_nonzero_fraction),
            GeneFilterScope::Inherited => Ok(view),
        }
    }

    fn analyze_target(&self, view: &Cohort, subgroup: &Subgroup, target: &AnalysisTarget) -> Result<SubgroupOutcome> {
        let (values, outcomes) = match target_values(view, target) {
            Ok(pairs) => pairs,
            Err(e) => return self.recover(view, subgroup, target, e, view.n_samples(), None),
        };
        let n = values.len();
        // censor before the search so the split never sees follow-up past the horizon
        let outcomes = apply_horizon(&outcomes, self.config.censor_horizon_days);

        let cut = match self.optimizer.optimize(&values, &outcomes) {
            Ok(cut) => cut,
            Err(e) => return self.recover(view, subgroup, target, e, n, None),
        };
        let sizes = Some((cut.n_low, cut.n_high));
        let comparison = match self.comparator.compare_binary(&cut.high, &outcomes) {
            Ok(comparison) => comparison,
            Err(e) => return self.recover(view, subgroup, target, e, n, sizes),
        };
        // the log-rank result alone is enough for a row; cox columns stay empty when unusable
        let finite = |v: f64| v.is_finite().then_some(v);
        let term = comparison.binary_term();
        let (low, high) = (&comparison.groups[0], &comparison.groups[1]);
        let row = SurvivalStatistic {
            gene: target.name().to_string(),
            cancer: view.cancer().to_string(),
            annotation: subgroup.annotation().to_string(),
            category: subgroup.category(),
            n_samples: n,
            n_low: cut.n_low,
            n_high: cut.n_high,
            events_low: low.events,
            events_high: high.events,
            cutoff: cut.cutoff,
            log2_scale: cut.log2_scale,
            hazard_ratio: term.and_then(|t| finite(t.hazard_ratio)),
            hr_ci_lower: term.and_then(|t| finite(t.ci_lower)),
            hr_ci_upper: term.and_then(|t| finite(t.ci_upper)),
            cox_p_value: comparison.cox_lr_p_value.and_then(finite),
            logrank_statistic: comparison.logrank.statistic,
            p_value: comparison.logrank.p_value,
            adjusted_p_value: None,
            median_survival_low: low.median_survival,
            median_survival_high: high.median_survival,
            c_index: comparison.c_index.and_then(finite),
        };
        debug!(
            gene = %row.gene,
            cancer = %row.cancer,
            annotation = %row.annotation,
            category = %row.category,
            cutoff = row.cutoff,
            p_value = row.p_value,
            "subgroup analysed"
        );
        Ok(SubgroupOutcome::Analyzed {
            row,
            curve: Some(comparison.curve_data),
        })
    }

    /// recoverable errors become skip markers, anything else aborts
    fn recover(
        &self,
        cohort: &Cohort,
        subgroup: &Subgroup,
        target: &AnalysisTarget,
        err: SurvError,
        n: usize,
        sizes: Option<(usize, usize)>,
    ) -> Result<SubgroupOutcome> {
        if !err.is_recoverable() {
            return Err(err);
        }
        warn!(
            gene = target.name(),
            cancer = cohort.cancer(),
            annotation = subgroup.annotation(),
            category = %subgroup.category(),
            reason = err.kind(),
            error = %err,
            "skipped"
        );
        Ok(SubgroupOutcome::Skipped(marker(
            cohort,
            subgroup,
            target,
            err.kind(),
            err.to_string(),
            n,
            sizes,
        )))
    }
}

fn marker(
    cohort: &Cohort,
    subgroup: &Subgroup,
    target: &AnalysisTarget,
    reason: &str,
    message: String,
    n: usize,
    sizes: Option<(usize, usize)>,
) -> SkipMarker {
    SkipMarker {
        gene: target.name().to_string(),
        cancer: cohort.cancer().to_string(),
        annotation: subgroup.annotation().to_string(),
        category: subgroup.category(),
        reason: reason.to_string(),
        message,
        n_samples: n,
        n_low: sizes.map(|(low, _)| low),
        n_high: sizes.map(|(_, high)| high),
    }
}

/// the target's finite expression values paired with their outcomes
fn target_values(view: &Cohort, target: &AnalysisTarget) -> Result<(Vec<f64>, Vec<Outcome>)> {
    let scored;
    let cohort = match target {
        AnalysisTarget::Gene(_) => view,
        AnalysisTarget::Signature { name, genes } => {
            scored = view.with_signature(name, genes)?;
            &scored
        }
    };
    let expression = cohort.expression(target.name()).ok_or_else(|| {
        SurvError::empty_result(format!(
            "{} absent from {} after filtering",
            target.name(),
            cohort.cancer()
        ))
    })?;

    let (values, outcomes): (Vec<f64>, Vec<Outcome>) = expression
        .iter()
        .zip(cohort.samples())
        .filter(|(v, _)| v.is_finite())
        .map(|(&v, s)| (v, s.outcome))
        .unzip();
    if values.is_empty() {
        return Err(SurvError::empty_result(format!(
            "{} has no measured values in {}",
            target.name(),
            cohort.cancer()
        )));
    }
    Ok((values, outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::ClinicalValue;
    use ndarray::Array2;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// `sizes[c]` samples in category c of "subtype"; survival shortens with GENE1
    fn cohort_with_categories(sizes: &[usize], seed: u64) -> Cohort {
        let mut rng = StdRng::seed_from_u64(seed);
        let n: usize = sizes.iter().sum();
        let mut samples = Vec::with_capacity(n);
        let mut values = vec![0.0; 2 * n];
        let mut j = 0;
        for (c, &size) in sizes.iter().enumerate() {
            for _ in 0..size {
                let expr: f64 = rng.gen_range(1.0..10.0);
                let scale = 1000.0 * (-0.3 * expr).exp();
                let u: f64 = rng.gen_range(0.01..1.0);
                let time = -u.ln() * scale + 1.0;
                let event = rng.gen_bool(0.85);
                samples.push(
                    Sample::new(format!("P{:03}", j), Outcome::new(time, event))
                        .with_annotation("subtype", ClinicalValue::Categorical(format!("C{}", c)))
                        .with_annotation("vital_status", ClinicalValue::parse(if event { "Dead" } else { "Alive" })),
                );
                values[j] = expr;
                values[n + j] = rng.gen_range(0.5..5.0);
                j += 1;
            }
        }
        let expression = Array2::from_shape_vec((2, n), values).unwrap();
        Cohort::new("LUAD", vec!["GENE1".into(), "GENE2".into()], samples, expression).unwrap()
    }

    #[test]
    fn test_combinations() {
        let pairs: Vec<Vec<usize>> = combinations(4, 2).collect();
        assert_eq!(pairs, vec![vec![0, 1], vec![0, 2], vec![0, 3], vec![1, 2], vec![1, 3], vec![2, 3]]);
        assert_eq!(combinations(3, 0).count(), 0);
        assert_eq!(combinations(2, 3).count(), 0);
        assert_eq!(combinations(5, 5).count(), 1);
    }

    #[test]
    fn test_outcome_fields_never_enumerated() {
        let cohort = cohort_with_categories(&[45, 30, 5], 7);
        let config = AnalysisConfig::default();
        let names: Vec<String> = admissible_annotations(&cohort, &config)
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["subtype".to_string()]);
    }

    #[test]
    fn test_category_bounds() {
        let samples: Vec<Sample> = (0..12)
            .map(|i| {
                Sample::new(format!("S{}", i), Outcome::new(i as f64 + 1.0, true))
                    .with_annotation("id_like", ClinicalValue::Categorical(format!("v{}", i)))
                    .with_annotation("constant", ClinicalValue::Categorical("x".into()))
                    .with_annotation("sex", ClinicalValue::Categorical(if i % 2 == 0 { "F" } else { "M" }.into()))
                    .with_annotation("grade", if i < 3 { ClinicalValue::Missing } else { ClinicalValue::Numeric((i % 3) as f64) })
            })
            .collect();
        let cohort = Cohort::new("KIRC", vec!["G".into()], samples, Array2::ones((1, 12))).unwrap();
        let admissible = admissible_annotations(&cohort, &AnalysisConfig::default());
        let names: Vec<&str> = admissible.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["grade", "sex"]);
        assert_eq!(admissible[0].categories, vec!["0".to_string(), "1".into(), "2".into()]);
    }

    #[test]
    fn test_subgroup_sequence() {
        let cohort = cohort_with_categories(&[45, 30, 5], 7);
        let enumerator = SubgroupEnumerator::new(AnalysisConfig::default().with_max_combination_size(2));
        let subgroups: Vec<Subgroup> = enumerator.subgroups(&cohort).collect();
        assert_eq!(subgroups.len(), 7);
        assert_eq!(subgroups[0], Subgroup::All);
        assert_eq!(subgroups[1].category(), "C0");
        assert_eq!(subgroups[4].category(), "C0|C1");
        assert!(subgroups.iter().all(|s| s.category() != "C0|C1|C2"));
        assert_eq!(subgroups[4].members(&cohort).len(), 75);

        let singles = SubgroupEnumerator::new(AnalysisConfig::default().with_include_all_samples(false));
        assert_eq!(singles.subgroups(&cohort).count(), 3);
    }

    #[test]
    fn test_only_large_subgroups_are_analysed() {
        let cohort = cohort_with_categories(&[45, 30, 5], 11);
        let config = AnalysisConfig::default().with_include_all_samples(false);
        let outcomes = SubgroupEnumerator::new(config)
            .analyze_cohort(&cohort, &[AnalysisTarget::gene("GENE1")])
            .unwrap();
        assert_eq!(outcomes.len(), 3);

        match &outcomes[0] {
            SubgroupOutcome::Analyzed { row, curve } => {
                assert_eq!(row.category, "C0");
                assert_eq!(row.n_samples, 45);
                assert_eq!(row.n_low + row.n_high, 45);
                assert_eq!(curve.as_ref().unwrap().times.len(), 45);
            }
            other => panic!("expected C0 analysed, got {:?}", other),
        }
        for outcome in &outcomes[1..] {
            match outcome {
                SubgroupOutcome::Skipped(marker) => assert_eq!(marker.reason, "subgroup_too_small"),
                other => panic!("expected skip, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_missing_gene_and_signature_targets() {
        let cohort = cohort_with_categories(&[60], 3);
        let config = AnalysisConfig::default();
        let targets = vec![
            AnalysisTarget::gene("NOPE"),
            AnalysisTarget::signature("SIG", vec!["GENE1".into(), "GENE2".into()]),
            AnalysisTarget::signature("EMPTY", vec!["NOPE".into()]),
        ];
        let outcomes = SubgroupEnumerator::new(config)
            .analyze_subgroup(&cohort, &Subgroup::All, &targets)
            .unwrap();
        assert!(matches!(&outcomes[0], SubgroupOutcome::Skipped(m) if m.reason == "empty_result"));
        assert!(matches!(&outcomes[1], SubgroupOutcome::Analyzed { row, .. } if row.gene == "SIG"));
        assert!(matches!(&outcomes[2], SubgroupOutcome::Skipped(m) if m.gene == "EMPTY"));
    }

    fn subtype(category: &str) -> Subgroup {
        Subgroup::Categories {
            annotation: "subtype".into(),
            categories: vec![category.into()],
        }
    }

    /// copy of `base` with GENE2 zeroed at the given sample positions
    fn silence_gene2(base: &Cohort, positions: impl IntoIterator<Item = usize>) -> Cohort {
        let mut matrix = base.matrix().clone();
        for j in positions {
            matrix[[1, j]] = 0.0;
        }
        Cohort::new("LUAD", base.genes().to_vec(), base.samples().to_vec(), matrix).unwrap()
    }

    fn analysed_samples(outcome: &SubgroupOutcome) -> Option<usize> {
        match outcome {
            SubgroupOutcome::Analyzed { row, .. } => Some(row.n_samples),
            SubgroupOutcome::Skipped(_) => None,
        }
    }

    #[test]
    fn test_subgroup_filter_recovers_gene_lost_cohort_wide() {
        // GENE2 silenced in all of C1: 50% non-zero cohort-wide, 100% inside C0
        let cohort = silence_gene2(&cohort_with_categories(&[50, 50], 5), 50..100);
        let targets = [AnalysisTarget::gene("GENE2")];

        let local = SubgroupEnumerator::new(AnalysisConfig::default());
        let prepared = local.prepare(&cohort).unwrap();
        let outcome = local.analyze_subgroup(&prepared, &subtype("C0"), &targets).unwrap();
        assert_eq!(analysed_samples(&outcome[0]), Some(50));
        let outcome = local.analyze_subgroup(&prepared, &subtype("C1"), &targets).unwrap();
        assert!(matches!(&outcome[0], SubgroupOutcome::Skipped(m) if m.reason == "empty_result"));

        let inherited = SubgroupEnumerator::new(
            AnalysisConfig::default().with_gene_filter_scope(GeneFilterScope::Inherited),
        );
        let prepared = inherited.prepare(&cohort).unwrap();
        assert!(!prepared.has_gene("GENE2"));
        let outcome = inherited.analyze_subgroup(&prepared, &subtype("C0"), &targets).unwrap();
        assert!(matches!(&outcome[0], SubgroupOutcome::Skipped(m) if m.reason == "empty_result"));
    }

    #[test]
    fn test_subgroup_filter_drops_gene_sparse_within_subgroup() {
        // 8 zeros, all in C1: 92% non-zero cohort-wide, 84% inside C1
        let cohort = silence_gene2(&cohort_with_categories(&[50, 50], 5), 50..58);
        let targets = [AnalysisTarget::gene("GENE2")];

        let local = SubgroupEnumerator::new(AnalysisConfig::default());
        let prepared = local.prepare(&cohort).unwrap();
        let outcome = local.analyze_subgroup(&prepared, &subtype("C1"), &targets).unwrap();
        assert!(matches!(&outcome[0], SubgroupOutcome::Skipped(m) if m.reason == "empty_result"));
        let outcome = local.analyze_subgroup(&prepared, &Subgroup::All, &targets).unwrap();
        assert_eq!(analysed_samples(&outcome[0]), Some(100));

        let inherited = SubgroupEnumerator::new(
            AnalysisConfig::default().with_gene_filter_scope(GeneFilterScope::Inherited),
        );
        let prepared = inherited.prepare(&cohort).unwrap();
        assert!(prepared.has_gene("GENE2"));
        let outcome = inherited.analyze_subgroup(&prepared, &subtype("C1"), &targets).unwrap();
        assert_eq!(analysed_samples(&outcome[0]), Some(50));
    }
}
