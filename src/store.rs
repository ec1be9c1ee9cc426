use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::RwLock,
};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    cohort::{ClinicalValue, Cohort, Sample},
    data::Outcome,
    error::{SurvError, Result},
};

pub const EXPRESSION_FILE: &str = "expression.tsv";
pub const CLINICAL_FILE: &str = "clinical.tsv";
const LOCK_FILE: &str = ".lock";

/// (cancer, data source, data subtype) - one cohort entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CohortKey {
    pub cancer: String,
    pub data_source: String,
    pub subtype: String,
}

impl CohortKey {
    pub fn new(cancer: impl Into<String>, data_source: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            cancer: cancer.into(),
            data_source: data_source.into(),
            subtype: subtype.into(),
        }
    }

    fn unavailable(&self, message: impl Into<String>) -> SurvError {
        SurvError::data_unavailable(&self.cancer, &self.data_source, &self.subtype, message)
    }
}

impl fmt::Display for CohortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cancer, self.data_source, self.subtype)
    }
}

/// where cohorts come from
pub trait CohortStore: Send + Sync {
    fn load(&self, cancer: &str, data_source: &str, subtype: &str) -> Result<Cohort>;

    fn load_key(&self, key: &CohortKey) -> Result<Cohort> {
        self.load(&key.cancer, &key.data_source, &key.subtype)
    }
}

/// cohorts held in memory, mostly for tests and demos
#[derive(Debug, Default)]
pub struct MemoryStore {
    cohorts: RwLock<HashMap<CohortKey, Cohort>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: CohortKey, cohort: Cohort) {
        self.cohorts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, cohort);
    }
}

impl CohortStore for MemoryStore {
    fn load(&self, cancer: &str, data_source: &str, subtype: &str) -> Result<Cohort> {
        let key = CohortKey::new(cancer, data_source, subtype);
        self.cohorts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .cloned()
            .ok_or_else(|| key.unavailable("not in memory store"))
    }
}

/// on-disk cache: `<root>/<cancer>/<source>/<subtype>/{expression,clinical}.tsv`.
/// entries are append-only; a written entry is never replaced.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    time_column: String,
    event_column: String,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            time_column: "OS.time".to_string(),
            event_column: "OS".to_string(),
        }
    }

    /// clinical columns holding survival time (days) and the event flag
    pub fn with_outcome_columns(mut self, time: impl Into<String>, event: impl Into<String>) -> Self {
        self.time_column = time.into();
        self.event_column = event.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, key: &CohortKey) -> PathBuf {
        self.root.join(&key.cancer).join(&key.data_source).join(&key.subtype)
    }

    pub fn contains(&self, key: &CohortKey) -> bool {
        let dir = self.entry_dir(key);
        dir.join(EXPRESSION_FILE).is_file() && dir.join(CLINICAL_FILE).is_file()
    }

    /// write a new entry; fails if it exists or another writer holds the lock
    pub fn save(&self, key: &CohortKey, cohort: &Cohort) -> Result<()> {
        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir).map_err(|e| SurvError::io(dir.display().to_string(), e))?;
        let _lock = EntryLock::acquire(&dir)?;
        if self.contains(key) {
            return Err(SurvError::io(
                dir.display().to_string(),
                "cache entry already exists, refusing to overwrite",
            ));
        }

        let clinical = dir.join(CLINICAL_FILE);
        let expression = dir.join(EXPRESSION_FILE);
        write_atomically(&clinical, |w| self.write_clinical(w, cohort))?;
        // expression lands last; its presence marks a complete entry
        write_atomically(&expression, |w| write_expression(w, cohort))?;
        info!(key = %key, genes = cohort.n_genes(), samples = cohort.n_samples(), "cohort cached");
        Ok(())
    }

    fn write_clinical<W: Write>(&self, writer: W, cohort: &Cohort) -> Result<()> {
        let columns: Vec<String> = cohort.annotation_names().into_iter().collect();
        let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
        let mut header = vec!["sample".to_string(), self.time_column.clone(), self.event_column.clone()];
        header.extend(columns.iter().cloned());
        out.write_record(&header).map_err(|e| SurvError::io(CLINICAL_FILE, e))?;

        for sample in cohort.samples() {
            let mut record = vec![
                sample.id.clone(),
                sample.outcome.time.to_string(),
                if sample.outcome.event { "1" } else { "0" }.to_string(),
            ];
            record.extend(columns.iter().map(|c| match sample.annotation(c) {
                ClinicalValue::Numeric(v) => v.to_string(),
                ClinicalValue::Categorical(s) => s.clone(),
                ClinicalValue::Missing => "NA".to_string(),
            }));
            out.write_record(&record).map_err(|e| SurvError::io(CLINICAL_FILE, e))?;
        }
        out.flush().map_err(|e| SurvError::io(CLINICAL_FILE, e))
    }

    fn read_clinical(&self, path: &Path) -> Result<Vec<Sample>> {
        let origin = path.display().to_string();
        let mut reader = tsv_reader(path)?;
        let header: Vec<String> = reader
            .headers()
            .map_err(|e| SurvError::malformed(&origin, 1, e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        let column = |name: &str| {
            header
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| SurvError::malformed(&origin, 1, format!("missing column '{}'", name)))
        };
        let time_col = column(&self.time_column)?;
        let event_col = column(&self.event_column)?;

        let mut samples = Vec::new();
        let mut dropped = 0usize;
        for (i, record) in reader.records().enumerate() {
            let line = i + 2;
            let record = record.map_err(|e| SurvError::malformed(&origin, line, e.to_string()))?;
            let id = record.get(0).unwrap_or_default().trim();
            if id.is_empty() {
                return Err(SurvError::malformed(&origin, line, "empty sample id"));
            }

            let time = match ClinicalValue::parse(record.get(time_col).unwrap_or_default()) {
                ClinicalValue::Numeric(t) if t >= 0.0 => Some(t),
                ClinicalValue::Missing => None,
                other => {
                    return Err(SurvError::malformed(&origin, line, format!("bad survival time {:?}", other)))
                }
            };
            let event = parse_event(record.get(event_col).unwrap_or_default())
                .map_err(|raw| SurvError::malformed(&origin, line, format!("bad event flag '{}'", raw)))?;
            let (Some(time), Some(event)) = (time, event) else {
                dropped += 1;
                continue;
            };

            let mut sample = Sample::new(id, Outcome::new(time, event));
            for (j, cell) in record.iter().enumerate() {
                if j == 0 || j == time_col || j == event_col {
                    continue;
                }
                sample = sample.with_annotation(header[j].clone(), ClinicalValue::parse(cell));
            }
            samples.push(sample);
        }
        if dropped > 0 {
            debug!(path = %origin, dropped, "samples without outcome dropped");
        }
        Ok(samples)
    }
}

impl CohortStore for DirectoryStore {
    fn load(&self, cancer: &str, data_source: &str, subtype: &str) -> Result<Cohort> {
        let key = CohortKey::new(cancer, data_source, subtype);
        let dir = self.entry_dir(&key);
        if dir.join(LOCK_FILE).exists() {
            return Err(key.unavailable("entry is being written"));
        }
        if !self.contains(&key) {
            return Err(key.unavailable(format!("no cache entry under {}", dir.display())));
        }

        let samples = self.read_clinical(&dir.join(CLINICAL_FILE))?;
        let (genes, sample_ids, matrix) = read_expression(&dir.join(EXPRESSION_FILE))?;

        // join on sample id, expression column order wins
        let by_id: HashMap<&str, &Sample> = samples.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut columns = Vec::new();
        let mut joined = Vec::new();
        for (j, id) in sample_ids.iter().enumerate() {
            if let Some(sample) = by_id.get(id.as_str()) {
                columns.push(j);
                joined.push((*sample).clone());
            }
        }
        if joined.is_empty() {
            warn!(key = %key, "no sample has both expression and outcome");
            return Err(key.unavailable("no sample has both expression and outcome"));
        }

        let expression = matrix.select(ndarray::Axis(1), &columns);
        debug!(key = %key, genes = genes.len(), samples = joined.len(), "cohort loaded");
        Cohort::new(cancer, genes, joined, expression)
    }
}

/// `1/0`, `dead/alive`, `true/false`, `deceased/living`; `None` when missing
fn parse_event(raw: &str) -> std::result::Result<Option<bool>, String> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "1" | "1.0" | "dead" | "deceased" | "true" | "yes" => Ok(Some(true)),
        "0" | "0.0" | "alive" | "living" | "false" | "no" => Ok(Some(false)),
        _ if ClinicalValue::parse(&value).is_missing() => Ok(None),
        _ => Err(raw.to_string()),
    }
}

fn tsv_reader(path: &Path) -> Result<csv::Reader<File>> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(|e| SurvError::io(path.display().to_string(), e))
}

/// genes x samples; NA-like cells become NaN
fn read_expression(path: &Path) -> Result<(Vec<String>, Vec<String>, Array2<f64>)> {
    let origin = path.display().to_string();
    let mut reader = tsv_reader(path)?;
    let sample_ids: Vec<String> = reader
        .headers()
        .map_err(|e| SurvError::malformed(&origin, 1, e.to_string()))?
        .iter()
        .skip(1)
        .map(str::to_string)
        .collect();
    let unique: BTreeSet<&String> = sample_ids.iter().collect();
    if unique.len() != sample_ids.len() {
        return Err(SurvError::malformed(&origin, 1, "duplicate sample ids"));
    }

    let mut genes = Vec::new();
    let mut values = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let line = i + 2;
        let record = record.map_err(|e| SurvError::malformed(&origin, line, e.to_string()))?;
        genes.push(record.get(0).unwrap_or_default().trim().to_string());
        for cell in record.iter().skip(1) {
            let value = match ClinicalValue::parse(cell) {
                ClinicalValue::Numeric(v) => v,
                ClinicalValue::Missing => f64::NAN,
                ClinicalValue::Categorical(s) => {
                    return Err(SurvError::malformed(&origin, line, format!("non-numeric value '{}'", s)))
                }
            };
            values.push(value);
        }
    }

    let matrix = Array2::from_shape_vec((genes.len(), sample_ids.len()), values)
        .map_err(|e| SurvError::malformed(&origin, 0, e.to_string()))?;
    Ok((genes, sample_ids, matrix))
}

fn write_expression<W: Write>(writer: W, cohort: &Cohort) -> Result<()> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    let mut header = vec!["gene".to_string()];
    header.extend(cohort.sample_ids());
    out.write_record(&header).map_err(|e| SurvError::io(EXPRESSION_FILE, e))?;
    for (gene, row) in cohort.genes().iter().zip(cohort.matrix().rows()) {
        let mut record = vec![gene.clone()];
        record.extend(row.iter().map(|v| if v.is_finite() { v.to_string() } else { "NA".to_string() }));
        out.write_record(&record).map_err(|e| SurvError::io(EXPRESSION_FILE, e))?;
    }
    out.flush().map_err(|e| SurvError::io(EXPRESSION_FILE, e))
}

/// write to `<path>.tmp`, then rename over `path`
fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let tmp = path.with_extension("tsv.tmp");
    let file = File::create(&tmp).map_err(|e| SurvError::io(tmp.display().to_string(), e))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    writer.flush().map_err(|e| SurvError::io(tmp.display().to_string(), e))?;
    fs::rename(&tmp, path).map_err(|e| SurvError::io(path.display().to_string(), e))
}

/// advisory lock: a `.lock` file created exclusively, removed on drop
struct EntryLock {
    path: PathBuf,
}

impl EntryLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| SurvError::io(path.display().to_string(), format!("entry locked by another writer: {}", e)))?;
        Ok(Self { path })
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
