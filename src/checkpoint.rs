use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    aggregate::SubgroupOutcome,
    error::{SurvError, Result},
    store::CohortKey,
    subgroup::Subgroup,
};

/// (cohort, annotation, category, target)
type CompletedKey = (CohortKey, String, String, String);

/// the outcomes of one finished subgroup of one cohort, one per target analysed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub cohort: CohortKey,
    pub annotation: String,
    pub category: String,
    pub outcomes: Vec<SubgroupOutcome>,
}

impl CheckpointRecord {
    pub fn new(cohort: &CohortKey, subgroup: &Subgroup, outcomes: Vec<SubgroupOutcome>) -> Self {
        Self {
            cohort: cohort.clone(),
            annotation: subgroup.annotation().to_string(),
            category: subgroup.category(),
            outcomes,
        }
    }

    fn completed(&self) -> impl Iterator<Item = CompletedKey> + '_ {
        self.outcomes.iter().map(move |o| {
            (
                self.cohort.clone(),
                self.annotation.clone(),
                self.category.clone(),
                o.gene().to_string(),
            )
        })
    }
}

/// append-only JSON-lines log of completed subgroups, for resuming a batch
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    records: Vec<CheckpointRecord>,
    completed: HashSet<CompletedKey>,
    writer: Mutex<BufWriter<File>>,
}

impl Checkpoint {
    /// open (or create) the log and read whatever a previous run finished
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let origin = path.display().to_string();
        let (records, truncated) = if path.exists() { read_records(&path)? } else { (Vec::new(), false) };
        if truncated {
            rewrite(&path, &records)?;
        }
        let completed = records.iter().flat_map(CheckpointRecord::completed).collect();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SurvError::io(&origin, e))?;
        if !records.is_empty() {
            info!(path = %origin, subgroups = records.len(), "resuming from checkpoint");
        }

        Ok(Self {
            path,
            records,
            completed,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// records restored from disk when the checkpoint was opened
    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    /// whether `target` was already analysed (or skipped) in this subgroup of this cohort
    pub fn is_done(&self, cohort: &CohortKey, subgroup: &Subgroup, target: &str) -> bool {
        self.completed.contains(&(
            cohort.clone(),
            subgroup.annotation().to_string(),
            subgroup.category(),
            target.to_string(),
        ))
    }

    /// one line per record, flushed immediately
    pub fn append(&self, record: &CheckpointRecord) -> Result<()> {
        let origin = self.path.display().to_string();
        let line = serde_json::to_string(record).map_err(|e| SurvError::io(&origin, e))?;
        let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(writer, "{}", line).map_err(|e| SurvError::io(&origin, e))?;
        writer.flush().map_err(|e| SurvError::io(&origin, e))
    }
}

/// records plus whether a truncated final line was dropped
fn read_records(path: &Path) -> Result<(Vec<CheckpointRecord>, bool)> {
    let origin = path.display().to_string();
    let file = File::open(path).map_err(|e| SurvError::io(&origin, e))?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()
        .map_err(|e| SurvError::io(&origin, e))?;

    let mut records = Vec::with_capacity(lines.len());
    let mut truncated = false;
    let last = lines.len();
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            // an interrupted write can only ever truncate the final line
            Err(e) if i + 1 == last => {
                warn!(path = %origin, line = i + 1, error = %e, "dropping truncated checkpoint line");
                truncated = true;
            }
            Err(e) => return Err(SurvError::malformed(&origin, i + 1, e.to_string())),
        }
    }
    Ok((records, truncated))
}

/// replace the log with just `records`, via a temp file + rename
fn rewrite(path: &Path, records: &[CheckpointRecord]) -> Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    let origin = tmp.display().to_string();
    let file = File::create(&tmp).map_err(|e| SurvError::io(&origin, e))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record).map_err(|e| SurvError::io(&origin, e))?;
        writeln!(writer).map_err(|e| SurvError::io(&origin, e))?;
    }
    writer.flush().map_err(|e| SurvError::io(&origin, e))?;
    std::fs::rename(&tmp, path).map_err(|e| SurvError::io(path.display().to_string(), e))
}
