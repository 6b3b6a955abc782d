//! Append-only run history, kept in memory or mirrored to JSON documents.
//!
//! A directory target holds one sub-directory per run:
//!
//! ```text
//! <root>/run_0001/run.json
//! <root>/run_0001/population_00000.json
//! <root>/run_0001/population_00001.json
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use abc_core::errors::ErrorInfo;
use abc_core::{
    AbcError, GenerationSummary, History, Population, RunMetadata, SampleMarker, SumStats,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where a run history lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    /// Process memory only; cannot be reloaded.
    Memory,
    /// JSON documents below the given root directory.
    Directory(PathBuf),
}

/// Start and end of one (possibly resumed) execution of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// RFC 3339 start timestamp.
    pub started: String,
    /// RFC 3339 end timestamp, absent while running.
    #[serde(default)]
    pub finished: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RunRecord {
    id: u64,
    metadata: Option<RunMetadata>,
    #[serde(default)]
    calibration_samples: usize,
    #[serde(default)]
    generations: Vec<GenerationSummary>,
    #[serde(default)]
    sessions: Vec<Session>,
}

fn storage_error(code: &str, err: impl ToString, path: &Path) -> AbcError {
    AbcError::Storage(ErrorInfo::new(code, err.to_string()).with_context("path", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AbcError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| storage_error("history-mkdir", err, parent))?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|err| {
        AbcError::Serde(
            ErrorInfo::new("history-serialize", err.to_string()).with_context("path", path.display()),
        )
    })?;
    fs::write(path, json).map_err(|err| storage_error("history-write", err, path))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, AbcError> {
    let contents = fs::read_to_string(path).map_err(|err| storage_error("history-read", err, path))?;
    serde_json::from_str(&contents).map_err(|err| {
        AbcError::Serde(
            ErrorInfo::new("history-parse", err.to_string()).with_context("path", path.display()),
        )
    })
}

/// Directory of run `id` below `root`.
pub fn run_dir(root: &Path, id: u64) -> PathBuf {
    root.join(format!("run_{id:04}"))
}

/// Population document of generation `t`.
pub fn population_path(run_dir: &Path, t: usize) -> PathBuf {
    run_dir.join(format!("population_{t:05}.json"))
}

fn next_run_id(root: &Path) -> Result<u64, AbcError> {
    if !root.exists() {
        return Ok(1);
    }
    let entries = fs::read_dir(root).map_err(|err| storage_error("history-scan", err, root))?;
    let mut max_id = 0;
    for entry in entries {
        let entry = entry.map_err(|err| storage_error("history-scan", err, root))?;
        let name = entry.file_name();
        if let Some(id) = name
            .to_str()
            .and_then(|name| name.strip_prefix("run_"))
            .and_then(|digits| digits.parse::<u64>().ok())
        {
            max_id = max_id.max(id);
        }
    }
    Ok(max_id + 1)
}

/// [`History`] implementation backing the orchestrator.
#[derive(Debug, Clone)]
pub struct RunHistory {
    dir: Option<PathBuf>,
    record: RunRecord,
    populations: BTreeMap<usize, Population>,
}

impl RunHistory {
    /// Creates a fresh run at `target` and stores its metadata.
    pub fn create(target: &StorageTarget, metadata: RunMetadata) -> Result<Self, AbcError> {
        let (id, dir) = match target {
            StorageTarget::Memory => (1, None),
            StorageTarget::Directory(root) => {
                let id = next_run_id(root)?;
                (id, Some(run_dir(root, id)))
            }
        };
        let mut history = Self {
            dir,
            record: RunRecord {
                id,
                ..RunRecord::default()
            },
            populations: BTreeMap::new(),
        };
        history.store_initial_data(metadata)?;
        Ok(history)
    }

    /// Reopens run `id` stored at `target`.
    pub fn load(target: &StorageTarget, id: u64) -> Result<Self, AbcError> {
        let root = match target {
            StorageTarget::Directory(root) => root,
            StorageTarget::Memory => {
                return Err(AbcError::Storage(
                    ErrorInfo::new("history-not-persistent", "in-memory runs cannot be reloaded")
                        .with_context("id", id),
                ))
            }
        };
        let dir = run_dir(root, id);
        let record: RunRecord = read_json(&dir.join("run.json"))?;
        let mut populations = BTreeMap::new();
        for summary in &record.generations {
            let population: Population = read_json(&population_path(&dir, summary.t))?;
            populations.insert(summary.t, Population::new(population.particles().to_vec())?);
        }
        debug!(id, generations = populations.len(), "loaded run history");
        Ok(Self {
            dir: Some(dir),
            record,
            populations,
        })
    }

    /// Directory of the run, `None` for in-memory histories.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Stored metadata.
    pub fn metadata(&self) -> Option<&RunMetadata> {
        self.record.metadata.as_ref()
    }

    /// Replaces the observed statistics, e.g. when reloading with an override.
    pub fn set_observed_sum_stats(&mut self, observed: SumStats) -> Result<(), AbcError> {
        let metadata = self.record.metadata.get_or_insert_with(RunMetadata::default);
        metadata.observed_sum_stats = observed;
        self.persist_record()
    }

    /// Executions of this run.
    pub fn sessions(&self) -> &[Session] {
        &self.record.sessions
    }

    /// Evaluations spent on calibration.
    pub fn calibration_samples(&self) -> usize {
        self.record.calibration_samples
    }

    fn persist_record(&self) -> Result<(), AbcError> {
        match &self.dir {
            Some(dir) => write_json(&dir.join("run.json"), &self.record),
            None => Ok(()),
        }
    }
}

impl History for RunHistory {
    fn id(&self) -> u64 {
        self.record.id
    }

    fn store_initial_data(&mut self, metadata: RunMetadata) -> Result<(), AbcError> {
        self.record.metadata = Some(metadata);
        self.persist_record()
    }

    fn observed_sum_stats(&self) -> Result<SumStats, AbcError> {
        self.record
            .metadata
            .as_ref()
            .map(|metadata| metadata.observed_sum_stats.clone())
            .ok_or_else(|| {
                AbcError::Storage(
                    ErrorInfo::new("missing-metadata", "run has no stored metadata")
                        .with_context("id", self.record.id),
                )
            })
    }

    fn max_t(&self) -> Option<usize> {
        self.populations.keys().next_back().copied()
    }

    fn n_populations(&self) -> usize {
        self.populations.len()
    }

    fn append_population(
        &mut self,
        t: usize,
        epsilon: f64,
        population: &Population,
        nr_evaluations: usize,
        model_names: &[String],
    ) -> Result<(), AbcError> {
        if let Some(max_t) = self.max_t() {
            if t <= max_t {
                return Err(AbcError::Storage(
                    ErrorInfo::new("non-monotonic-append", "generations must be appended in order")
                        .with_context("t", t)
                        .with_context("max_t", max_t),
                ));
            }
        }
        if let Some(dir) = &self.dir {
            write_json(&population_path(dir, t), population)?;
        }
        if let Some(metadata) = self.record.metadata.as_mut() {
            if metadata.model_names.is_empty() {
                metadata.model_names = model_names.to_vec();
            }
        }
        self.record.generations.push(GenerationSummary {
            t,
            epsilon,
            nr_evaluations,
            population_size: population.len(),
        });
        self.populations.insert(t, population.clone());
        self.persist_record()
    }

    fn get_population(&self, t: Option<usize>) -> Result<Population, AbcError> {
        let t = match t.or_else(|| self.max_t()) {
            Some(t) => t,
            None => {
                return Err(AbcError::Lookup(ErrorInfo::new(
                    "empty-history",
                    "no population has been stored yet",
                )))
            }
        };
        self.populations
            .get(&t)
            .cloned()
            .ok_or_else(|| AbcError::missing_generation("history", t))
    }

    fn update_nr_samples(&mut self, marker: SampleMarker, count: usize) -> Result<(), AbcError> {
        match marker {
            SampleMarker::Calibration => self.record.calibration_samples += count,
            SampleMarker::Generation(t) => {
                let summary = self
                    .record
                    .generations
                    .iter_mut()
                    .find(|summary| summary.t == t)
                    .ok_or_else(|| AbcError::missing_generation("history", t))?;
                summary.nr_evaluations = count;
            }
        }
        self.persist_record()
    }

    fn total_nr_simulations(&self) -> usize {
        self.record.calibration_samples
            + self
                .record
                .generations
                .iter()
                .map(|summary| summary.nr_evaluations)
                .sum::<usize>()
    }

    fn generations(&self) -> Vec<GenerationSummary> {
        self.record.generations.clone()
    }

    fn start(&mut self) -> Result<(), AbcError> {
        self.record.sessions.push(Session {
            started: Utc::now().to_rfc3339(),
            finished: None,
        });
        self.persist_record()
    }

    fn done(&mut self) -> Result<(), AbcError> {
        if let Some(session) = self.record.sessions.last_mut() {
            session.finished = Some(Utc::now().to_rfc3339());
        }
        self.persist_record()
    }
}
