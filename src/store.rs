//! Append-only, partitioned sample store on the local filesystem.
//!
//! Layout: `<root>/<persona_id>/<model_dir>/<uuid>.json`. A partition's
//! sample count is the number of `*.json` files directly inside it, so the
//! directory itself is the only progress record. Writes go to a hidden temp
//! file first and are renamed into place, which keeps half-written samples
//! out of the count.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::inference::ObservationFlag;
use crate::persona::{ModelDescriptor, Persona};
use crate::questionnaire::AnswerValue;

const SAMPLE_EXT: &str = "json";

// =============================================================================
// Samples
// =============================================================================

/// One answered (or unanswered) question within a sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub segment: String,
    pub id: i64,
    pub dimension: String,
    pub model: String,
    pub persona: String,
    pub response: Option<AnswerValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<ObservationFlag>,
}

/// One full pass over the questionnaire, serialized as a JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sample {
    pub observations: Vec<Observation>,
}

impl Sample {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Observations with a null response.
    pub fn null_count(&self) -> usize {
        self.observations
            .iter()
            .filter(|o| o.response.is_none())
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.null_count() == 0
    }
}

// =============================================================================
// Configuration key
// =============================================================================

/// Identifies a partition: (persona id, model directory name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigurationKey {
    pub persona_id: String,
    pub model_dir: String,
}

impl ConfigurationKey {
    pub fn new(persona_id: impl Into<String>, model_dir: impl Into<String>) -> Self {
        Self {
            persona_id: persona_id.into(),
            model_dir: model_dir.into(),
        }
    }

    pub fn for_pair(persona: &Persona, model: &ModelDescriptor) -> Self {
        Self::new(persona.id.clone(), model.dir_name())
    }
}

impl fmt::Display for ConfigurationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.persona_id, self.model_dir)
    }
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize sample: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("invalid sample file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to walk sample store: {0}")]
    Walk(#[from] walkdir::Error),
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition(&self, key: &ConfigurationKey) -> PathBuf {
        self.root.join(&key.persona_id).join(&key.model_dir)
    }

    pub fn ensure_partition(&self, key: &ConfigurationKey) -> Result<PathBuf, StoreError> {
        let dir = self.partition(key);
        std::fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        Ok(dir)
    }

    /// Number of samples in the partition. A missing partition holds zero.
    pub fn count(&self, key: &ConfigurationKey) -> Result<usize, StoreError> {
        Ok(self.sample_paths(key)?.len())
    }

    /// Number of samples in the partition with no null response.
    pub fn count_complete(&self, key: &ConfigurationKey) -> Result<usize, StoreError> {
        let mut complete = 0;
        for path in self.sample_paths(key)? {
            if self.read(&path)?.is_complete() {
                complete += 1;
            }
        }
        Ok(complete)
    }

    /// Persist `sample` under a fresh id. Never overwrites an existing file.
    pub fn write(&self, sample: &Sample, key: &ConfigurationKey) -> Result<Uuid, StoreError> {
        let dir = self.ensure_partition(key)?;
        let body = serde_json::to_vec_pretty(sample).map_err(StoreError::Serialize)?;

        let (id, target) = loop {
            let id = Uuid::new_v4();
            let target = dir.join(format!("{id}.{SAMPLE_EXT}"));
            if !target.exists() {
                break (id, target);
            }
        };

        let tmp = dir.join(format!(".{id}.{SAMPLE_EXT}.tmp"));
        std::fs::write(&tmp, &body).map_err(io_at(&tmp))?;
        if let Err(source) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(StoreError::Io {
                path: target,
                source,
            });
        }
        Ok(id)
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Result<Sample, StoreError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(io_at(path))?;
        serde_json::from_slice(&raw).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every sample file under the root, at any depth, sorted.
    pub fn list_all(&self) -> Result<Vec<PathBuf>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            if entry.file_type().is_file() && is_sample_file(entry.path()) {
                paths.push(entry.into_path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn sample_paths(&self, key: &ConfigurationKey) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.partition(key);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_at(&dir))?;
            let path = entry.path();
            if path.is_file() && is_sample_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn is_sample_file(path: &Path) -> bool {
    let visible = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with('.'));
    visible && path.extension().and_then(|e| e.to_str()) == Some(SAMPLE_EXT)
}
