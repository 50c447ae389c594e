//! Simulated respondents and target models.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid persona file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("persona id '{0}' cannot be used as a directory name")]
    InvalidId(String),
    #[error("duplicate persona id '{0}'")]
    DuplicateId(String),
    #[error("model id must not be empty")]
    EmptyModelId,
    #[error("model id '{0}' cannot be used as a directory name")]
    InvalidModelId(String),
    #[error("models '{first}' and '{second}' both map to directory '{dir_name}'")]
    DirNameCollision {
        first: String,
        second: String,
        dir_name: String,
    },
}

// =============================================================================
// Persona
// =============================================================================

/// A simulated respondent. `content` is used verbatim as the system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl Persona {
    pub fn new(id: impl Into<String>, content: Option<String>) -> Result<Self, PersonaError> {
        let persona = Self {
            id: id.into(),
            content,
        };
        persona.validate()?;
        Ok(persona)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PersonaError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PersonaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let persona: Persona = serde_json::from_str(&raw).map_err(|source| PersonaError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        persona.validate()?;
        Ok(persona)
    }

    /// Load every persona file in `dir`, skipping hidden entries, sorted by
    /// file name.
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Vec<Self>, PersonaError> {
        let dir = dir.as_ref();
        let io_err = |source| PersonaError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(true, |n| n.starts_with('.'));
            if !hidden && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut seen = HashSet::new();
        let mut personas = Vec::with_capacity(paths.len());
        for path in paths {
            let persona = Self::from_path(&path)?;
            if !seen.insert(persona.id.clone()) {
                return Err(PersonaError::DuplicateId(persona.id));
            }
            personas.push(persona);
        }
        Ok(personas)
    }

    /// The system prompt sent with every question, if any.
    pub fn system_prompt(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.trim().is_empty())
    }

    fn validate(&self) -> Result<(), PersonaError> {
        let id = self.id.as_str();
        let bad = id.trim().is_empty()
            || id == "."
            || id == ".."
            || id.contains(['/', '\\', '\0']);
        if bad {
            return Err(PersonaError::InvalidId(self.id.clone()));
        }
        Ok(())
    }
}

// =============================================================================
// Model descriptor
// =============================================================================

/// A target model. `name` and `dir_name` are derived once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    id: String,
    name: String,
    dir_name: String,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>) -> Result<Self, PersonaError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(PersonaError::EmptyModelId);
        }
        let dir_name = dir_name_for(&id);
        if dir_name == "." || dir_name == ".." || dir_name.contains('\0') {
            return Err(PersonaError::InvalidModelId(id));
        }
        let name = model_name(&id).to_string();
        Ok(Self { id, name, dir_name })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Report label, see [`model_name`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem-safe partition name: the full id with separators replaced
    /// ("meta-llama/llama-3.1-8b-instruct" → "meta-llama-llama-3.1-8b-instruct").
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }
}

/// Build descriptors for every id, rejecting ids that share a partition.
pub fn model_descriptors<I, S>(ids: I) -> Result<Vec<ModelDescriptor>, PersonaError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let models = ids
        .into_iter()
        .map(ModelDescriptor::new)
        .collect::<Result<Vec<_>, _>>()?;
    ensure_distinct_partitions(&models)?;
    Ok(models)
}

pub fn ensure_distinct_partitions(models: &[ModelDescriptor]) -> Result<(), PersonaError> {
    let mut by_dir: HashMap<&str, &str> = HashMap::new();
    for model in models {
        if let Some(first) = by_dir.insert(model.dir_name(), model.id()) {
            return Err(PersonaError::DirNameCollision {
                first: first.to_string(),
                second: model.id.clone(),
                dir_name: model.dir_name.clone(),
            });
        }
    }
    Ok(())
}

/// Report label for a model id. Local tags lose their version suffix
/// ("llama3.1:8b-instruct-q6_K" → "llama3.1:8b"); vendor-prefixed ids such as
/// "meta-llama/llama-3.1-8b-instruct" are kept whole.
pub fn model_name(id: &str) -> &str {
    if id.contains('/') {
        return id;
    }
    id.split('-').next().unwrap_or(id)
}

fn dir_name_for(id: &str) -> String {
    id.trim()
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '-',
            c if c.is_whitespace() => '-',
            c => c,
        })
        .collect()
}
