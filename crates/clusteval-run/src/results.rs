use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{CompletedRunnables, ParameterPoint, RunDefinition, RunStatus, Runnable};

const DEFINITION_FILE: &str = "run.json";
const RUNNABLES_DIR: &str = "runnables";
const ARTIFACT_EXT: &str = "json";
const COMPLETE_EXT: &str = "complete";

#[derive(Debug, Error)]
pub enum ResultStoreError {
    #[error("run result `{0}` does not exist")]
    NotFound(ResultId),
    #[error("`{0}` is not a valid result identifier")]
    InvalidId(String),
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ResultStoreError + '_ {
    move |source| ResultStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Name of a persisted run result directory, e.g. `03_14_2024-09_26_53_tc_vs_kmeans`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultId(String);

impl ResultId {
    pub fn parse(id: &str) -> Result<Self, ResultStoreError> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !id.starts_with('.');
        if valid {
            Ok(Self(id.to_string()))
        } else {
            Err(ResultStoreError::InvalidId(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a runnable left behind, complete or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnableArtifact {
    pub key: String,
    pub program: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub parameters: ParameterPoint,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<String>,
    /// Quality measure name → value.
    #[serde(default)]
    pub quality: BTreeMap<String, String>,
    /// Post-processor name → output.
    #[serde(default)]
    pub postprocessed: BTreeMap<String, String>,
    #[serde(default)]
    pub exceptions: Vec<String>,
}

impl RunnableArtifact {
    pub fn from_runnable(runnable: &Runnable) -> Self {
        let identity = runnable.identity();
        Self {
            key: identity.key(),
            program: identity.program.clone(),
            data: identity.data.clone(),
            result: identity.result.clone(),
            parameters: identity.parameters.clone(),
            status: runnable.status(),
            started_at: runnable.started_at(),
            finished_at: runnable.finished_at(),
            output: None,
            quality: runnable.quality(),
            postprocessed: BTreeMap::new(),
            exceptions: runnable.exceptions(),
        }
    }
}

/// Summary of one persisted result, for listing resumable results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub id: ResultId,
    pub run: String,
    pub completed: usize,
}

/// Directory of persisted run results.
///
/// ```text
/// <root>/<MM_dd_yyyy-HH_mm_ss>_<run>/
///     run.json
///     runnables/<key>.json
///     runnables/<key>.complete
/// ```
///
/// Artifacts are written to a temporary file and renamed into place, so a
/// reader sees either the previous or the new artifact. Only the `.complete`
/// marker makes a runnable count as FINISHED when resuming.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, id: &ResultId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn exists(&self, id: &ResultId) -> bool {
        self.path(id).join(DEFINITION_FILE).is_file()
    }

    /// Creates a fresh result directory for `definition`, stamped with the
    /// current local time.
    pub fn create(&self, definition: &RunDefinition) -> Result<ResultId, ResultStoreError> {
        self.create_at(definition, Local::now())
    }

    pub fn create_at(
        &self,
        definition: &RunDefinition,
        at: DateTime<Local>,
    ) -> Result<ResultId, ResultStoreError> {
        let base = format!("{}_{}", at.format("%m_%d_%Y-%H_%M_%S"), definition.name);
        fs::create_dir_all(&self.root).map_err(io_error(&self.root))?;

        let mut suffix = 0;
        let id = loop {
            let candidate = if suffix == 0 {
                base.clone()
            } else {
                format!("{base}_{suffix}")
            };
            let id = ResultId::parse(&candidate)?;
            let dir = self.path(&id);
            match fs::create_dir(&dir) {
                Ok(()) => break id,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => return Err(io_error(&dir)(err)),
            }
        };

        let dir = self.path(&id);
        let runnables = dir.join(RUNNABLES_DIR);
        fs::create_dir_all(&runnables).map_err(io_error(&runnables))?;
        write_json(&dir.join(DEFINITION_FILE), definition)?;
        info!(result = %id, run = %definition.name, "created run result");
        Ok(id)
    }

    pub fn load_definition(&self, id: &ResultId) -> Result<RunDefinition, ResultStoreError> {
        if !self.exists(id) {
            return Err(ResultStoreError::NotFound(id.clone()));
        }
        read_json(&self.path(id).join(DEFINITION_FILE))
    }

    pub fn write_artifact(
        &self,
        id: &ResultId,
        artifact: &RunnableArtifact,
    ) -> Result<(), ResultStoreError> {
        let path = self.runnable_file(id, &artifact.key, ARTIFACT_EXT)?;
        write_json(&path, artifact)
    }

    pub fn read_artifact(
        &self,
        id: &ResultId,
        key: &str,
    ) -> Result<Option<RunnableArtifact>, ResultStoreError> {
        let path = self.runnable_file(id, key, ARTIFACT_EXT)?;
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn mark_complete(&self, id: &ResultId, key: &str) -> Result<(), ResultStoreError> {
        let path = self.runnable_file(id, key, COMPLETE_EXT)?;
        fs::write(&path, b"").map_err(io_error(&path))?;
        debug!(result = %id, key, "runnable complete");
        Ok(())
    }

    pub fn is_complete(&self, id: &ResultId, key: &str) -> bool {
        self.runnable_file(id, key, COMPLETE_EXT)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Keys of every runnable with a completion marker.
    pub fn completed_keys(&self, id: &ResultId) -> Result<HashSet<String>, ResultStoreError> {
        if !self.exists(id) {
            return Err(ResultStoreError::NotFound(id.clone()));
        }
        let dir = self.path(id).join(RUNNABLES_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(err) => return Err(io_error(&dir)(err)),
        };
        let mut keys = HashSet::new();
        for entry in entries {
            let path = entry.map_err(io_error(&dir))?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(COMPLETE_EXT) {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    keys.insert(stem.to_string());
                }
            }
        }
        Ok(keys)
    }

    /// Completed runnables with the quality their artifact recorded.
    pub fn completed(&self, id: &ResultId) -> Result<CompletedRunnables, ResultStoreError> {
        let mut completed = CompletedRunnables::new();
        for key in self.completed_keys(id)? {
            let quality = self
                .read_artifact(id, &key)?
                .map(|artifact| artifact.quality)
                .unwrap_or_default();
            completed.insert(key, quality);
        }
        Ok(completed)
    }

    /// Every persisted result, oldest directory name first.
    pub fn list(&self) -> Result<Vec<ResultSummary>, ResultStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&self.root)(err)),
        };
        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&self.root))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = ResultId::parse(&name) else {
                continue;
            };
            if !self.exists(&id) {
                continue;
            }
            match self.load_definition(&id) {
                Ok(definition) => summaries.push(ResultSummary {
                    completed: self.completed_keys(&id)?.len(),
                    run: definition.name,
                    id,
                }),
                Err(err) => debug!(result = %id, %err, "skipping unreadable result"),
            }
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    fn runnable_file(
        &self,
        id: &ResultId,
        key: &str,
        ext: &str,
    ) -> Result<PathBuf, ResultStoreError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(ResultStoreError::InvalidId(key.to_string()));
        }
        Ok(self
            .path(id)
            .join(RUNNABLES_DIR)
            .join(format!("{key}.{ext}")))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ResultStoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| ResultStoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    fs::write(&partial, bytes).map_err(io_error(&partial))?;
    fs::rename(&partial, path).map_err(io_error(path))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ResultStoreError> {
    let bytes = fs::read(path).map_err(io_error(path))?;
    serde_json::from_slice(&bytes).map_err(|source| ResultStoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}
