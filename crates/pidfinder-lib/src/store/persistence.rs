//! CSV persistence for the known set
//!
//! The whole set is rewritten on every save. Writes go to a temporary
//! sibling file which is synced and renamed over the destination, so a
//! reader never sees a partially written table.

use super::KnownSet;
use crate::models::{ContainerObservation, WorkloadIdentity};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, info, warn};

/// Default file name inside the result directory
pub const DEFAULT_FILE_NAME: &str = "pid_pods.csv";

/// Column order of the persisted table
pub const COLUMNS: [&str; 12] = [
    "Pid",
    "Created",
    "StartedAt",
    "Image",
    "PodName",
    "ContainerName",
    "PodNamespace",
    "App",
    "NextflowRunName",
    "NextflowProcessName",
    "NextflowSessionID",
    "NextflowTaskName",
];

/// Columns absent from files written by the earlier table layout
const LATER_COLUMNS: [&str; 2] = ["StartedAt", "Image"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("{path} exists but is not a regular file")]
    NotAFile { path: PathBuf },

    #[error("failed to decode record table: {0}")]
    Decode(#[source] csv::Error),

    #[error("failed to encode record table: {0}")]
    Encode(#[source] csv::Error),
}

/// One row of the persisted table
#[derive(Debug, Serialize, Deserialize)]
struct ObservationRow {
    #[serde(rename = "Pid")]
    pid: i64,
    #[serde(rename = "Created")]
    created: String,
    #[serde(rename = "StartedAt", default)]
    started_at: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "PodName")]
    pod_name: String,
    #[serde(rename = "ContainerName")]
    container_name: String,
    #[serde(rename = "PodNamespace")]
    pod_namespace: String,
    #[serde(rename = "App")]
    app: String,
    #[serde(rename = "NextflowRunName")]
    run_name: String,
    #[serde(rename = "NextflowProcessName")]
    process_name: String,
    #[serde(rename = "NextflowSessionID")]
    session_id: String,
    #[serde(rename = "NextflowTaskName")]
    task_name: String,
}

impl From<&ContainerObservation> for ObservationRow {
    fn from(obs: &ContainerObservation) -> Self {
        let id = &obs.identity;
        Self {
            pid: obs.pid,
            created: obs.created_at.clone(),
            started_at: obs.started_at.clone(),
            image: obs.image.clone(),
            pod_name: id.pod_name.clone(),
            container_name: id.container_name.clone(),
            pod_namespace: id.pod_namespace.clone(),
            app: id.app_label.clone(),
            run_name: id.run_name.clone(),
            process_name: id.process_name.clone(),
            session_id: id.session_id.clone(),
            task_name: id.task_name.clone(),
        }
    }
}

impl From<ObservationRow> for ContainerObservation {
    fn from(row: ObservationRow) -> Self {
        Self {
            pid: row.pid,
            created_at: row.created,
            started_at: row.started_at,
            image: row.image,
            identity: WorkloadIdentity {
                pod_name: row.pod_name,
                container_name: row.container_name,
                pod_namespace: row.pod_namespace,
                app_label: row.app,
                run_name: row.run_name,
                process_name: row.process_name,
                session_id: row.session_id,
                task_name: row.task_name,
            },
        }
    }
}

/// Result of decoding a persisted table
#[derive(Debug)]
pub struct Decoded {
    pub observations: Vec<ContainerObservation>,
    /// True when the header lacks columns added after the first layout
    pub legacy_layout: bool,
}

/// Encode observations as a CSV table with a header row
pub fn encode<'a, I>(observations: I) -> Result<Vec<u8>, StoreError>
where
    I: IntoIterator<Item = &'a ContainerObservation>,
{
    // The header is written by hand so an empty set still produces one
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    writer.write_record(COLUMNS).map_err(StoreError::Encode)?;
    for obs in observations {
        writer
            .serialize(ObservationRow::from(obs))
            .map_err(StoreError::Encode)?;
    }

    writer
        .into_inner()
        .map_err(|e| StoreError::Encode(e.into_error().into()))
}

/// Decode a CSV table produced by [`encode`] or by the earlier layout
pub fn decode(bytes: &[u8]) -> Result<Decoded, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);

    let headers = reader.headers().map_err(StoreError::Decode)?.clone();
    let legacy_layout = !headers.is_empty()
        && LATER_COLUMNS
            .iter()
            .any(|column| !headers.iter().any(|h| h == *column));

    let observations = reader
        .deserialize::<ObservationRow>()
        .map(|row| row.map(ContainerObservation::from))
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::Decode)?;

    Ok(Decoded {
        observations,
        legacy_layout,
    })
}

/// Write `bytes` to `path` through a synced temporary file and a rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;

    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)
}

/// Retry policy for saves
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first failure
    pub retries: usize,
    /// Delay before the first retry, doubled for each further one
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Default::default()
        }
    }

    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.retries)
    }
}

/// Full-rewrite CSV store for a [`KnownSet`]
#[derive(Debug, Clone)]
pub struct CsvStore {
    path: PathBuf,
    retry: RetryPolicy,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted set, or an empty set when no file exists yet
    pub fn load(&self) -> Result<KnownSet, StoreError> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No previous record file, starting empty");
                return Ok(KnownSet::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if !metadata.is_file() {
            return Err(StoreError::NotAFile {
                path: self.path.clone(),
            });
        }

        let bytes = fs::read(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;

        let decoded = decode(&bytes)?;
        if decoded.legacy_layout {
            warn!(
                path = %self.path.display(),
                "Record file uses the earlier column layout; StartedAt and Image will be empty for existing rows and the file is rewritten in the current layout on the next save"
            );
        }

        let set: KnownSet = decoded.observations.into_iter().collect();
        info!(path = %self.path.display(), records = set.len(), "Loaded record file");
        Ok(set)
    }

    /// Replace the persisted file with the full contents of `set`
    pub fn save(&self, set: &KnownSet) -> Result<(), StoreError> {
        let bytes = encode(set.iter())?;
        write_atomic(&self.path, &bytes).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), records = set.len(), "Record file written");
        Ok(())
    }

    /// [`CsvStore::save`] with bounded exponential backoff between attempts
    pub async fn save_with_retry(&self, set: &KnownSet) -> Result<(), StoreError> {
        let mut attempt = 0usize;

        Retry::spawn(self.retry.strategy(), move || {
            attempt += 1;
            let current = attempt;
            async move {
                self.save(set).map_err(|e| {
                    warn!(attempt = current, error = %e, "Failed to save record file");
                    e
                })
            }
        })
        .await
    }
}
