use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::write_atomic;
use crate::error::StoreError;

/// Address of one immutable artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub job_id: String,
    /// Producer label: `input` for the uploaded document, otherwise a stage label.
    pub stage: String,
    pub name: String,
    pub version: u32,
    /// Lowercase hex SHA-256 of the content.
    pub digest: String,
    pub size_bytes: u64,
}

impl ArtifactRef {
    pub fn new(
        job_id: impl Into<String>,
        stage: impl Into<String>,
        name: impl Into<String>,
        version: u32,
        digest: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            stage: stage.into(),
            name: name.into(),
            version,
            digest: digest.into(),
            size_bytes,
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}@v{}", self.job_id, self.stage, self.name, self.version)
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Content-addressed storage for stage artifacts.
///
/// `put` never overwrites: every write of the same (job, stage, name)
/// gets a fresh version. A successful `put` is durable before it returns.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(
        &self,
        job_id: &str,
        stage: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, StoreError>;

    /// Read an artifact back, verifying its digest.
    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError>;

    /// Remove a single version. Missing artifacts are not an error.
    async fn delete_artifact(&self, artifact: &ArtifactRef) -> Result<(), StoreError>;

    /// Remove everything stored for a job. Returns how many versions were removed.
    async fn delete_job(&self, job_id: &str) -> Result<usize, StoreError>;
}

fn validate_segment(segment: &str) -> Result<(), StoreError> {
    let bad = segment.is_empty()
        || segment.starts_with('.')
        || segment.contains(['/', '\\', '\0'])
        || segment.contains("..");
    if bad {
        return Err(StoreError::InvalidName(segment.to_string()));
    }
    Ok(())
}

fn verify(artifact: &ArtifactRef, bytes: &[u8]) -> Result<(), StoreError> {
    if content_digest(bytes) != artifact.digest {
        return Err(StoreError::Corrupted(artifact.to_string()));
    }
    Ok(())
}

type ArtifactKey = (String, String, u32);

/// In-memory artifact store.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    jobs: Mutex<HashMap<String, BTreeMap<ArtifactKey, Vec<u8>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of artifact versions currently held for `job_id`.
    pub fn count(&self, job_id: &str) -> usize {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).map_or(0, BTreeMap::len)
    }

    #[cfg(test)]
    pub(crate) fn overwrite_for_test(&self, artifact: &ArtifactRef, bytes: Vec<u8>) {
        let mut jobs = self.jobs.lock().unwrap();
        let key = (artifact.stage.clone(), artifact.name.clone(), artifact.version);
        jobs.entry(artifact.job_id.clone()).or_default().insert(key, bytes);
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        job_id: &str,
        stage: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, StoreError> {
        validate_segment(job_id)?;
        validate_segment(stage)?;
        validate_segment(name)?;

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let entries = jobs.entry(job_id.to_string()).or_default();
        let version = entries
            .keys()
            .filter(|(s, n, _)| s == stage && n == name)
            .map(|(_, _, v)| *v)
            .max()
            .unwrap_or(0)
            + 1;

        let artifact = ArtifactRef::new(
            job_id,
            stage,
            name,
            version,
            content_digest(&bytes),
            bytes.len() as u64,
        );
        entries.insert((stage.to_string(), name.to_string(), version), bytes);
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let key = (artifact.stage.clone(), artifact.name.clone(), artifact.version);
        let bytes = jobs
            .get(&artifact.job_id)
            .and_then(|entries| entries.get(&key))
            .cloned()
            .ok_or_else(|| StoreError::ArtifactNotFound(artifact.to_string()))?;
        verify(artifact, &bytes)?;
        Ok(bytes)
    }

    async fn delete_artifact(&self, artifact: &ArtifactRef) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = jobs.get_mut(&artifact.job_id) {
            entries.remove(&(artifact.stage.clone(), artifact.name.clone(), artifact.version));
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.remove(job_id).map_or(0, |entries| entries.len()))
    }
}

/// Filesystem artifact store.
///
/// Layout: `<root>/<job_id>/<stage>/<name>.v<version>`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, artifact: &ArtifactRef) -> PathBuf {
        self.root
            .join(&artifact.job_id)
            .join(&artifact.stage)
            .join(format!("{}.v{}", artifact.name, artifact.version))
    }
}

fn next_version(dir: &Path, name: &str) -> std::io::Result<u32> {
    let prefix = format!("{name}.v");
    let mut max = 0;
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                let file_name = entry?.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                if let Some(v) = file_name
                    .strip_prefix(&prefix)
                    .and_then(|s| s.parse::<u32>().ok())
                {
                    max = max.max(v);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(max + 1)
}

fn count_files(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            count += count_files(&entry.path())?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
        .map_err(StoreError::from)
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        job_id: &str,
        stage: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, StoreError> {
        validate_segment(job_id)?;
        validate_segment(stage)?;
        validate_segment(name)?;

        let dir = self.root.join(job_id).join(stage);
        let name_owned = name.to_string();
        let digest = content_digest(&bytes);
        let size = bytes.len() as u64;

        let version = run_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            let version = next_version(&dir, &name_owned)?;
            write_atomic(&dir, &format!("{name_owned}.v{version}"), &bytes)?;
            Ok(version)
        })
        .await?;

        debug!(job_id, stage, name, version, "artifact written");
        Ok(ArtifactRef::new(job_id, stage, name, version, digest, size))
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        let bytes = match tokio::fs::read(self.path_for(artifact)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ArtifactNotFound(artifact.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        verify(artifact, &bytes)?;
        Ok(bytes)
    }

    async fn delete_artifact(&self, artifact: &ArtifactRef) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(artifact)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_job(&self, job_id: &str) -> Result<usize, StoreError> {
        validate_segment(job_id)?;
        let dir = self.root.join(job_id);
        run_blocking(move || {
            if !dir.exists() {
                return Ok(0);
            }
            let count = count_files(&dir)?;
            std::fs::remove_dir_all(&dir)?;
            Ok(count)
        })
        .await
    }
}
