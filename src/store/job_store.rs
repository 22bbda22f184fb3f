use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::write_atomic;
use crate::error::StoreError;
use crate::scoring::QualityReport;
use crate::state_machine::{Job, JobOutcome, JobStatus, NewJob, Stage, StageAttempt};

/// Durable record of every job. Single source of truth for recovery.
///
/// Implementations reject writes to terminal jobs and stage-pointer
/// regressions, so a buggy caller cannot corrupt the job log.
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Create a job, or return the existing one when the idempotency key is
    /// already known. Callers compare ids to tell the two apart.
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError>;

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Job>, StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError>;

    async fn append_stage_attempt(
        &self,
        job_id: &str,
        attempt: StageAttempt,
    ) -> Result<Job, StoreError>;

    /// Move the stage pointer (forward only, one stage at a time) and
    /// record progress. The job status follows the stage.
    async fn update_job_stage(
        &self,
        job_id: &str,
        stage: Stage,
        progress: u8,
    ) -> Result<Job, StoreError>;

    /// Flag the job for cancellation. Terminal jobs are returned untouched.
    async fn request_cancel(&self, job_id: &str) -> Result<Job, StoreError>;

    async fn finalize(
        &self,
        job_id: &str,
        outcome: JobOutcome,
        quality: Option<QualityReport>,
    ) -> Result<Job, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn list_non_terminal_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.list_jobs().await?;
        Ok(jobs.into_iter().filter(|j| !j.is_terminal()).collect())
    }
}

/// Job records plus the idempotency index, with the transition rules both
/// store flavours share.
#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<String, Job>,
    keys: HashMap<String, String>,
}

impl JobTable {
    fn insert_loaded(&mut self, job: Job) {
        self.keys.insert(job.idempotency_key.clone(), job.id.clone());
        self.jobs.insert(job.id.clone(), job);
    }

    fn create(&mut self, new_job: NewJob) -> (Job, bool) {
        if let Some(existing) = self
            .keys
            .get(&new_job.idempotency_key)
            .and_then(|id| self.jobs.get(id))
        {
            return (existing.clone(), false);
        }
        let job = Job::new(new_job);
        self.insert_loaded(job.clone());
        (job, true)
    }

    fn find_by_key(&self, key: &str) -> Option<Job> {
        self.keys.get(key).and_then(|id| self.jobs.get(id)).cloned()
    }

    fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        self.jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    fn get_mutable(&mut self, job_id: &str) -> Result<&mut Job, StoreError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        if job.is_terminal() {
            return Err(StoreError::Terminal(job_id.to_string()));
        }
        Ok(job)
    }

    fn append_attempt(&mut self, job_id: &str, attempt: StageAttempt) -> Result<Job, StoreError> {
        let job = self.get_mutable(job_id)?;
        if attempt.stage != job.stage {
            return Err(StoreError::InvalidTransition {
                job_id: job_id.to_string(),
                detail: format!(
                    "attempt for {} while the job is at {}",
                    attempt.stage, job.stage
                ),
            });
        }
        job.attempts.push(attempt);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn update_stage(&mut self, job_id: &str, stage: Stage, progress: u8) -> Result<Job, StoreError> {
        let job = self.get_mutable(job_id)?;
        let invalid = |detail: String| StoreError::InvalidTransition {
            job_id: job_id.to_string(),
            detail,
        };

        let current = job
            .pipeline
            .position(job.stage)
            .ok_or_else(|| invalid(format!("{} is not in the job's pipeline", job.stage)))?;
        let target = job
            .pipeline
            .position(stage)
            .ok_or_else(|| invalid(format!("{stage} is not in the job's pipeline")))?;

        if target < current {
            return Err(invalid(format!("cannot move from {} back to {stage}", job.stage)));
        }
        if target > current + 1 {
            return Err(invalid(format!("cannot skip from {} to {stage}", job.stage)));
        }
        if progress < job.progress || progress > 100 {
            return Err(invalid(format!(
                "progress cannot go from {} to {progress}",
                job.progress
            )));
        }

        job.stage = stage;
        job.status = stage.status();
        job.progress = progress;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn request_cancel(&mut self, job_id: &str) -> Result<(Job, bool), StoreError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        if job.is_terminal() || job.cancel_requested {
            return Ok((job.clone(), false));
        }
        job.cancel_requested = true;
        job.updated_at = Utc::now();
        Ok((job.clone(), true))
    }

    fn finalize(
        &mut self,
        job_id: &str,
        outcome: JobOutcome,
        quality: Option<QualityReport>,
    ) -> Result<Job, StoreError> {
        let job = self.get_mutable(job_id)?;
        match &outcome {
            JobOutcome::Succeeded { .. } => {
                job.status = JobStatus::Completed;
                job.progress = 100;
            }
            JobOutcome::Failed(_) => job.status = JobStatus::Failed,
        }
        job.outcome = Some(outcome);
        job.quality = quality;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }
}

/// In-memory job store. State is lost with the process.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: Mutex<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut JobTable) -> T) -> T {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut table)
    }
}

#[async_trait]
impl JobStateStore for MemoryJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        Ok(self.with_table(|t| t.create(new_job).0))
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.with_table(|t| t.find_by_key(idempotency_key)))
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.with_table(|t| t.get(job_id))
    }

    async fn append_stage_attempt(
        &self,
        job_id: &str,
        attempt: StageAttempt,
    ) -> Result<Job, StoreError> {
        self.with_table(|t| t.append_attempt(job_id, attempt))
    }

    async fn update_job_stage(
        &self,
        job_id: &str,
        stage: Stage,
        progress: u8,
    ) -> Result<Job, StoreError> {
        self.with_table(|t| t.update_stage(job_id, stage, progress))
    }

    async fn request_cancel(&self, job_id: &str) -> Result<Job, StoreError> {
        self.with_table(|t| t.request_cancel(job_id).map(|(job, _)| job))
    }

    async fn finalize(
        &self,
        job_id: &str,
        outcome: JobOutcome,
        quality: Option<QualityReport>,
    ) -> Result<Job, StoreError> {
        self.with_table(|t| t.finalize(job_id, outcome, quality))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.with_table(|t| t.list()))
    }
}

/// Filesystem job store: one JSON document per job under `dir`, replaced
/// atomically on every write.
#[derive(Debug)]
pub struct FileJobStore {
    dir: PathBuf,
    table: tokio::sync::Mutex<JobTable>,
}

impl FileJobStore {
    /// Open (or create) the store and load every job found in `dir`.
    /// Unreadable documents are skipped with a warning.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut table = JobTable::default();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice::<Job>(&bytes).map_err(StoreError::from));
            match parsed {
                Ok(job) => table.insert_loaded(job),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job record"),
            }
        }
        debug!(dir = %dir.display(), jobs = table.jobs.len(), "job store opened");

        Ok(Self {
            dir,
            table: tokio::sync::Mutex::new(table),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn persist(&self, job: &Job) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(job)?;
        let dir = self.dir.clone();
        let file_name = format!("{}.json", job.id);
        tokio::task::spawn_blocking(move || write_atomic(&dir, &file_name, &bytes))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Apply a mutation and persist its result before releasing the lock.
    /// The in-memory copy is rolled back if the write fails.
    async fn mutate(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut JobTable) -> Result<Job, StoreError>,
    ) -> Result<Job, StoreError> {
        let mut table = self.table.lock().await;
        let before = table.jobs.get(job_id).cloned();
        let job = f(&mut table)?;
        if let Err(e) = self.persist(&job).await {
            if let Some(before) = before {
                table.jobs.insert(job_id.to_string(), before);
            }
            return Err(e);
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStateStore for FileJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let mut table = self.table.lock().await;
        let key = new_job.idempotency_key.clone();
        let (job, created) = table.create(new_job);
        if created && let Err(e) = self.persist(&job).await {
            table.jobs.remove(&job.id);
            table.keys.remove(&key);
            return Err(e);
        }
        Ok(job)
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.table.lock().await.find_by_key(idempotency_key))
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.table.lock().await.get(job_id)
    }

    async fn append_stage_attempt(
        &self,
        job_id: &str,
        attempt: StageAttempt,
    ) -> Result<Job, StoreError> {
        self.mutate(job_id, |t| t.append_attempt(job_id, attempt)).await
    }

    async fn update_job_stage(
        &self,
        job_id: &str,
        stage: Stage,
        progress: u8,
    ) -> Result<Job, StoreError> {
        self.mutate(job_id, |t| t.update_stage(job_id, stage, progress))
            .await
    }

    async fn request_cancel(&self, job_id: &str) -> Result<Job, StoreError> {
        let mut table = self.table.lock().await;
        let before = table.jobs.get(job_id).cloned();
        let (job, changed) = table.request_cancel(job_id)?;
        if changed && let Err(e) = self.persist(&job).await {
            if let Some(before) = before {
                table.jobs.insert(job_id.to_string(), before);
            }
            return Err(e);
        }
        Ok(job)
    }

    async fn finalize(
        &self,
        job_id: &str,
        outcome: JobOutcome,
        quality: Option<QualityReport>,
    ) -> Result<Job, StoreError> {
        self.mutate(job_id, |t| t.finalize(job_id, outcome, quality))
            .await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.lock().await.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureClass, StageError};
    use crate::state_machine::{FailureRecord, Metadata, StageSequence};
    use crate::store::ArtifactRef;

    fn new_job(id: &str, key: &str) -> NewJob {
        NewJob {
            id: id.into(),
            idempotency_key: key.into(),
            owner: None,
            source_name: "doc.txt".into(),
            input: ArtifactRef::new(id, "input", "doc.txt", 1, "d", 1),
            pipeline: StageSequence::default(),
        }
    }

    fn success(stage: Stage) -> StageAttempt {
        StageAttempt::succeeded(stage, 1, Utc::now(), Metadata::new(), vec![])
    }

    async fn exercise_idempotency(store: &dyn JobStateStore) {
        let first = store.create_job(new_job("a", "key")).await.unwrap();
        let second = store.create_job(new_job("b", "key")).await.unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(second.id, "a");
        assert_eq!(store.list_jobs().await.unwrap().len(), 1);
        assert_eq!(store.find_by_key("key").await.unwrap().unwrap().id, "a");
        assert!(store.find_by_key("other").await.unwrap().is_none());
    }

    async fn exercise_transitions(store: &dyn JobStateStore) {
        store.create_job(new_job("j", "k")).await.unwrap();

        let job = store.update_job_stage("j", Stage::Convert, 0).await.unwrap();
        assert_eq!(job.status, JobStatus::Converting);

        store.append_stage_attempt("j", success(Stage::Convert)).await.unwrap();
        let job = store.update_job_stage("j", Stage::Extract, 20).await.unwrap();
        assert_eq!(job.status, JobStatus::Extracting);
        assert_eq!(job.progress, 20);

        // No regression, no skipping, no attempts for another stage.
        assert!(matches!(
            store.update_job_stage("j", Stage::Convert, 20).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.update_job_stage("j", Stage::Generate, 60).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.append_stage_attempt("j", success(Stage::Structure)).await,
            Err(StoreError::InvalidTransition { .. })
        ));

        let failure = FailureRecord {
            stage: Stage::Extract,
            class: FailureClass::Permanent,
            reason: "bad".into(),
            attempts: 1,
        };
        store
            .append_stage_attempt(
                "j",
                StageAttempt::failed(Stage::Extract, 1, Utc::now(), &StageError::permanent("bad")),
            )
            .await
            .unwrap();
        let job = store
            .finalize("j", JobOutcome::Failed(failure), None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        // Terminal jobs are frozen.
        assert!(matches!(
            store.append_stage_attempt("j", success(Stage::Extract)).await,
            Err(StoreError::Terminal(_))
        ));
        let cancelled = store.request_cancel("j").await.unwrap();
        assert!(!cancelled.cancel_requested);
        assert!(store.list_non_terminal_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_is_idempotent_on_key() {
        exercise_idempotency(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_enforces_transitions() {
        exercise_transitions(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_is_idempotent_on_key() {
        let dir = tempfile::tempdir().unwrap();
        exercise_idempotency(&FileJobStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn file_store_enforces_transitions() {
        let dir = tempfile::tempdir().unwrap();
        exercise_transitions(&FileJobStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileJobStore::open(dir.path()).unwrap();
            store.create_job(new_job("persisted", "pk")).await.unwrap();
            store.update_job_stage("persisted", Stage::Convert, 0).await.unwrap();
            store
                .append_stage_attempt("persisted", success(Stage::Convert))
                .await
                .unwrap();
            store.request_cancel("persisted").await.unwrap();
        }

        let reopened = FileJobStore::open(dir.path()).unwrap();
        let job = reopened.get_job("persisted").await.unwrap();
        assert_eq!(job.attempts.len(), 1);
        assert!(job.cancel_requested);
        assert_eq!(job.resume_stage(), Some(Stage::Extract));
        assert_eq!(reopened.list_non_terminal_jobs().await.unwrap().len(), 1);
        // Idempotency index is rebuilt from disk.
        assert_eq!(
            reopened.create_job(new_job("dup", "pk")).await.unwrap().id,
            "persisted"
        );
    }

    #[tokio::test]
    async fn file_store_skips_garbage_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let store = FileJobStore::open(dir.path()).unwrap();
        assert!(store.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_job_is_reported() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.get_job("nope").await,
            Err(StoreError::JobNotFound(_))
        ));
    }
}
