//! Push notifications for job lifecycle events.
//!
//! The orchestrator calls these hooks synchronously from the worker that
//! drives the job, so implementations should return quickly.

use std::time::Duration;

use crate::state_machine::{FailureRecord, Job, Stage};

/// Callbacks fired as a job moves through the pipeline. Every method has a
/// no-op default, so implementors only override what they care about.
pub trait JobObserver: Send + Sync {
    fn on_job_queued(&self, _job: &Job) {}

    fn on_stage_started(&self, _job_id: &str, _stage: Stage, _attempt: u32) {}

    /// `completed` succeeded; `next` is about to be dispatched.
    fn on_stage_advanced(&self, _job_id: &str, _completed: Stage, _next: Stage, _progress: u8) {}

    fn on_retry_scheduled(
        &self,
        _job_id: &str,
        _stage: Stage,
        _next_attempt: u32,
        _delay: Duration,
        _reason: &str,
    ) {
    }

    fn on_job_completed(&self, _job: &Job) {}

    fn on_job_failed(&self, _job: &Job, _failure: &FailureRecord) {}
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl JobObserver for NoopObserver {}
