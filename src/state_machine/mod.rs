mod job;
mod state;

pub use job::{
    AttemptOutcome, AuditRecord, FailureRecord, Job, JobOutcome, Metadata, NewJob, RetryConfig,
    StageAttempt,
};
pub use state::{JobStatus, Stage, StageSequence, StateMachine, Transition};
