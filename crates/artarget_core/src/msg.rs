use crate::{JobError, JobId, Ticket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// The source file for an artifact became available.
    Trigger { job_id: JobId },
    /// The compute module is ready for this attempt.
    ModuleLoaded { ticket: Ticket },
    /// Stage-local progress (0..=100) for whatever stage the ticket's job is in.
    StageProgress { ticket: Ticket, percent: u8 },
    /// Extraction produced an artifact.
    CompileFinished { ticket: Ticket },
    /// The artifact is durably stored at `url`.
    UploadFinished { ticket: Ticket, url: String },
    /// The running stage failed.
    StageFailed { ticket: Ticket, error: JobError },
    /// The backoff scheduled after a failed attempt has elapsed.
    RetryElapsed { ticket: Ticket },
    /// The owner switched from one artifact to another.
    ArtifactChanged { previous: JobId, next: JobId },
    /// Caller-initiated abort of a job.
    Cancel { job_id: JobId },
    /// Manual restart of a job that ended in `Error`.
    Retry { job_id: JobId },
    /// The owner is going away; abort everything.
    Shutdown,
    NoOp,
}
