use std::time::Duration;

use crate::{AbortReason, JobError, JobId, JobPhase, Ticket};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Acquire the job token and load the compute module.
    BeginAttempt { ticket: Ticket },
    /// Run extraction with the loaded module.
    Compile { ticket: Ticket },
    /// Store the produced artifact and record it.
    Upload { ticket: Ticket },
    /// Wait `delay` under the job token, then report `RetryElapsed`.
    ScheduleRetry { ticket: Ticket, delay: Duration },
    /// Abort whatever is in flight for the job.
    Abort { job_id: JobId, reason: AbortReason },
    AbortAll,
    /// The job reached a terminal or idle state; tear down its token and scratch data.
    Release { ticket: Ticket },
    Progress {
        job_id: JobId,
        phase: JobPhase,
        progress: f32,
    },
    Notify(Notice),
}

/// User-facing signals. Terminal notices fire once per job instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Retrying {
        job_id: JobId,
        next_attempt: u32,
        delay: Duration,
        error: JobError,
    },
    Completed {
        job_id: JobId,
        url: String,
        attempt: u32,
    },
    Failed {
        job_id: JobId,
        error: JobError,
        attempt: u32,
    },
}

impl Notice {
    pub fn job_id(&self) -> &str {
        match self {
            Notice::Retrying { job_id, .. }
            | Notice::Completed { job_id, .. }
            | Notice::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notice::Retrying { .. })
    }
}
