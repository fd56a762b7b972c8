use crate::effect::Notice;
use crate::error::Disposition;
use crate::{progress, AbortReason, Effect, Job, JobBoard, JobError, JobPhase, Msg, Ticket};

const RUNNING: &[JobPhase] = &[JobPhase::Loading, JobPhase::Compiling, JobPhase::Uploading];

/// Pure update function: applies a message to the board and returns any effects.
pub fn update(mut board: JobBoard, msg: Msg) -> (JobBoard, Vec<Effect>) {
    let effects = match msg {
        Msg::Trigger { job_id } => {
            if board.is_triggered(&job_id) || board.phase_of(&job_id).is_active() {
                return (board, Vec::new());
            }
            let job = board.start_job(&job_id);
            vec![
                Effect::BeginAttempt {
                    ticket: job.ticket(),
                },
                progress_effect(job),
            ]
        }
        Msg::ModuleLoaded { ticket } => {
            enter_next(&mut board, &ticket, JobPhase::Loading, JobPhase::Compiling, |t| {
                Effect::Compile { ticket: t }
            })
        }
        Msg::CompileFinished { ticket } => {
            enter_next(&mut board, &ticket, JobPhase::Compiling, JobPhase::Uploading, |t| {
                Effect::Upload { ticket: t }
            })
        }
        Msg::StageProgress { ticket, percent } => match board.current_mut(&ticket, RUNNING) {
            Some(job) => {
                let value = progress::remap(job.phase, percent);
                if job.advance_progress(value) {
                    let effect = progress_effect(job);
                    board.mark_dirty();
                    vec![effect]
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        },
        Msg::UploadFinished { ticket, url } => {
            match board.current_mut(&ticket, &[JobPhase::Uploading]) {
                Some(job) => {
                    job.enter(JobPhase::Completed);
                    let mut effects = vec![Effect::Release { ticket }, progress_effect(job)];
                    if job.take_report() {
                        effects.push(Effect::Notify(Notice::Completed {
                            job_id: job.id.clone(),
                            url,
                            attempt: job.attempt,
                        }));
                    }
                    board.mark_dirty();
                    effects
                }
                None => Vec::new(),
            }
        }
        Msg::StageFailed { ticket, error } => fail_stage(&mut board, ticket, error),
        Msg::RetryElapsed { ticket } => {
            match board.current_mut(&ticket, &[JobPhase::Retrying]) {
                Some(job) => {
                    job.attempt += 1;
                    job.enter(JobPhase::Loading);
                    let effects = vec![
                        Effect::BeginAttempt {
                            ticket: job.ticket(),
                        },
                        progress_effect(job),
                    ];
                    board.mark_dirty();
                    effects
                }
                None => Vec::new(),
            }
        }
        Msg::ArtifactChanged { previous, next } => {
            if previous == next {
                return (board, Vec::new());
            }
            let mut effects = Vec::new();
            if let Some(old) = board.remove_job(&previous) {
                if old.phase.is_active() {
                    effects.push(Effect::Abort {
                        job_id: old.id.clone(),
                        reason: AbortReason::Interrupted,
                    });
                }
                effects.push(Effect::Release {
                    ticket: old.ticket(),
                });
                board.mark_dirty();
            }
            board.release_latch(&previous);
            board.release_latch(&next);
            effects
        }
        Msg::Cancel { job_id } => {
            if !board.phase_of(&job_id).is_active() {
                return (board, Vec::new());
            }
            let mut effects = vec![Effect::Abort {
                job_id: job_id.clone(),
                reason: AbortReason::Cancelled,
            }];
            if let Some(old) = board.job(&job_id).map(Job::ticket) {
                effects.push(Effect::Release { ticket: old });
            }
            board.regenerate(&job_id);
            board.release_latch(&job_id);
            if let Some(job) = board.job_mut(&job_id) {
                job.phase = JobPhase::Idle;
                job.progress = 0.0;
                effects.push(progress_effect(job));
            }
            board.mark_dirty();
            effects
        }
        Msg::Retry { job_id } => {
            if board.phase_of(&job_id) != JobPhase::Error {
                return (board, Vec::new());
            }
            let last_error = board.job(&job_id).and_then(|j| j.last_error.clone());
            let job = board.start_job(&job_id);
            job.last_error = last_error;
            vec![
                Effect::BeginAttempt {
                    ticket: job.ticket(),
                },
                progress_effect(job),
            ]
        }
        Msg::Shutdown => {
            let mut changed = false;
            let mut idle = Vec::new();
            for job in board.jobs_mut() {
                if job.phase.is_active() {
                    job.phase = JobPhase::Idle;
                    job.progress = 0.0;
                    idle.push(job.id.clone());
                    changed = true;
                }
            }
            for job_id in &idle {
                board.regenerate(job_id);
            }
            board.clear_latches();
            if changed {
                board.mark_dirty();
            }
            vec![Effect::AbortAll]
        }
        Msg::NoOp => Vec::new(),
    };

    (board, effects)
}

fn enter_next(
    board: &mut JobBoard,
    ticket: &Ticket,
    from: JobPhase,
    to: JobPhase,
    next: impl FnOnce(Ticket) -> Effect,
) -> Vec<Effect> {
    match board.current_mut(ticket, &[from]) {
        Some(job) => {
            job.enter(to);
            let effects = vec![next(job.ticket()), progress_effect(job)];
            board.mark_dirty();
            effects
        }
        None => Vec::new(),
    }
}

fn fail_stage(board: &mut JobBoard, ticket: Ticket, error: JobError) -> Vec<Effect> {
    let policy = board.policy();
    let Some(job) = board.current_mut(&ticket, RUNNING) else {
        return Vec::new();
    };

    let effects = match error.kind.disposition() {
        Disposition::Abandon => {
            // Aborts never consume an attempt and never surface as failures.
            let job_id = job.id.clone();
            job.phase = JobPhase::Idle;
            job.progress = 0.0;
            let effects = vec![Effect::Release { ticket }, progress_effect(job)];
            board.release_latch(&job_id);
            effects
        }
        Disposition::Retry if policy.has_attempts_left(job.attempt) => {
            let delay = policy.delay_after(job.attempt);
            job.phase = JobPhase::Retrying;
            job.last_error = Some(error.clone());
            vec![
                Effect::ScheduleRetry { ticket, delay },
                Effect::Notify(Notice::Retrying {
                    job_id: job.id.clone(),
                    next_attempt: job.attempt + 1,
                    delay,
                    error,
                }),
            ]
        }
        Disposition::Retry | Disposition::Fail => {
            job.phase = JobPhase::Error;
            job.last_error = Some(error.clone());
            let mut effects = vec![Effect::Release { ticket }];
            if job.take_report() {
                effects.push(Effect::Notify(Notice::Failed {
                    job_id: job.id.clone(),
                    error,
                    attempt: job.attempt,
                }));
            }
            effects
        }
    };
    board.mark_dirty();
    effects
}

fn progress_effect(job: &Job) -> Effect {
    Effect::Progress {
        job_id: job.id.clone(),
        phase: job.phase,
        progress: job.progress,
    }
}
