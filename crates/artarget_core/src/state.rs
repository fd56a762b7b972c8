use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use crate::progress;
use crate::view_model::{BoardView, JobView};
use crate::{JobError, RetryPolicy};

/// Stable identifier of the artifact a job compiles; equals the owning record's id.
pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JobPhase {
    #[default]
    Idle,
    Loading,
    Compiling,
    Uploading,
    Completed,
    Error,
    Retrying,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Error)
    }

    /// Phases in which work is either running or scheduled.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobPhase::Loading | JobPhase::Compiling | JobPhase::Uploading | JobPhase::Retrying
        )
    }
}

/// Tag captured when an operation starts. Results carrying a ticket that no
/// longer matches the current job are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub job_id: JobId,
    pub generation: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub phase: JobPhase,
    pub attempt: u32,
    pub max_attempts: u32,
    pub progress: f32,
    pub last_error: Option<JobError>,
    generation: u64,
    reported: bool,
}

impl Job {
    fn new(id: JobId, generation: u64, max_attempts: u32) -> Self {
        Self {
            id,
            phase: JobPhase::Loading,
            attempt: 1,
            max_attempts,
            progress: progress::floor(JobPhase::Loading),
            last_error: None,
            generation,
            reported: false,
        }
    }

    pub fn ticket(&self) -> Ticket {
        Ticket {
            job_id: self.id.clone(),
            generation: self.generation,
            attempt: self.attempt,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn matches(&self, ticket: &Ticket) -> bool {
        self.id == ticket.job_id
            && self.generation == ticket.generation
            && self.attempt == ticket.attempt
    }

    pub(crate) fn enter(&mut self, phase: JobPhase) {
        self.phase = phase;
        if let Some(range) = progress::stage_range(phase) {
            self.progress = range.floor;
        }
    }

    /// Raises progress; never lowers it within a stage. Returns true when it moved.
    pub(crate) fn advance_progress(&mut self, value: f32) -> bool {
        if value > self.progress {
            self.progress = value;
            true
        } else {
            false
        }
    }

    /// Marks the terminal notification as sent. Returns false if it already was.
    pub(crate) fn take_report(&mut self) -> bool {
        !std::mem::replace(&mut self.reported, true)
    }

    fn view(&self) -> JobView {
        JobView {
            job_id: self.id.clone(),
            phase: self.phase,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            progress: self.progress,
            last_error: self.last_error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// All jobs known to one orchestrator, plus the per-artifact trigger latch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobBoard {
    jobs: BTreeMap<JobId, Job>,
    triggered: BTreeSet<JobId>,
    next_generation: u64,
    policy: RetryPolicy,
    dirty: bool,
}

impl JobBoard {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn phase_of(&self, job_id: &str) -> JobPhase {
        self.jobs.get(job_id).map(|j| j.phase).unwrap_or_default()
    }

    pub fn is_triggered(&self, job_id: &str) -> bool {
        self.triggered.contains(job_id)
    }

    pub fn view(&self) -> BoardView {
        let jobs: Vec<JobView> = self.jobs.values().map(Job::view).collect();
        let active = self.jobs.values().filter(|j| j.phase.is_active()).count();
        BoardView {
            jobs,
            active,
            dirty: self.dirty,
        }
    }

    /// Returns whether anything changed since the last call, clearing the flag.
    pub fn consume_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Installs a fresh job for `job_id`, replacing whatever was there.
    pub(crate) fn start_job(&mut self, job_id: &str) -> &mut Job {
        self.next_generation += 1;
        let job = Job::new(job_id.to_string(), self.next_generation, self.policy.max_attempts);
        self.triggered.insert(job_id.to_string());
        self.dirty = true;
        match self.jobs.entry(job_id.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(job);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(job),
        }
    }

    /// The current job for the ticket, if the ticket is still current and the
    /// job sits in one of `phases`.
    pub(crate) fn current_mut(&mut self, ticket: &Ticket, phases: &[JobPhase]) -> Option<&mut Job> {
        self.jobs
            .get_mut(&ticket.job_id)
            .filter(|job| job.matches(ticket) && phases.contains(&job.phase))
    }

    pub(crate) fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(job_id)
    }

    pub(crate) fn remove_job(&mut self, job_id: &str) -> Option<Job> {
        self.jobs.remove(job_id)
    }

    pub(crate) fn release_latch(&mut self, job_id: &str) {
        self.triggered.remove(job_id);
    }

    pub(crate) fn jobs_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    pub(crate) fn clear_latches(&mut self) {
        self.triggered.clear();
    }

    /// Gives a job a new generation so that results tagged with its old ticket are dropped.
    pub(crate) fn regenerate(&mut self, job_id: &str) {
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.generation = generation;
            job.reported = false;
        }
    }
}
