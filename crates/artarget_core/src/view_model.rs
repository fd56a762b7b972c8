use crate::{JobId, JobPhase};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoardView {
    pub jobs: Vec<JobView>,
    pub active: usize,
    pub dirty: bool,
}

impl BoardView {
    pub fn job(&self, job_id: &str) -> Option<&JobView> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub job_id: JobId,
    pub phase: JobPhase,
    pub attempt: u32,
    pub max_attempts: u32,
    pub progress: f32,
    pub last_error: Option<String>,
}

impl JobView {
    /// Progress as a whole percentage for display.
    pub fn percent(&self) -> u8 {
        (self.progress.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}
