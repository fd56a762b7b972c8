use std::sync::Arc;

use artarget_core::{JobId, JobPhase, Notice};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Everything the engine reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress {
        job_id: JobId,
        phase: JobPhase,
        progress: f32,
    },
    Notice(Notice),
}

/// Receives stage-local progress in `0..=100`.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8);
}

impl<F> ProgressSink for F
where
    F: Fn(u8) + Send + Sync,
{
    fn report(&self, percent: u8) {
        self(percent)
    }
}

/// Sink for callers that don't care about progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreProgress;

impl ProgressSink for IgnoreProgress {
    fn report(&self, _percent: u8) {}
}

pub type SharedProgress = Arc<dyn ProgressSink>;

#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn send(&self, event: EngineEvent) {
        // The owner may have dropped the receiver; events are advisory.
        let _ = self.tx.send(event);
    }
}

/// The image a job compiles, as handed over by the trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub name: String,
    pub bytes: Bytes,
}

impl SourceImage {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Percentage of `done` out of `total`, clamped to 100. An empty total counts as done.
pub(crate) fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_down_and_clamps() {
        assert_eq!(percent_of(0, 10), 0);
        assert_eq!(percent_of(5, 10), 50);
        assert_eq!(percent_of(9, 10), 90);
        assert_eq!(percent_of(20, 10), 100);
        assert_eq!(percent_of(0, 0), 100);
    }
}
