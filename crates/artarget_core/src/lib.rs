//! Compile job core: pure state machine, error taxonomy and retry policy.
mod effect;
mod error;
mod msg;
mod progress;
mod retry;
mod state;
mod update;
mod view_model;

pub use effect::{Effect, Notice};
pub use error::{AbortReason, Disposition, FailureKind, JobError};
pub use msg::Msg;
pub use progress::{floor as stage_floor, remap as remap_progress, stage_range, StageRange};
pub use retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use state::{Job, JobBoard, JobId, JobPhase, Ticket};
pub use update::update;
pub use view_model::{BoardView, JobView};
