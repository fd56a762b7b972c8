use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use artarget_core::{
    update, AbortReason, BoardView, Effect, JobBoard, JobError, JobId, JobPhase, Msg, Notice,
    RetryPolicy, Ticket,
};
use artarget_logging::{pipeline_debug, pipeline_error, pipeline_info, pipeline_warn};
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::compute::{ComputeLoader, ComputeModule, ModuleCache};
use crate::filename::artifact_object_path;
use crate::settings::ValidationSettings;
use crate::store::{JobMetadataStore, ProcessingStatus, StatusRecord};
use crate::token::{CancellationTokenManager, OperationToken, TokenOptions};
use crate::types::{EngineEvent, EventSender, SharedProgress, SourceImage};
use crate::upload::{UploadFile, UploadOptions, UploadPipeline};
use crate::validate::validate_image;

const ARTIFACT_CONTENT_TYPE: &str = "application/octet-stream";

/// Collaborators the engine drives.
pub struct EngineParts {
    pub loader: Arc<dyn ComputeLoader>,
    pub uploads: Arc<UploadPipeline>,
    pub metadata: Option<Arc<dyn JobMetadataStore>>,
    pub tokens: CancellationTokenManager,
    pub policy: RetryPolicy,
    pub validation: ValidationSettings,
}

/// Scratch state of the attempt currently running for a job.
struct AttemptContext {
    ticket: Ticket,
    token: OperationToken,
    module: Option<Arc<dyn ComputeModule>>,
    artifact: Option<Bytes>,
}

struct Inner {
    board: Mutex<JobBoard>,
    attempts: Mutex<HashMap<JobId, AttemptContext>>,
    sources: Mutex<HashMap<JobId, SourceImage>>,
    modules: ModuleCache,
    uploads: Arc<UploadPipeline>,
    metadata: Option<Arc<dyn JobMetadataStore>>,
    tokens: CancellationTokenManager,
    validation: ValidationSettings,
    events: EventSender,
    runtime: Handle,
}

/// Runs compile jobs: feeds messages through the job state machine and
/// carries out the effects it asks for.
///
/// Must be created inside a tokio runtime. Clones drive the same jobs.
#[derive(Clone)]
pub struct CompileEngine {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CompileEngine {
    pub fn new(parts: EngineParts) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = EventSender::channel();
        let inner = Inner {
            board: Mutex::new(JobBoard::new(parts.policy)),
            attempts: Mutex::new(HashMap::new()),
            sources: Mutex::new(HashMap::new()),
            modules: ModuleCache::new(parts.loader),
            uploads: parts.uploads,
            metadata: parts.metadata,
            tokens: parts.tokens,
            validation: parts.validation,
            events,
            runtime: Handle::current(),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// The source image for `job_id` is available; starts a job unless one
    /// already ran or is running for it.
    pub fn trigger(&self, job_id: impl Into<JobId>, source: SourceImage) {
        let job_id = job_id.into();
        if lock(&self.inner.board).is_triggered(&job_id) {
            pipeline_debug!("{} already triggered; ignoring", job_id);
            return;
        }
        lock(&self.inner.sources).insert(job_id.clone(), source);
        self.dispatch(Msg::Trigger { job_id });
    }

    /// The owner moved from one artifact to another.
    pub fn change_artifact(&self, previous: impl Into<JobId>, next: impl Into<JobId>) {
        let previous = previous.into();
        let next = next.into();
        if previous != next {
            lock(&self.inner.sources).remove(&previous);
        }
        self.dispatch(Msg::ArtifactChanged { previous, next });
    }

    pub fn cancel(&self, job_id: impl Into<JobId>) {
        self.dispatch(Msg::Cancel {
            job_id: job_id.into(),
        });
    }

    /// Restarts a job that ended in `Error`, with a fresh attempt budget.
    pub fn retry(&self, job_id: impl Into<JobId>) {
        self.dispatch(Msg::Retry {
            job_id: job_id.into(),
        });
    }

    /// Aborts everything in flight. Jobs return to idle and no further
    /// results are accepted for them.
    pub fn shutdown(&self) {
        self.dispatch(Msg::Shutdown);
        lock(&self.inner.sources).clear();
        self.inner.uploads.shutdown();
    }

    pub fn snapshot(&self) -> BoardView {
        lock(&self.inner.board).view()
    }

    pub fn phase(&self, job_id: &str) -> JobPhase {
        lock(&self.inner.board).phase_of(job_id)
    }

    fn dispatch(&self, msg: Msg) {
        let effects = {
            let mut board = lock(&self.inner.board);
            let current = std::mem::take(&mut *board);
            let (next, effects) = update(current, msg);
            *board = next;
            effects
        };
        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&self, effect: Effect) {
        match effect {
            Effect::BeginAttempt { ticket } => self.begin_attempt(ticket),
            Effect::Compile { ticket } => self.compile(ticket),
            Effect::Upload { ticket } => self.upload(ticket),
            Effect::ScheduleRetry { ticket, delay } => {
                let Some(token) = self.attempt_token(&ticket) else {
                    return;
                };
                let engine = self.clone();
                self.inner.runtime.spawn(async move {
                    if token.sleep(delay).await.is_ok() {
                        engine.dispatch(Msg::RetryElapsed { ticket });
                    }
                });
            }
            Effect::Abort { job_id, reason } => {
                lock(&self.inner.attempts).remove(&job_id);
                if self.inner.tokens.abort_with(&job_id, reason) {
                    pipeline_info!("{} aborted ({:?})", job_id, reason);
                }
            }
            Effect::AbortAll => {
                lock(&self.inner.attempts).clear();
                self.inner.tokens.abort_all();
                pipeline_info!("all jobs aborted");
            }
            Effect::Release { ticket } => {
                let mut attempts = lock(&self.inner.attempts);
                if attempts
                    .get(&ticket.job_id)
                    .is_some_and(|ctx| ctx.ticket == ticket)
                {
                    if let Some(ctx) = attempts.remove(&ticket.job_id) {
                        self.inner.tokens.release(&ctx.token);
                    }
                }
            }
            Effect::Progress {
                job_id,
                phase,
                progress,
            } => {
                self.inner.events.send(EngineEvent::Progress {
                    job_id,
                    phase,
                    progress,
                });
            }
            Effect::Notify(notice) => self.notify(notice),
        }
    }

    fn begin_attempt(&self, ticket: Ticket) {
        let token = self
            .inner
            .tokens
            .create(ticket.job_id.clone(), TokenOptions::default());
        lock(&self.inner.attempts).insert(
            ticket.job_id.clone(),
            AttemptContext {
                ticket: ticket.clone(),
                token: token.clone(),
                module: None,
                artifact: None,
            },
        );
        pipeline_info!("{} attempt {} loading", ticket.job_id, ticket.attempt);

        let source = lock(&self.inner.sources).get(&ticket.job_id).cloned();
        let engine = self.clone();
        self.inner.runtime.spawn(async move {
            let result: Result<Arc<dyn ComputeModule>, JobError> = async {
                let source = source
                    .ok_or_else(|| JobError::validation("no source image for job"))?;
                validate_image(&source.name, &source.bytes, &engine.inner.validation)?;
                token.run(engine.inner.modules.get()).await
            }
            .await;
            match result {
                Ok(module) => {
                    engine.with_attempt(&ticket, |ctx| ctx.module = Some(module));
                    engine.dispatch(Msg::ModuleLoaded { ticket });
                }
                Err(error) => engine.dispatch(Msg::StageFailed { ticket, error }),
            }
        });
    }

    fn compile(&self, ticket: Ticket) {
        let Some((token, module)) = self.attempt_parts(&ticket, |ctx| ctx.module.clone()) else {
            return;
        };
        let source = lock(&self.inner.sources).get(&ticket.job_id).cloned();
        pipeline_info!("{} attempt {} compiling", ticket.job_id, ticket.attempt);

        let engine = self.clone();
        self.inner.runtime.spawn(async move {
            let progress = engine.stage_progress(&ticket);
            let result = match source {
                Some(source) => token.run(module.compile(&source, progress, &token)).await,
                None => Err(JobError::validation("no source image for job")),
            };
            match result {
                Ok(artifact) => {
                    pipeline_debug!("{} produced {} bytes", ticket.job_id, artifact.len());
                    engine.with_attempt(&ticket, |ctx| ctx.artifact = Some(artifact));
                    engine.dispatch(Msg::CompileFinished { ticket });
                }
                Err(error) => engine.dispatch(Msg::StageFailed { ticket, error }),
            }
        });
    }

    fn upload(&self, ticket: Ticket) {
        let Some((token, artifact)) = self.attempt_parts(&ticket, |ctx| ctx.artifact.clone())
        else {
            return;
        };
        pipeline_info!("{} attempt {} uploading", ticket.job_id, ticket.attempt);

        let engine = self.clone();
        self.inner.runtime.spawn(async move {
            let uploads = Arc::clone(&engine.inner.uploads);
            let destination =
                artifact_object_path(&uploads.settings().bucket_prefix, &ticket.job_id, &artifact);
            let file = UploadFile::new(format!("{}.mind", ticket.job_id), artifact)
                .with_content_type(ARTIFACT_CONTENT_TYPE);
            let options = UploadOptions {
                skip_validation: true,
                parent: Some(token),
                ..UploadOptions::default()
            };
            let progress = engine.stage_progress(&ticket);
            match uploads
                .upload_file(file, &destination, options, progress)
                .await
            {
                Ok(url) => engine.dispatch(Msg::UploadFinished { ticket, url }),
                Err(error) => engine.dispatch(Msg::StageFailed { ticket, error }),
            }
        });
    }

    fn notify(&self, notice: Notice) {
        match &notice {
            Notice::Retrying {
                job_id,
                next_attempt,
                delay,
                error,
            } => pipeline_warn!(
                "{} failed ({}); retrying, attempt {} in {:?}",
                job_id,
                error,
                next_attempt,
                delay
            ),
            Notice::Completed {
                job_id,
                url,
                attempt,
            } => {
                pipeline_info!("{} completed on attempt {}: {}", job_id, attempt, url);
                lock(&self.inner.sources).remove(job_id);
                self.record_status(job_id, StatusRecord::ready(url.clone()));
            }
            Notice::Failed {
                job_id,
                error,
                attempt,
            } => {
                pipeline_error!("{} failed on attempt {}: {}", job_id, attempt, error);
                self.record_status(
                    job_id,
                    StatusRecord::failed(ProcessingStatus::Error, error.user_message()),
                );
            }
        }
        self.inner.events.send(EngineEvent::Notice(notice));
    }

    fn record_status(&self, job_id: &str, record: StatusRecord) {
        let Some(metadata) = self.inner.metadata.clone() else {
            return;
        };
        let job_id = job_id.to_string();
        self.inner.runtime.spawn(async move {
            if let Err(err) = metadata.set_status(&job_id, record).await {
                pipeline_warn!("{} status not recorded: {}", job_id, err);
            }
        });
    }

    /// Forwards stage-local progress into the state machine, tagged with the ticket.
    fn stage_progress(&self, ticket: &Ticket) -> SharedProgress {
        let engine = self.clone();
        let ticket = ticket.clone();
        Arc::new(move |percent: u8| {
            engine.dispatch(Msg::StageProgress {
                ticket: ticket.clone(),
                percent,
            })
        })
    }

    fn attempt_token(&self, ticket: &Ticket) -> Option<OperationToken> {
        lock(&self.inner.attempts)
            .get(&ticket.job_id)
            .filter(|ctx| ctx.ticket == *ticket)
            .map(|ctx| ctx.token.clone())
    }

    /// Token plus one piece of attempt scratch. A missing piece fails the stage.
    fn attempt_parts<T>(
        &self,
        ticket: &Ticket,
        pick: impl FnOnce(&AttemptContext) -> Option<T>,
    ) -> Option<(OperationToken, T)> {
        let picked = lock(&self.inner.attempts)
            .get(&ticket.job_id)
            .filter(|ctx| ctx.ticket == *ticket)
            .map(|ctx| (ctx.token.clone(), pick(ctx)));
        match picked {
            Some((token, Some(value))) => Some((token, value)),
            Some((_, None)) => {
                pipeline_error!("{} has no scratch data for its stage", ticket.job_id);
                self.dispatch(Msg::StageFailed {
                    ticket: ticket.clone(),
                    error: JobError::compute("stage input missing"),
                });
                None
            }
            None => None,
        }
    }

    fn with_attempt(&self, ticket: &Ticket, apply: impl FnOnce(&mut AttemptContext)) {
        if let Some(ctx) = lock(&self.inner.attempts)
            .get_mut(&ticket.job_id)
            .filter(|ctx| ctx.ticket == *ticket)
        {
            apply(ctx);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let attempts = self.attempts.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (job_id, _) in attempts.drain() {
            pipeline_debug!("{} still in flight at engine drop", job_id);
            self.tokens.abort_with(&job_id, AbortReason::Interrupted);
        }
    }
}
