//! Adapters around the opaque feature-extraction step.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use artarget_core::JobError;
use artarget_logging::{pipeline_debug, pipeline_info, pipeline_warn};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::token::OperationToken;
use crate::types::{SharedProgress, SourceImage};

/// A loaded compute module: image in, artifact bytes out, progress `0..=100` on the side.
#[async_trait::async_trait]
pub trait ComputeModule: Send + Sync {
    async fn compile(
        &self,
        image: &SourceImage,
        progress: SharedProgress,
        token: &OperationToken,
    ) -> Result<Bytes, JobError>;
}

/// Produces compute modules. Loading may be expensive (think: fetching and
/// initializing a large binary), so modules that can serve several
/// compilations are cached by [`ModuleCache`].
#[async_trait::async_trait]
pub trait ComputeLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn ComputeModule>, JobError>;

    /// Whether a loaded module may be reused across attempts.
    fn reentrant(&self) -> bool {
        true
    }
}

pub struct ModuleCache {
    loader: Arc<dyn ComputeLoader>,
    cached: Mutex<Option<Arc<dyn ComputeModule>>>,
}

impl ModuleCache {
    pub fn new(loader: Arc<dyn ComputeLoader>) -> Self {
        Self {
            loader,
            cached: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn ComputeModule>, JobError> {
        if !self.loader.reentrant() {
            return self.loader.load().await;
        }
        let mut cached = self.cached.lock().await;
        if let Some(module) = cached.as_ref() {
            return Ok(Arc::clone(module));
        }
        let module = self.loader.load().await?;
        pipeline_info!("compute module loaded");
        *cached = Some(Arc::clone(&module));
        Ok(module)
    }
}

/// Loader that hands out an already constructed module.
pub struct PreloadedModule(pub Arc<dyn ComputeModule>);

#[async_trait::async_trait]
impl ComputeLoader for PreloadedModule {
    async fn load(&self) -> Result<Arc<dyn ComputeModule>, JobError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Handle given to a synchronous extractor for reporting and cancellation checks.
pub struct ExtractControl {
    token: OperationToken,
    progress: SharedProgress,
}

impl ExtractControl {
    /// Reports progress, failing with the abort error once the job was cancelled.
    pub fn report(&self, percent: u8) -> Result<(), JobError> {
        self.token.check()?;
        self.progress.report(percent.min(100));
        Ok(())
    }

    pub fn check(&self) -> Result<(), JobError> {
        self.token.check()
    }
}

/// CPU-bound feature extraction, run off the async threads.
pub trait FeatureExtractor: Send + Sync + 'static {
    fn extract(&self, image: &[u8], control: &ExtractControl) -> Result<Vec<u8>, JobError>;
}

/// Runs a [`FeatureExtractor`] on the blocking pool, one live call per job.
pub struct BlockingCompute<E> {
    extractor: Arc<E>,
}

impl<E: FeatureExtractor> BlockingCompute<E> {
    pub fn new(extractor: E) -> Self {
        Self {
            extractor: Arc::new(extractor),
        }
    }
}

#[async_trait::async_trait]
impl<E: FeatureExtractor> ComputeModule for BlockingCompute<E> {
    async fn compile(
        &self,
        image: &SourceImage,
        progress: SharedProgress,
        token: &OperationToken,
    ) -> Result<Bytes, JobError> {
        token.check()?;
        let extractor = Arc::clone(&self.extractor);
        let bytes = image.bytes.clone();
        let control = ExtractControl {
            token: token.clone(),
            progress,
        };
        let handle = tokio::task::spawn_blocking(move || extractor.extract(&bytes, &control));
        // On abort the worker notices at its next report() and winds down on its own.
        let joined = token
            .run(async {
                handle
                    .await
                    .map_err(|err| JobError::compute(format!("extraction worker failed: {err}")))
            })
            .await?;
        joined.map(Bytes::from)
    }
}

/// Runs an external compiler: `program [args..] <image> <output>`.
///
/// The process reports progress as `progress <n>` lines on stdout and is
/// killed when the token is aborted.
#[derive(Debug, Clone)]
pub struct CommandCompute {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandCompute {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

pub(crate) fn parse_progress_line(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix("progress")?;
    let value: f32 = rest.trim().trim_end_matches('%').parse().ok()?;
    Some(value.clamp(0.0, 100.0) as u8)
}

#[async_trait::async_trait]
impl ComputeModule for CommandCompute {
    async fn compile(
        &self,
        image: &SourceImage,
        progress: SharedProgress,
        token: &OperationToken,
    ) -> Result<Bytes, JobError> {
        token.check()?;
        let scratch = tempfile::tempdir()
            .map_err(|err| JobError::compute(format!("scratch dir: {err}")))?;
        let extension = std::path::Path::new(&image.name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("img");
        let input = scratch.path().join(format!("input.{extension}"));
        let output = scratch.path().join("output.mind");
        tokio::fs::write(&input, &image.bytes)
            .await
            .map_err(|err| JobError::compute(format!("write input: {err}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&input)
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                JobError::compute(format!("failed to start {}: {err}", self.program.display()))
            })?;
        pipeline_debug!("{} started {}", token.id(), self.program.display());

        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text).await;
                text
            })
        });
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::compute("compiler stdout unavailable"))?;

        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|err| JobError::compute(format!("read compiler output: {err}")))?
            {
                if let Some(percent) = parse_progress_line(&line) {
                    progress.report(percent);
                }
            }
            child
                .wait()
                .await
                .map_err(|err| JobError::compute(format!("wait for compiler: {err}")))
        };

        let status = match token.run(run).await {
            Ok(status) => status,
            Err(err) => {
                // The child is dropped on return, which kills it.
                if err.kind.is_aborted() {
                    pipeline_info!("{} compiler killed: {}", token.id(), err);
                }
                return Err(err);
            }
        };

        if !status.success() {
            let detail = match stderr {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };
            pipeline_warn!("{} compiler exited with {}", token.id(), status);
            return Err(JobError::compute(format!(
                "compiler exited with {status}: {}",
                detail.trim()
            )));
        }

        let artifact = tokio::fs::read(&output)
            .await
            .map_err(|err| JobError::compute(format!("read artifact: {err}")))?;
        if artifact.is_empty() {
            return Err(JobError::compute("compiler produced an empty artifact"));
        }
        progress.report(100);
        Ok(Bytes::from(artifact))
    }
}
