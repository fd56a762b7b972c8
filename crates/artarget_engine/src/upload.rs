//! Validated, cancellable transfers to durable storage.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use artarget_core::{FailureKind, JobError};
use artarget_logging::{pipeline_debug, pipeline_info, pipeline_warn};
use bytes::Bytes;

use crate::executor::NetworkAwareExecutor;
use crate::http::strip_query;
use crate::settings::{UploadSettings, ValidationSettings};
use crate::store::{ByteProgress, ObjectStore};
use crate::token::{CancellationTokenManager, OperationToken, TokenOptions};
use crate::types::{percent_of, SharedProgress};
use crate::validate::validate_image;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Error,
    Aborted,
}

impl UploadStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Error | UploadStatus::Aborted
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    pub file: String,
    pub destination: String,
    pub progress: u8,
    pub status: UploadStatus,
    pub error: Option<JobError>,
    pub url: Option<String>,
}

/// A file handed to the pipeline.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Bytes,
    /// Falls back to a guess from `name` when absent.
    pub content_type: Option<String>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    fn resolved_content_type(&self) -> String {
        self.content_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(&self.name)
                .first_raw()
                .unwrap_or("application/octet-stream")
                .to_string()
        })
    }
}

#[derive(Default, Clone)]
pub struct UploadOptions {
    pub timeout: Option<Duration>,
    pub skip_validation: bool,
    /// When set, the upload is also aborted if this token is.
    pub parent: Option<OperationToken>,
    pub max_retries: Option<u32>,
}

pub struct UploadPipeline {
    store: Arc<dyn ObjectStore>,
    executor: NetworkAwareExecutor,
    tokens: CancellationTokenManager,
    settings: UploadSettings,
    validation: ValidationSettings,
    tasks: Arc<Mutex<BTreeMap<String, UploadTask>>>,
}

pub fn upload_token_id(destination: &str) -> String {
    format!("upload:{destination}")
}

impl UploadPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        executor: NetworkAwareExecutor,
        tokens: CancellationTokenManager,
        settings: UploadSettings,
        validation: ValidationSettings,
    ) -> Self {
        Self {
            store,
            executor,
            tokens,
            settings,
            validation,
            tasks: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Stores `file` at `destination` and returns its stable URL.
    ///
    /// The task record for `destination` reflects the outcome afterwards, and
    /// the per-upload token is torn down on every path.
    pub async fn upload_file(
        &self,
        file: UploadFile,
        destination: &str,
        options: UploadOptions,
        progress: SharedProgress,
    ) -> Result<String, JobError> {
        self.put_task(UploadTask {
            file: file.name.clone(),
            destination: destination.to_string(),
            progress: 0,
            status: UploadStatus::Pending,
            error: None,
            url: None,
        });

        let result = self.transfer(&file, destination, &options, progress).await;
        match &result {
            Ok(url) => {
                pipeline_info!("uploaded {} to {}", file.name, url);
                self.update_task(destination, |task| {
                    task.status = UploadStatus::Completed;
                    task.progress = 100;
                    task.url = Some(url.clone());
                });
            }
            Err(err) => {
                let status = if err.kind.is_aborted() {
                    UploadStatus::Aborted
                } else {
                    UploadStatus::Error
                };
                pipeline_warn!("upload of {} to {} ended {:?}: {}", file.name, destination, status, err);
                self.update_task(destination, |task| {
                    task.status = status;
                    task.error = Some(err.clone());
                });
            }
        }
        result
    }

    async fn transfer(
        &self,
        file: &UploadFile,
        destination: &str,
        options: &UploadOptions,
        progress: SharedProgress,
    ) -> Result<String, JobError> {
        if !options.skip_validation {
            validate_image(&file.name, &file.bytes, &self.validation)?;
        }
        if !self.executor.monitor().is_online() {
            return Err(JobError::offline());
        }

        let size = file.bytes.len() as u64;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.settings.timeout_for(size));
        let token_id = upload_token_id(destination);
        let token = match &options.parent {
            Some(parent) => {
                self.tokens
                    .create_child(token_id, parent, TokenOptions::with_timeout(timeout))
            }
            None => self.tokens.create(token_id, TokenOptions::with_timeout(timeout)),
        };
        let _guard = TokenGuard {
            tokens: &self.tokens,
            token: &token,
        };
        pipeline_debug!("{} starting, {} bytes, timeout {:?}", token.id(), size, timeout);
        self.update_task(destination, |task| task.status = UploadStatus::Uploading);

        let content_type = file.resolved_content_type();
        let byte_progress = self.byte_progress(destination, size, progress);
        let ttl = Duration::from_secs(self.settings.signed_url_ttl_secs);
        let retries = options
            .max_retries
            .unwrap_or_else(|| self.executor.default_retries());

        let url = self
            .executor
            .run(
                |_| {
                    let store = Arc::clone(&self.store);
                    let data = file.bytes.clone();
                    let content_type = content_type.clone();
                    let byte_progress = Arc::clone(&byte_progress);
                    async move {
                        store
                            .upload(destination, data, &content_type, byte_progress)
                            .await?;
                        store.signed_url(destination, ttl).await
                    }
                },
                retries,
                &token,
            )
            .await
            .map_err(|err| refine_abort(err, &token))?;
        Ok(strip_query(&url))
    }

    fn byte_progress(&self, destination: &str, total: u64, sink: SharedProgress) -> ByteProgress {
        let tasks = Arc::clone(&self.tasks);
        let destination = destination.to_string();
        Arc::new(move |sent| {
            let percent = percent_of(sent, total);
            if let Some(task) = lock(&tasks).get_mut(&destination) {
                task.progress = percent;
            }
            sink.report(percent);
        })
    }

    /// Aborts the in-flight upload for `destination`, if any.
    pub fn abort(&self, destination: &str) -> bool {
        self.tokens.abort(&upload_token_id(destination))
    }

    pub fn task(&self, destination: &str) -> Option<UploadTask> {
        lock(&self.tasks).get(destination).cloned()
    }

    pub fn tasks(&self) -> Vec<UploadTask> {
        lock(&self.tasks).values().cloned().collect()
    }

    pub fn clear(&self, destination: &str) -> bool {
        lock(&self.tasks).remove(destination).is_some()
    }

    pub fn clear_finished(&self) {
        lock(&self.tasks).retain(|_, task| !task.status.is_finished());
    }

    /// Aborts every in-flight upload and forgets all tasks.
    pub fn shutdown(&self) {
        let destinations: Vec<String> = lock(&self.tasks).keys().cloned().collect();
        for destination in destinations {
            self.abort(&destination);
        }
        lock(&self.tasks).clear();
    }

    fn put_task(&self, task: UploadTask) {
        lock(&self.tasks).insert(task.destination.clone(), task);
    }

    fn update_task(&self, destination: &str, apply: impl FnOnce(&mut UploadTask)) {
        if let Some(task) = lock(&self.tasks).get_mut(destination) {
            apply(task);
        }
    }
}

fn lock(tasks: &Mutex<BTreeMap<String, UploadTask>>) -> MutexGuard<'_, BTreeMap<String, UploadTask>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A timed-out upload token surfaces as `Timeout`, whatever the transport said.
fn refine_abort(err: JobError, token: &OperationToken) -> JobError {
    match err.kind {
        FailureKind::Aborted(_) | FailureKind::Network if token.is_aborted() => token.abort_error(),
        _ => err,
    }
}

struct TokenGuard<'a> {
    tokens: &'a CancellationTokenManager,
    token: &'a OperationToken,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.tokens.release(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_falls_back_to_extension() {
        assert_eq!(
            UploadFile::new("a.png", Vec::new()).resolved_content_type(),
            "image/png"
        );
        assert_eq!(
            UploadFile::new("a.mind", Vec::new()).resolved_content_type(),
            "application/octet-stream"
        );
        assert_eq!(
            UploadFile::new("a.mind", Vec::new())
                .with_content_type("application/x-mind")
                .resolved_content_type(),
            "application/x-mind"
        );
    }

    #[test]
    fn finished_statuses() {
        assert!(!UploadStatus::Pending.is_finished());
        assert!(!UploadStatus::Uploading.is_finished());
        assert!(UploadStatus::Aborted.is_finished());
    }
}
