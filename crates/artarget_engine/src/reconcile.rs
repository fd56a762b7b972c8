//! Server-side compilation: start it, then poll the durable status until it settles.

use std::sync::Arc;
use std::time::Duration;

use artarget_core::JobError;
use artarget_logging::{pipeline_debug, pipeline_info, pipeline_warn};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::executor::NetworkAwareExecutor;
use crate::http::{self, ApiErrorBody};
use crate::settings::ReconcileSettings;
use crate::store::{JobMetadataStore, ProcessingStatus, StatusRecord};
use crate::token::OperationToken;

pub const ALREADY_PROCESSING: &str = "ALREADY_PROCESSING";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickoffOutcome {
    Started,
    /// Another invocation owns the job; its result shows up through polling.
    AlreadyProcessing,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub status: ProcessingStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub ready: bool,
}

#[async_trait::async_trait]
pub trait RemoteCompileApi: Send + Sync {
    async fn start(&self, job_id: &str) -> Result<KickoffOutcome, JobError>;
    async fn status(&self, job_id: &str) -> Result<RemoteStatus, JobError>;
}

/// `POST {base}/compile {jobId}` and `GET {base}/status?jobId=`.
pub struct HttpCompileApi {
    client: reqwest::Client,
    base: url::Url,
    auth_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KickoffRequest<'a> {
    job_id: &'a str,
}

impl HttpCompileApi {
    pub fn new(base: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self, JobError> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base: http::parse_base(base)?,
            auth_token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl RemoteCompileApi for HttpCompileApi {
    async fn start(&self, job_id: &str) -> Result<KickoffOutcome, JobError> {
        let url = http::join_segments(&self.base, &["compile"])?;
        let body = serde_json::to_vec(&KickoffRequest { job_id })
            .map_err(|err| JobError::validation(err.to_string()))?;
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(http::map_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(KickoffOutcome::Started);
        }
        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            let payload = ApiErrorBody::parse(&text);
            if payload.code.as_deref().map_or(true, |code| code == ALREADY_PROCESSING) {
                return Ok(KickoffOutcome::AlreadyProcessing);
            }
        }
        Err(http::status_error(status, &text))
    }

    async fn status(&self, job_id: &str) -> Result<RemoteStatus, JobError> {
        let mut url = http::join_segments(&self.base, &["status"])?;
        url.query_pairs_mut().append_pair("jobId", job_id);
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(http::map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(http::map_reqwest_error)?;
        if !status.is_success() {
            return Err(http::status_error(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|err| JobError::network(format!("malformed status payload: {err}")))
    }
}

/// Final outcome of a reconciled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub kickoff: KickoffOutcome,
    pub status: RemoteStatus,
}

pub struct StatusReconciler {
    api: Arc<dyn RemoteCompileApi>,
    executor: NetworkAwareExecutor,
    settings: ReconcileSettings,
    metadata: Option<Arc<dyn JobMetadataStore>>,
}

impl StatusReconciler {
    pub fn new(
        api: Arc<dyn RemoteCompileApi>,
        executor: NetworkAwareExecutor,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            api,
            executor,
            settings,
            metadata: None,
        }
    }

    /// Mirrors every settled status into `metadata`.
    pub fn with_metadata(mut self, metadata: Arc<dyn JobMetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Asks the backend to compile `job_id`. A job some other caller already
    /// started is reported as [`KickoffOutcome::AlreadyProcessing`], not as an error.
    pub async fn kickoff(
        &self,
        job_id: &str,
        token: &OperationToken,
    ) -> Result<KickoffOutcome, JobError> {
        let outcome = self
            .executor
            .run(
                |_| self.api.start(job_id),
                self.settings.kickoff_attempts,
                token,
            )
            .await?;
        pipeline_info!("{} kickoff: {:?}", job_id, outcome);
        Ok(outcome)
    }

    /// Reads the status until it is terminal or the read budget runs out.
    ///
    /// A reported `error` or `needs_better_image` is a normal return; running
    /// out of reads is a `Timeout`.
    pub async fn poll(&self, job_id: &str, token: &OperationToken) -> Result<RemoteStatus, JobError> {
        let reads = self.settings.poll_attempts.max(1);
        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        for read in 1..=reads {
            token.check()?;
            match token.run(self.api.status(job_id)).await {
                Ok(status) if status.status.is_terminal() => {
                    pipeline_info!("{} settled as {:?} after {} reads", job_id, status.status, read);
                    return Ok(status);
                }
                Ok(status) => {
                    pipeline_debug!("{} still {:?} (read {}/{})", job_id, status.status, read, reads);
                }
                Err(err) if err.kind.is_aborted() => return Err(err),
                Err(err) => {
                    pipeline_warn!("{} status read {} failed, ignoring: {}", job_id, read, err);
                }
            }
            if read < reads {
                token.sleep(interval).await?;
            }
        }
        Err(JobError::timeout(format!(
            "{job_id} did not settle after {reads} status reads"
        )))
    }

    /// Kickoff followed by polling, with the outcome mirrored into the metadata store.
    pub async fn reconcile(&self, job_id: &str, token: &OperationToken) -> Result<Reconciled, JobError> {
        let kickoff = self.kickoff(job_id, token).await?;
        let status = match self.poll(job_id, token).await {
            Ok(status) => status,
            Err(err) if kickoff == KickoffOutcome::AlreadyProcessing && !err.kind.is_aborted() => {
                // The run belongs to another caller.
                return Err(JobError::new(
                    err.kind,
                    format!("{} (job was already processing elsewhere)", err.message),
                ));
            }
            Err(err) => return Err(err),
        };
        self.mirror(job_id, &status).await;
        Ok(Reconciled { kickoff, status })
    }

    async fn mirror(&self, job_id: &str, status: &RemoteStatus) {
        let Some(metadata) = &self.metadata else {
            return;
        };
        let record = match status.status {
            ProcessingStatus::Ready | ProcessingStatus::Processing => StatusRecord::new(status.status),
            other => StatusRecord::failed(
                other,
                status
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "compilation failed".to_string()),
            ),
        };
        if let Err(err) = metadata.set_status(job_id, record).await {
            pipeline_warn!("{} status not mirrored: {}", job_id, err);
        }
    }
}
