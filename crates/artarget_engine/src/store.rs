//! Remote collaborators: durable object storage and per-job metadata records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use artarget_core::JobError;
use artarget_logging::pipeline_debug;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Body, StatusCode};
use serde::{Deserialize, Serialize};

use crate::http;

/// Receives the running count of bytes handed to the transport.
pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
        progress: ByteProgress,
    ) -> Result<(), JobError>;

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String, JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Processing,
    Ready,
    Error,
    NeedsBetterImage,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessingStatus::Processing)
    }
}

/// Durable status of one job as the metadata store records it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusRecord {
    pub fn ready(target_url: impl Into<String>) -> Self {
        Self {
            status: ProcessingStatus::Ready,
            error_message: None,
            target_url: Some(target_url.into()),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn failed(status: ProcessingStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: Some(message.into()),
            target_url: None,
            updated_at: Some(Utc::now()),
        }
    }

    pub fn new(status: ProcessingStatus) -> Self {
        Self {
            status,
            error_message: None,
            target_url: None,
            updated_at: Some(Utc::now()),
        }
    }
}

#[async_trait::async_trait]
pub trait JobMetadataStore: Send + Sync {
    async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>, JobError>;
    async fn set_status(&self, job_id: &str, record: StatusRecord) -> Result<(), JobError>;
}

fn with_auth(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
        None => request,
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, JobError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(http::status_error(status, &body))
}

/// Object store over a simple HTTP API:
/// `PUT {base}/object/{path}` and `POST {base}/object/sign/{path}`.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base: url::Url,
    auth_token: Option<String>,
    chunk_size: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    expires_in: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignResponse {
    signed_url: String,
}

impl HttpObjectStore {
    pub fn new(base: &str, auth_token: Option<String>, chunk_size: usize) -> Result<Self, JobError> {
        Ok(Self {
            client: http::build_streaming_client()?,
            base: http::parse_base(base)?,
            auth_token,
            chunk_size: chunk_size.max(1),
        })
    }

    fn chunked_body(&self, data: Bytes, progress: ByteProgress) -> Body {
        let chunk_size = self.chunk_size;
        let total = data.len();
        let chunks = stream::unfold(0usize, move |offset| {
            let data = data.clone();
            let progress = Arc::clone(&progress);
            async move {
                if offset >= total {
                    return None;
                }
                let end = (offset + chunk_size).min(total);
                progress(end as u64);
                Some((Ok::<Bytes, std::io::Error>(data.slice(offset..end)), end))
            }
        });
        Body::wrap_stream(chunks)
    }
}

#[async_trait::async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
        progress: ByteProgress,
    ) -> Result<(), JobError> {
        let url = http::join_segments(&self.base, &["object", path])?;
        let len = data.len();
        pipeline_debug!("PUT {} ({} bytes)", url, len);
        progress(0);
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .body(self.chunked_body(data, progress));
        let response = with_auth(request, self.auth_token.as_deref())
            .send()
            .await
            .map_err(http::map_reqwest_error)?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String, JobError> {
        let url = http::join_segments(&self.base, &["object", "sign", path])?;
        let body = serde_json::to_vec(&SignRequest {
            expires_in: ttl.as_secs(),
        })
        .map_err(|err| JobError::validation(err.to_string()))?;
        let request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let response = with_auth(request, self.auth_token.as_deref())
            .send()
            .await
            .map_err(http::map_reqwest_error)?;
        let text = ensure_success(response)
            .await?
            .text()
            .await
            .map_err(http::map_reqwest_error)?;
        let parsed: SignResponse = serde_json::from_str(&text)
            .map_err(|err| JobError::network(format!("malformed sign response: {err}")))?;
        // Relative signed URLs are resolved against the store's base.
        match url::Url::parse(&parsed.signed_url) {
            Ok(absolute) => Ok(absolute.to_string()),
            Err(_) => self
                .base
                .join(parsed.signed_url.trim_start_matches('/'))
                .map(|u| u.to_string())
                .map_err(|err| JobError::network(format!("malformed signed url: {err}"))),
        }
    }
}

/// Metadata store over `GET`/`PUT {base}/jobs/{job_id}`.
pub struct HttpMetadataStore {
    client: reqwest::Client,
    base: url::Url,
    auth_token: Option<String>,
}

impl HttpMetadataStore {
    pub fn new(base: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self, JobError> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base: http::parse_base(base)?,
            auth_token,
        })
    }
}

#[async_trait::async_trait]
impl JobMetadataStore for HttpMetadataStore {
    async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>, JobError> {
        let url = http::join_segments(&self.base, &["jobs", job_id])?;
        let response = with_auth(self.client.get(url), self.auth_token.as_deref())
            .send()
            .await
            .map_err(http::map_reqwest_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = ensure_success(response)
            .await?
            .text()
            .await
            .map_err(http::map_reqwest_error)?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|err| JobError::network(format!("malformed status record: {err}")))
    }

    async fn set_status(&self, job_id: &str, record: StatusRecord) -> Result<(), JobError> {
        let url = http::join_segments(&self.base, &["jobs", job_id])?;
        let body =
            serde_json::to_vec(&record).map_err(|err| JobError::validation(err.to_string()))?;
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let response = with_auth(request, self.auth_token.as_deref())
            .send()
            .await
            .map_err(http::map_reqwest_error)?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// Process-local metadata store, for headless runs without a backend.
#[derive(Default, Clone)]
pub struct InMemoryMetadataStore {
    records: Arc<Mutex<HashMap<String, StatusRecord>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, job_id: &str) -> Option<StatusRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }
}

#[async_trait::async_trait]
impl JobMetadataStore for InMemoryMetadataStore {
    async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>, JobError> {
        Ok(self.record(job_id))
    }

    async fn set_status(&self, job_id: &str, record: StatusRecord) -> Result<(), JobError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.to_string(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_vocabulary_is_snake_case() {
        let json = serde_json::to_string(&ProcessingStatus::NeedsBetterImage).unwrap();
        assert_eq!(json, "\"needs_better_image\"");
        assert!(ProcessingStatus::Error.is_terminal());
        assert!(!ProcessingStatus::Processing.is_terminal());
    }

    #[test]
    fn record_serializes_camel_case_and_skips_empty_fields() {
        let record = StatusRecord {
            status: ProcessingStatus::Error,
            error_message: Some("blurry".to_string()),
            target_url: None,
            updated_at: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"status":"error","errorMessage":"blurry"}"#);
    }
}
