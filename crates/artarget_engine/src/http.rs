use std::time::Duration;

use artarget_core::JobError;
use reqwest::StatusCode;
use serde::Deserialize;

/// Error payload shape returned by the backend (`{code, message}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

impl ApiErrorBody {
    pub(crate) fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }
}

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, JobError> {
    reqwest::Client::builder()
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .timeout(timeout)
        .build()
        .map_err(|err| JobError::network(err.to_string()))
}

/// Builds a client without an overall timeout; callers bound the request with a token.
pub(crate) fn build_streaming_client() -> Result<reqwest::Client, JobError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| JobError::network(err.to_string()))
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> JobError {
    if err.is_timeout() {
        return JobError::timeout(err.to_string());
    }
    JobError::network(err.to_string())
}

/// Classifies a non-success response. Server-side trouble and throttling are
/// worth retrying; every other client error is a rejection.
pub(crate) fn status_error(status: StatusCode, body: &str) -> JobError {
    let payload = ApiErrorBody::parse(body);
    let detail = payload
        .message
        .or(payload.code)
        .unwrap_or_else(|| status.to_string());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        JobError::network(format!("{status}: {detail}"))
    } else {
        JobError::server_rejected(Some(status.as_u16()), detail)
    }
}

/// Drops query and fragment, leaving the stable part of a storage URL.
pub fn strip_query(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw
            .split(['?', '#'])
            .next()
            .unwrap_or(raw)
            .to_string(),
    }
}

/// Appends path segments to `base`, percent-encoding each one.
pub(crate) fn join_segments(base: &url::Url, segments: &[&str]) -> Result<url::Url, JobError> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| JobError::validation(format!("{base} cannot be a base url")))?;
        path.pop_if_empty();
        for segment in segments {
            for part in segment.split('/').filter(|p| !p.is_empty()) {
                path.push(part);
            }
        }
    }
    Ok(url)
}

pub(crate) fn parse_base(raw: &str) -> Result<url::Url, JobError> {
    url::Url::parse(raw).map_err(|err| JobError::validation(format!("invalid url {raw}: {err}")))
}
