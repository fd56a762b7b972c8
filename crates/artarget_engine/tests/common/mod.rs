#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use artarget_core::JobError;
use artarget_engine::{
    ByteProgress, ComputeModule, EngineEvent, ObjectStore, OperationToken, SharedProgress,
    SourceImage,
};
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

/// Signature plus IHDR; enough for header validation.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0, 0, 0, 0, 0]);
    bytes
}

pub fn source(job_id: &str) -> SourceImage {
    SourceImage::new(format!("{job_id}.png"), png(640, 480))
}

pub fn artifact_for(image: &SourceImage) -> Bytes {
    Bytes::from(format!("mind:{}", image.name))
}

/// Compute module that takes `delay` (observing the token) and echoes the image name.
pub struct FakeCompute {
    pub calls: AtomicU32,
    pub delay: Duration,
}

impl FakeCompute {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ComputeModule for FakeCompute {
    async fn compile(
        &self,
        image: &SourceImage,
        progress: SharedProgress,
        token: &OperationToken,
    ) -> Result<Bytes, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.report(10);
        if !self.delay.is_zero() {
            token.sleep(self.delay).await?;
        }
        progress.report(100);
        Ok(artifact_for(image))
    }
}

/// Object store that fails the first `failures` uploads with a network error.
pub struct FlakyStore {
    failures_left: AtomicU32,
    pub uploads: Mutex<Vec<String>>,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            uploads: Mutex::new(Vec::new()),
        })
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ObjectStore for FlakyStore {
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        _content_type: &str,
        progress: ByteProgress,
    ) -> Result<(), JobError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(JobError::network("connection reset"));
        }
        progress(data.len() as u64);
        self.uploads.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn signed_url(&self, path: &str, _ttl: Duration) -> Result<String, JobError> {
        Ok(format!("https://cdn.test/{path}?sig=abc"))
    }
}

/// Drains events until a terminal notice for `job_id` arrives.
pub async fn events_until_terminal(
    rx: &mut UnboundedReceiver<EngineEvent>,
    job_id: &str,
) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    let wait = async {
        while let Some(event) = rx.recv().await {
            let done = matches!(&event, EngineEvent::Notice(n) if n.is_terminal() && n.job_id() == job_id);
            seen.push(event);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), wait)
        .await
        .expect("job never reached a terminal state");
    seen
}

pub fn notices(events: &[EngineEvent]) -> Vec<artarget_core::Notice> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Notice(notice) => Some(notice.clone()),
            EngineEvent::Progress { .. } => None,
        })
        .collect()
}
