use std::future::Future;

use artarget_core::JobError;
use artarget_logging::{pipeline_debug, pipeline_warn};

use crate::network::NetworkMonitor;
use crate::settings::ExecutorSettings;
use crate::token::OperationToken;

/// Retries network-class failures of a single operation, waiting for
/// connectivity before every attempt.
#[derive(Clone)]
pub struct NetworkAwareExecutor {
    monitor: NetworkMonitor,
    settings: ExecutorSettings,
}

impl NetworkAwareExecutor {
    pub fn new(monitor: NetworkMonitor, settings: ExecutorSettings) -> Self {
        Self { monitor, settings }
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn default_retries(&self) -> u32 {
        self.settings.max_retries
    }

    /// Runs `operation` up to `max_retries` times. `operation` receives the
    /// 1-based attempt number. Non-network errors are returned at once.
    pub async fn run<T, F, Fut>(
        &self,
        mut operation: F,
        max_retries: u32,
        token: &OperationToken,
    ) -> Result<T, JobError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let attempts = max_retries.max(1);
        let mut attempt = 1;
        loop {
            self.monitor.wait_for_online(token).await?;
            let error = match token.run(operation(attempt)).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !error.kind.is_network() {
                pipeline_debug!("{} attempt {} failed: {}", token.id(), attempt, error);
                return Err(error);
            }
            if attempt >= attempts {
                pipeline_warn!(
                    "{} gave up after {} network attempts: {}",
                    token.id(),
                    attempt,
                    error
                );
                return Err(error);
            }
            let delay = self.settings.delay_after(attempt);
            pipeline_warn!(
                "{} network attempt {}/{} failed, retrying in {:?}: {}",
                token.id(),
                attempt,
                attempts,
                delay,
                error
            );
            token.sleep(delay).await?;
            attempt += 1;
        }
    }
}
