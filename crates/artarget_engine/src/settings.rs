use std::time::Duration;

use serde::{Deserialize, Serialize};

use artarget_core::RetryPolicy;

/// Tunables for the whole pipeline. Every field has a default, so a config
/// file only needs to name what it overrides. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub retry: RetrySettings,
    pub executor: ExecutorSettings,
    pub upload: UploadSettings,
    pub validation: ValidationSettings,
    pub reconcile: ReconcileSettings,
    pub network: NetworkSettings,
    pub endpoints: Endpoints,
}

/// Job-level retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: artarget_core::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 1000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }
}

/// Network-gated retry inside a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 3000,
            multiplier: 1.5,
        }
    }
}

impl ExecutorSettings {
    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub base_timeout_ms: u64,
    /// Extra allowance per megabyte of payload.
    pub per_mb_timeout_ms: u64,
    pub chunk_size: usize,
    pub signed_url_ttl_secs: u64,
    pub bucket_prefix: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            base_timeout_ms: 30_000,
            per_mb_timeout_ms: 8_000,
            chunk_size: 64 * 1024,
            signed_url_ttl_secs: 60 * 60 * 24 * 365,
            bucket_prefix: "targets".to_string(),
        }
    }
}

impl UploadSettings {
    /// `max(base, base + per_mb * size_mb)`.
    pub fn timeout_for(&self, size_bytes: u64) -> Duration {
        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
        let extra = (self.per_mb_timeout_ms as f64 * size_mb).max(0.0) as u64;
        Duration::from_millis(self.base_timeout_ms.saturating_add(extra).max(self.base_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub max_bytes: u64,
    pub allowed_types: Vec<String>,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            allowed_types: vec!["image/jpeg".to_string(), "image/png".to_string()],
            min_width: 100,
            min_height: 100,
            max_width: 8192,
            max_height: 8192,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub kickoff_attempts: u32,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            kickoff_attempts: 2,
            poll_attempts: 60,
            poll_interval_ms: 2000,
            request_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub online_poll_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub slow_downlink_mbps: f64,
    pub slow_rtt_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            online_poll_ms: 1000,
            probe_interval_ms: 30_000,
            probe_timeout_ms: 5000,
            slow_downlink_mbps: 0.5,
            slow_rtt_ms: 1000,
        }
    }
}

/// Base URLs of the remote collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub storage_url: String,
    pub metadata_url: String,
    pub compile_url: String,
    pub health_url: Option<String>,
    pub auth_token: Option<String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            storage_url: "http://localhost:8080/storage".to_string(),
            metadata_url: "http://localhost:8080/metadata".to_string(),
            compile_url: "http://localhost:8080".to_string(),
            health_url: None,
            auth_token: None,
        }
    }
}
