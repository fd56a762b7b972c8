use std::fmt;

/// Why an operation was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// The caller asked for it (cancel button, explicit abort).
    Cancelled,
    /// A newer trigger superseded the operation, or its owner shut down.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Input rejected before any work was attempted.
    Validation,
    /// Connectivity-class failure; the only kind the network executor retries.
    Network,
    /// Refused up front because the monitor reported no connectivity.
    Offline,
    Timeout,
    Aborted(AbortReason),
    /// The remote side understood the request and refused it.
    ServerRejected { status: Option<u16> },
    /// Opaque failure inside the compute module.
    Compute,
}

/// What the job state machine does with a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Fail,
    Abandon,
}

impl FailureKind {
    pub fn is_network(&self) -> bool {
        matches!(self, FailureKind::Network)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, FailureKind::Aborted(_))
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            FailureKind::Aborted(_) => Disposition::Abandon,
            FailureKind::Validation | FailureKind::ServerRejected { .. } => Disposition::Fail,
            FailureKind::Network
            | FailureKind::Offline
            | FailureKind::Timeout
            | FailureKind::Compute => Disposition::Retry,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Validation => write!(f, "validation error"),
            FailureKind::Network => write!(f, "network error"),
            FailureKind::Offline => write!(f, "offline"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Aborted(AbortReason::Cancelled) => write!(f, "cancelled"),
            FailureKind::Aborted(AbortReason::Interrupted) => write!(f, "interrupted"),
            FailureKind::ServerRejected { status: Some(code) } => {
                write!(f, "rejected by server (status {code})")
            }
            FailureKind::ServerRejected { status: None } => write!(f, "rejected by server"),
            FailureKind::Compute => write!(f, "compute error"),
        }
    }
}

/// Typed failure produced at the point where an operation fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn offline() -> Self {
        Self::new(FailureKind::Offline, "no network connection")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn aborted(reason: AbortReason) -> Self {
        let message = match reason {
            AbortReason::Cancelled => "operation cancelled",
            AbortReason::Interrupted => "operation interrupted",
        };
        Self::new(FailureKind::Aborted(reason), message)
    }

    pub fn server_rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::ServerRejected { status }, message)
    }

    pub fn compute(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Compute, message)
    }

    /// Message suitable for showing to the person who started the job.
    pub fn user_message(&self) -> String {
        match &self.kind {
            FailureKind::Validation => self.message.clone(),
            FailureKind::Network => {
                "Network error. Check your connection and try again.".to_string()
            }
            FailureKind::Offline => "You are offline. Reconnect and try again.".to_string(),
            FailureKind::Timeout => {
                "The operation took too long and was stopped. Try again on a faster connection."
                    .to_string()
            }
            FailureKind::Aborted(AbortReason::Cancelled) => "Cancelled.".to_string(),
            FailureKind::Aborted(AbortReason::Interrupted) => {
                "The operation was interrupted. Please try again.".to_string()
            }
            FailureKind::ServerRejected { .. } => {
                format!("The server rejected the request: {}", self.message)
            }
            FailureKind::Compute => format!("Compiling the target failed: {}", self.message),
        }
    }
}
