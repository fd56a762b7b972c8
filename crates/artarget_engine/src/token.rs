//! Keyed registry of cancellation tokens with optional deadlines.
//!
//! At most one live token exists per id: creating a token for an id that is
//! already registered aborts and evicts the previous one first.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use artarget_core::{AbortReason, JobError};
use artarget_logging::{pipeline_debug, pipeline_warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const CAUSE_NONE: u8 = 0;
const CAUSE_CANCELLED: u8 = 1;
const CAUSE_INTERRUPTED: u8 = 2;
const CAUSE_TIMED_OUT: u8 = 3;

/// How a token came to be aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    Cancelled,
    Interrupted,
    TimedOut,
}

impl AbortCause {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            CAUSE_CANCELLED => Some(AbortCause::Cancelled),
            CAUSE_INTERRUPTED => Some(AbortCause::Interrupted),
            CAUSE_TIMED_OUT => Some(AbortCause::TimedOut),
            _ => None,
        }
    }

    fn raw(self) -> u8 {
        match self {
            AbortCause::Cancelled => CAUSE_CANCELLED,
            AbortCause::Interrupted => CAUSE_INTERRUPTED,
            AbortCause::TimedOut => CAUSE_TIMED_OUT,
        }
    }
}

impl From<AbortReason> for AbortCause {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Cancelled => AbortCause::Cancelled,
            AbortReason::Interrupted => AbortCause::Interrupted,
        }
    }
}

type TimeoutHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
pub struct TokenOptions {
    pub timeout: Option<Duration>,
    /// Runs when the deadline fires, before the token is marked aborted.
    pub on_timeout: Option<TimeoutHook>,
}

impl TokenOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            on_timeout: None,
        }
    }

    pub fn on_timeout(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(hook));
        self
    }
}

struct TokenShared {
    id: String,
    serial: u64,
    cancel: CancellationToken,
    disarm: CancellationToken,
    cause: AtomicU8,
    deadline: Option<Instant>,
    on_timeout: Mutex<Option<TimeoutHook>>,
    parent: Option<OperationToken>,
}

/// Handle to one registered operation. Clones share state.
#[derive(Clone)]
pub struct OperationToken {
    shared: Arc<TokenShared>,
}

impl std::fmt::Debug for OperationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationToken")
            .field("id", &self.shared.id)
            .field("serial", &self.shared.serial)
            .field("cause", &self.cause())
            .finish()
    }
}

impl OperationToken {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// True once the token was aborted, timed out, or its parent went away.
    pub fn is_aborted(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn cause(&self) -> Option<AbortCause> {
        AbortCause::from_raw(self.shared.cause.load(Ordering::Acquire))
            .or_else(|| self.shared.parent.as_ref().and_then(OperationToken::cause))
    }

    /// Whether `other` is the very same registration (not just the same id).
    pub fn same_as(&self, other: &OperationToken) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Resolves once the token is aborted.
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Cooperative cancellation check. Also fires an expired deadline when no
    /// runtime timer was available to do it.
    pub fn check(&self) -> Result<(), JobError> {
        if !self.is_aborted() {
            if let Some(deadline) = self.shared.deadline {
                if Instant::now() >= deadline {
                    fire_timeout(&self.shared);
                }
            }
        }
        if self.is_aborted() {
            Err(self.abort_error())
        } else {
            Ok(())
        }
    }

    /// The error an operation should settle with once this token is aborted.
    pub fn abort_error(&self) -> JobError {
        match self.cause() {
            Some(AbortCause::TimedOut) => {
                JobError::timeout(format!("operation {} timed out", self.shared.id))
            }
            Some(AbortCause::Cancelled) => JobError::aborted(AbortReason::Cancelled),
            Some(AbortCause::Interrupted) | None => JobError::aborted(AbortReason::Interrupted),
        }
    }

    /// Runs `operation` until it finishes or the token is aborted. On abort the
    /// operation future is dropped immediately, releasing whatever it holds.
    pub async fn run<T, F>(&self, operation: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, JobError>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.abort_error()),
            result = operation => result,
        }
    }

    /// Sleeps for `duration` unless the token is aborted first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), JobError> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    fn mark(&self, cause: AbortCause) -> bool {
        mark(&self.shared, cause)
    }
}

fn mark(shared: &TokenShared, cause: AbortCause) -> bool {
    let first = shared
        .cause
        .compare_exchange(CAUSE_NONE, cause.raw(), Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    shared.cancel.cancel();
    shared.disarm.cancel();
    first
}

fn fire_timeout(shared: &TokenShared) {
    if shared.cancel.is_cancelled() {
        return;
    }
    let hook = shared
        .on_timeout
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(hook) = hook {
        if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
            pipeline_warn!("on_timeout hook for {} panicked; ignored", shared.id);
        }
    }
    if mark(shared, AbortCause::TimedOut) {
        pipeline_debug!("token {} timed out", shared.id);
    }
}

#[derive(Default)]
struct Registry {
    entries: Mutex<HashMap<String, OperationToken>>,
}

impl Registry {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, OperationToken>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_if_same(&self, id: &str, serial: u64) {
        let mut entries = self.entries();
        if entries.get(id).map(|t| t.shared.serial) == Some(serial) {
            entries.remove(id);
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, token) in entries.drain() {
            token.mark(AbortCause::Interrupted);
        }
    }
}

/// Issues and tracks per-operation tokens. Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct CancellationTokenManager {
    registry: Arc<Registry>,
    next_serial: Arc<AtomicU64>,
}

impl CancellationTokenManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh token for `id`, aborting any token already registered under it.
    pub fn create(&self, id: impl Into<String>, options: TokenOptions) -> OperationToken {
        self.install(id.into(), options, None)
    }

    /// Like [`create`](Self::create), but the new token is also aborted when `parent` is.
    pub fn create_child(
        &self,
        id: impl Into<String>,
        parent: &OperationToken,
        options: TokenOptions,
    ) -> OperationToken {
        self.install(id.into(), options, Some(parent.clone()))
    }

    /// Aborts the token registered under `id` as caller-cancelled.
    /// Returns false if no token is registered.
    pub fn abort(&self, id: &str) -> bool {
        self.abort_with(id, AbortReason::Cancelled)
    }

    pub fn abort_with(&self, id: &str, reason: AbortReason) -> bool {
        let removed = self.registry.entries().remove(id);
        match removed {
            Some(token) => {
                token.mark(reason.into());
                pipeline_debug!("token {} aborted ({:?})", id, reason);
                true
            }
            None => false,
        }
    }

    /// Aborts every registered token. Owners call this on teardown.
    pub fn abort_all(&self) {
        let drained: Vec<_> = self.registry.entries().drain().collect();
        for (_, token) in drained {
            token.mark(AbortCause::Interrupted);
        }
    }

    pub fn get(&self, id: &str) -> Option<OperationToken> {
        self.registry.entries().get(id).cloned()
    }

    /// Removes `token` from the registry on the normal completion path
    /// without marking it aborted. A newer token under the same id is left alone.
    pub fn release(&self, token: &OperationToken) {
        token.shared.disarm.cancel();
        self.registry
            .evict_if_same(&token.shared.id, token.shared.serial);
    }

    pub fn len(&self) -> usize {
        self.registry.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install(
        &self,
        id: String,
        options: TokenOptions,
        parent: Option<OperationToken>,
    ) -> OperationToken {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let cancel = match &parent {
            Some(parent) => parent.shared.cancel.child_token(),
            None => CancellationToken::new(),
        };
        let token = OperationToken {
            shared: Arc::new(TokenShared {
                id: id.clone(),
                serial,
                cancel,
                disarm: CancellationToken::new(),
                cause: AtomicU8::new(CAUSE_NONE),
                deadline: options.timeout.map(|t| Instant::now() + t),
                on_timeout: Mutex::new(options.on_timeout),
                parent,
            }),
        };

        let previous = self.registry.entries().insert(id.clone(), token.clone());
        if let Some(previous) = previous {
            previous.mark(AbortCause::Interrupted);
            pipeline_debug!("token {} superseded by a newer registration", id);
        }

        if let Some(timeout) = options.timeout {
            self.arm_timer(&token, timeout);
        }
        token
    }

    fn arm_timer(&self, token: &OperationToken, timeout: Duration) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                pipeline_warn!(
                    "no async runtime for token {}; deadline is checked lazily",
                    token.shared.id
                );
                return;
            }
        };
        let shared = Arc::clone(&token.shared);
        let registry: Weak<Registry> = Arc::downgrade(&self.registry);
        handle.spawn(async move {
            tokio::select! {
                _ = shared.disarm.cancelled() => {}
                _ = shared.cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    fire_timeout(&shared);
                    if let Some(registry) = registry.upgrade() {
                        registry.evict_if_same(&shared.id, shared.serial);
                    }
                }
            }
        });
    }
}
