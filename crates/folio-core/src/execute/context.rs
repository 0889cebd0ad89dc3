//! Execution context abstraction and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use super::types::{
    ExecutionEvent, ExecutionOutcome, GlobalVariable, ModuleHandle, PackageImage,
};
use crate::error::Error;

/// Handle for cooperative cancellation of a run.
///
/// Any clone can trigger the abort and every other clone observes it, either
/// by polling [`is_aborted`](Self::is_aborted) or by awaiting
/// [`aborted`](Self::aborted).
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortState>,
}

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Request abort. Idempotent.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Clear the flag before starting a new run.
    pub fn reset(&self) {
        self.inner.aborted.store(false, Ordering::Release);
    }

    /// Resolves once abort has been requested.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Failures of the context itself, as opposed to faults of the code it runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// A module or one of its packages could not be loaded.
    #[error("load failure: {0}")]
    LoadFailure(String),

    /// The context died or stopped responding. It accepts no further work.
    #[error("execution context lost: {0}")]
    ContextLost(String),

    /// The context answered with something the host did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<ContextError> for Error {
    fn from(error: ContextError) -> Self {
        match error {
            ContextError::LoadFailure(message) => Error::LoadFailure(message),
            ContextError::ContextLost(message) => Error::ContextLost(message),
            ContextError::Protocol(message) => Error::Ipc(message),
        }
    }
}

/// Sink for non-terminal execution events.
pub type EventSink<'a> = dyn FnMut(ExecutionEvent) + Send + 'a;

/// An isolated place that loads and runs compiled modules while keeping
/// top-level state between runs.
///
/// Requests are serialized: a context runs at most one module at a time.
pub trait ExecutionContext: Send {
    /// Identity of this context instance. Changes whenever a context is
    /// replaced.
    fn id(&self) -> Uuid;

    /// Load a compiled module together with the packages it references,
    /// in load order.
    fn load_module<'a>(
        &'a mut self,
        module: &'a [u8],
        packages: Vec<PackageImage>,
    ) -> BoxFuture<'a, Result<ModuleHandle, ContextError>>;

    /// Run a loaded module, streaming output and its result value to
    /// `events`. Honors `abort` cooperatively and then forcibly.
    fn execute<'a>(
        &'a mut self,
        handle: ModuleHandle,
        abort: &'a AbortHandle,
        events: &'a mut EventSink<'_>,
    ) -> BoxFuture<'a, Result<ExecutionOutcome, ContextError>>;

    /// Drop all top-level state and loaded modules.
    fn reset_state(&mut self) -> BoxFuture<'_, Result<(), ContextError>>;

    /// Live top-level variables, in declaration order.
    fn globals(&mut self) -> BoxFuture<'_, Result<Vec<GlobalVariable>, ContextError>>;

    /// Release the context. Never fails.
    fn shutdown(&mut self) -> BoxFuture<'_, ()>;
}
