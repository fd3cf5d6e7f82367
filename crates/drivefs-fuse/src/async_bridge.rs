//! Bridge between sync FUSE callbacks and async routed calls.
//!
//! The kernel delivers calls on a single session thread. Blocking that
//! thread on a slow drive open would stall every other call, so each call is
//! spawned onto the tokio runtime and the reply is sent from the task. The
//! completion closure runs exactly once: with the call's output, or with a
//! [`BridgeError`] when the call timed out or its task died.
//!
//! [`CallBridge::drain`] lets unmount wait for outstanding calls to settle
//! before shared state is released.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;

/// Statistics for async bridge operations (for observability).
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub operations_started: AtomicU64,
    pub operations_completed: AtomicU64,
    pub operations_timed_out: AtomicU64,
    pub operations_cancelled: AtomicU64,
    in_flight: AtomicU64,
    settled: Notify,
}

impl BridgeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_start(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_complete(&self) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
        self.settle();
    }

    pub fn record_timeout(&self) {
        self.operations_timed_out.fetch_add(1, Ordering::Relaxed);
        self.settle();
    }

    pub fn record_cancelled(&self) {
        self.operations_cancelled.fetch_add(1, Ordering::Relaxed);
        self.settle();
    }

    fn settle(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.settled.notify_waiters();
        }
    }

    /// Calls started but not yet completed.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Error from async bridge operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation was cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn to_errno(&self) -> i32 {
        match self {
            BridgeError::Timeout(_) => libc::ETIMEDOUT,
            BridgeError::Cancelled => libc::ECANCELED,
        }
    }
}

/// Runs calls on a tokio runtime on behalf of a synchronous caller.
#[derive(Debug, Clone)]
pub struct CallBridge {
    handle: Handle,
    timeout: Duration,
    stats: Arc<BridgeStats>,
}

impl CallBridge {
    pub fn new(handle: Handle, timeout: Duration) -> Self {
        Self {
            handle,
            timeout,
            stats: BridgeStats::new(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// Spawns `future` and hands its outcome to `complete`.
    ///
    /// Returns immediately. A panic inside `future` completes the call with
    /// [`BridgeError::Cancelled`] instead of leaving the caller without a
    /// reply.
    pub fn spawn<F, T, C>(&self, future: F, complete: C)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Result<T, BridgeError>) + Send + 'static,
    {
        let timeout = self.timeout;
        let stats = Arc::clone(&self.stats);
        stats.record_start();
        self.handle.spawn(async move {
            let guarded = AssertUnwindSafe(future).catch_unwind();
            match tokio::time::timeout(timeout, guarded).await {
                Ok(Ok(value)) => {
                    stats.record_complete();
                    complete(Ok(value));
                }
                Ok(Err(_panic)) => {
                    tracing::error!("routed call panicked");
                    stats.record_cancelled();
                    complete(Err(BridgeError::Cancelled));
                }
                Err(_elapsed) => {
                    tracing::warn!(?timeout, "routed call timed out");
                    stats.record_timeout();
                    complete(Err(BridgeError::Timeout(timeout)));
                }
            }
        });
    }

    /// Runs `future` to completion, blocking the calling thread.
    ///
    /// Must not be called from inside the runtime.
    pub fn execute<F, T>(&self, future: F) -> Result<T, BridgeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.spawn(future, move |result| {
            // Ignore send error - receiver may have gone away
            let _ = tx.send(result);
        });
        rx.blocking_recv().unwrap_or(Err(BridgeError::Cancelled))
    }

    /// Waits until no spawned call is outstanding, or `deadline` passes.
    ///
    /// Returns the number of calls still in flight.
    pub async fn drain(&self, deadline: Duration) -> u64 {
        let wait = async {
            loop {
                let settled = self.stats.settled.notified();
                if self.stats.in_flight() == 0 {
                    return;
                }
                settled.await;
            }
        };
        if tokio::time::timeout(deadline, wait).await.is_err() {
            tracing::warn!(
                in_flight = self.stats.in_flight(),
                "calls still outstanding after drain deadline"
            );
        }
        self.stats.in_flight()
    }
}
