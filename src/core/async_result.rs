//! # Async Result Protocol
//!
//! Every asynchronous gateway operation completes with a single [`AsyncResult`]:
//! either a success payload or a failure cause, never both.
//!
//! Registry operations are `async fn`s, so a future resolves exactly once by
//! construction. The connector reports through callbacks instead, and those go
//! through [`AsyncResultHandler`], which guarantees the callback runs at most
//! once. The owner of the handler is responsible for running it at least once.
//!
//! Handlers must not assume they run on the caller's task. They are usually
//! invoked from a spawned tokio task.

use crate::core::error::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Result of an asynchronous gateway operation
pub type AsyncResult<T> = GatewayResult<T>;

type Callback<T> = Box<dyn FnOnce(AsyncResult<T>) + Send + 'static>;

/// Once-only completion callback
///
/// Cloning yields another handle to the same callback, so two parties (e.g. a
/// transport error path and an abort path) can race to complete it and only
/// the first one wins.
pub struct AsyncResultHandler<T> {
    callback: Arc<Mutex<Option<Callback<T>>>>,
}

impl<T> Clone for AsyncResultHandler<T> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
        }
    }
}

impl<T: Send + 'static> AsyncResultHandler<T> {
    /// Wrap a callback
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(AsyncResult<T>) + Send + 'static,
    {
        Self {
            callback: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    /// Create a handler that forwards its result into a oneshot channel
    ///
    /// If the handler is dropped without completing, the receiver reports
    /// a closed channel instead of hanging forever.
    pub fn channel() -> (Self, oneshot::Receiver<AsyncResult<T>>) {
        let (tx, rx) = oneshot::channel();
        let handler = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (handler, rx)
    }

    /// Deliver a result
    ///
    /// Returns `true` if this call ran the callback, `false` if the handler
    /// had already been completed.
    pub fn handle(&self, result: AsyncResult<T>) -> bool {
        // Take the callback out before calling it so the lock is not held
        // while user code runs.
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    /// Deliver a success payload
    pub fn succeed(&self, value: T) -> bool {
        self.handle(Ok(value))
    }

    /// Deliver a failure cause
    pub fn fail(&self, error: GatewayError) -> bool {
        self.handle(Err(error))
    }

    /// Whether the result has already been delivered
    pub fn is_completed(&self) -> bool {
        self.callback.lock().is_none()
    }

    /// Drive a future on the runtime and hand its output to this handler
    ///
    /// Callback-style access to the `async fn` registry operations.
    pub fn complete_with<F>(self, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        tokio::spawn(async move {
            let result = future.await;
            self.handle(result);
        })
    }
}

/// Await a oneshot receiver produced by [`AsyncResultHandler::channel`]
pub async fn await_result<T>(receiver: oneshot::Receiver<AsyncResult<T>>) -> AsyncResult<T> {
    receiver
        .await
        .map_err(|_| GatewayError::internal("Result handler dropped without completing"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_handler_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = AsyncResultHandler::<u32>::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handler.succeed(1));
        assert!(!handler.fail(GatewayError::internal("late failure")));
        assert!(!handler.clone().succeed(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handler.is_completed());
    }

    #[tokio::test]
    async fn test_channel_delivers_failure() {
        let (handler, rx) = AsyncResultHandler::<()>::channel();
        handler.fail(GatewayError::connector("refused"));
        let result = await_result(rx).await;
        assert_eq!(result, Err(GatewayError::connector("refused")));
    }

    #[tokio::test]
    async fn test_dropped_handler_is_observable() {
        let (handler, rx) = AsyncResultHandler::<()>::channel();
        drop(handler);
        let result = await_result(rx).await;
        assert!(matches!(result, Err(GatewayError::Internal { .. })));
    }

    #[tokio::test]
    async fn test_complete_with_future() {
        let (handler, rx) = AsyncResultHandler::<u32>::channel();
        handler.complete_with(async { Ok(7) }).await.unwrap();
        assert_eq!(await_result(rx).await, Ok(7));
    }
}
