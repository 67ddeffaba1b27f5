use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tracing::{Instrument, Span, error, warn};

/// Serial executor for deferred connection callbacks (exception listener
/// calls, session teardown after a transport failure).
///
/// Jobs run one at a time on a single task, so they never execute on the
/// transport's I/O task. When the queue is full a job gets its own task.
#[derive(Clone)]
pub(crate) struct WorkQueue {
    tx: mpsc::Sender<BoxFuture<'static, ()>>,
    span: Span,
}

impl WorkQueue {
    pub(crate) fn new(depth: usize, span: Span) -> Self {
        let (tx, mut rx) = mpsc::channel::<BoxFuture<'static, ()>>(depth.max(1));
        tokio::spawn(
            async move {
                while let Some(job) = rx.recv().await {
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!("deferred callback panicked");
                    }
                }
            }
            .instrument(span.clone()),
        );
        Self { tx, span }
    }

    pub(crate) fn execute(&self, job: BoxFuture<'static, ()>) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!("work queue full, running callback on its own task");
                tokio::spawn(AssertUnwindSafe(job).catch_unwind().map(|_| ()).instrument(self.span.clone()));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("work queue closed, dropping callback");
            }
        }
    }
}
