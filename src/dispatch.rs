//! Ordered per-session delivery.
//!
//! Every session owns one [`MessageDispatchChannel`] fed by the connection's
//! router and drained by a [`SessionExecutor`] worker task. Consumers own a
//! channel of the same type for messages they could not hand to a listener
//! yet (synchronous receive, redelivery backlog).

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, Span, trace, warn};

use crate::commands::MessageDispatch;

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<MessageDispatch>,
    running: bool,
    closed: bool,
}

/// FIFO of dispatches with start/stop/close flags.
///
/// Dequeueing only yields messages while the channel is running; a stopped
/// channel keeps its contents.
#[derive(Debug, Default)]
pub(crate) struct MessageDispatchChannel {
    state: Mutex<ChannelState>,
    notify: Notify,
}

impl MessageDispatchChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn enqueue(&self, dispatch: MessageDispatch) {
        {
            let mut s = self.lock();
            if s.closed {
                return;
            }
            s.queue.push_back(dispatch);
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn enqueue_first(&self, dispatch: MessageDispatch) {
        {
            let mut s = self.lock();
            if s.closed {
                return;
            }
            s.queue.push_front(dispatch);
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn dequeue_no_wait(&self) -> Option<MessageDispatch> {
        let mut s = self.lock();
        if !s.running || s.closed {
            return None;
        }
        s.queue.pop_front()
    }

    /// Wait for a message. `None` on timeout or once the channel is closed.
    /// Without a timeout this waits until a message arrives or the channel
    /// closes.
    pub(crate) async fn dequeue(&self, timeout: Option<Duration>) -> Option<MessageDispatch> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = self.lock();
                if s.closed {
                    return None;
                }
                if s.running {
                    if let Some(d) = s.queue.pop_front() {
                        return Some(d);
                    }
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    pub(crate) fn start(&self) {
        let changed = {
            let mut s = self.lock();
            let changed = !s.running && !s.closed;
            if !s.closed {
                s.running = true;
            }
            changed
        };
        if changed {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn stop(&self) {
        self.lock().running = false;
    }

    pub(crate) fn close(&self) {
        {
            let mut s = self.lock();
            s.closed = true;
            s.running = false;
            s.queue.clear();
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn clear(&self) {
        self.lock().queue.clear();
    }

    /// Take everything out, oldest first.
    pub(crate) fn remove_all(&self) -> Vec<MessageDispatch> {
        self.lock().queue.drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock().running
    }
}

/// Work source driven by a [`SessionExecutor`].
pub(crate) trait DispatchTarget: Send + Sync + 'static {
    /// Deliver at most one unit of work. Returns `true` when more may be
    /// pending.
    fn iterate(self: Arc<Self>) -> BoxFuture<'static, bool>;
}

struct Worker {
    handle: JoinHandle<()>,
    generation: u64,
}

/// Lazily spawned worker task draining a session channel.
pub(crate) struct SessionExecutor {
    channel: MessageDispatchChannel,
    wake: Arc<Notify>,
    generation: Arc<AtomicU64>,
    worker: Mutex<Option<Worker>>,
    target: Weak<dyn DispatchTarget>,
    close_timeout: Duration,
    span: Span,
}

impl SessionExecutor {
    pub(crate) fn new(target: Weak<dyn DispatchTarget>, close_timeout: Duration, span: Span) -> Self {
        Self {
            channel: MessageDispatchChannel::new(),
            wake: Arc::new(Notify::new()),
            generation: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
            target,
            close_timeout,
            span,
        }
    }

    pub(crate) fn channel(&self) -> &MessageDispatchChannel {
        &self.channel
    }

    pub(crate) fn execute(&self, dispatch: MessageDispatch) {
        self.channel.enqueue(dispatch);
        self.wakeup();
    }

    pub(crate) fn execute_first(&self, dispatch: MessageDispatch) {
        self.channel.enqueue_first(dispatch);
        self.wakeup();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.channel.is_running()
    }

    /// Make sure a worker exists and nudge it.
    pub(crate) fn wakeup(&self) {
        if !self.channel.is_running() {
            return;
        }
        {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            let current = self.generation.load(Ordering::SeqCst);
            let alive = worker
                .as_ref()
                .is_some_and(|w| w.generation == current && !w.handle.is_finished());
            if !alive {
                let handle = tokio::spawn(
                    run_worker(
                        self.target.clone(),
                        self.wake.clone(),
                        self.generation.clone(),
                        current,
                    )
                    .instrument(self.span.clone()),
                );
                trace!(parent: &self.span, generation = current, "dispatch worker spawned");
                *worker = Some(Worker {
                    handle,
                    generation: current,
                });
            }
        }
        self.wake.notify_one();
    }

    pub(crate) fn start(&self) {
        self.channel.start();
        self.wakeup();
    }

    /// Stop delivery and wait for the worker to finish its current unit of
    /// work. Called from the worker itself, only the channel is stopped: the
    /// worker stays registered and picks up again after the next `start`.
    pub(crate) async fn stop(&self) {
        self.channel.stop();
        let worker = {
            let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            let on_worker = slot
                .as_ref()
                .is_some_and(|w| tokio::task::try_id() == Some(w.handle.id()));
            if on_worker {
                return;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        self.wake.notify_one();
        let Some(worker) = worker else {
            return;
        };
        if tokio::time::timeout(self.close_timeout, worker.handle)
            .await
            .is_err()
        {
            warn!(parent: &self.span, "dispatch worker did not stop within {:?}", self.close_timeout);
        }
    }

    pub(crate) async fn close(&self) {
        self.stop().await;
        self.channel.close();
        // a worker that closed its own session exits once its listener returns
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Close without waiting for the worker.
    pub(crate) fn shutdown(&self) {
        self.channel.close();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

async fn run_worker(
    target: Weak<dyn DispatchTarget>,
    wake: Arc<Notify>,
    generation: Arc<AtomicU64>,
    mine: u64,
) {
    loop {
        if generation.load(Ordering::SeqCst) != mine {
            break;
        }
        let Some(t) = target.upgrade() else {
            break;
        };
        let more = t.iterate().await;
        if !more {
            if generation.load(Ordering::SeqCst) != mine {
                break;
            }
            wake.notified().await;
        }
    }
    trace!(generation = mine, "dispatch worker exiting");
}
