use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, trace, warn};

use crate::ack::{AckLedger, AckMode, AckPolicy};
use crate::commands::{Command, CommandBody, ConsumerInfo, MessageDispatch, RemoveInfo};
use crate::config::RedeliveryPolicy;
use crate::destination::Destination;
use crate::dispatch::MessageDispatchChannel;
use crate::error::{Result, StompError};
use crate::ids::{ConsumerId, MessageId};
use crate::message::Message;
use crate::session::SessionInner;
use crate::transaction::Synchronization;

/// Error type listeners may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type MessageListener =
    Arc<dyn Fn(Message) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct ConsumerInner {
    id: ConsumerId,
    info: ConsumerInfo,
    session: Arc<SessionInner>,
    policy: &'static AckPolicy,
    redelivery_policy: RedeliveryPolicy,
    expiry_check: bool,
    /// Messages not yet handed to the application.
    unconsumed: MessageDispatchChannel,
    ledger: Mutex<AckLedger>,
    listener: Mutex<Option<MessageListener>>,
    receivers: AtomicUsize,
    synchronization_registered: AtomicBool,
    clear_required: AtomicBool,
    /// UNSUBSCRIBE deferred until the running transaction ends.
    remove_pending: AtomicBool,
    closed: AtomicBool,
    span: Span,
}

impl ConsumerInner {
    pub(crate) fn new(session: Arc<SessionInner>, info: ConsumerInfo) -> Arc<Self> {
        let config = session.connection().config();
        let span = tracing::debug_span!("consumer", id = %info.consumer_id);
        Arc::new(Self {
            id: info.consumer_id.clone(),
            policy: info.ack_mode.policy(),
            redelivery_policy: config.redelivery_policy.clone(),
            expiry_check: config.message_expiry_check,
            unconsumed: MessageDispatchChannel::new(),
            ledger: Mutex::new(AckLedger::new(
                info.consumer_id.clone(),
                Some(info.destination.clone()),
                info.prefetch_size,
            )),
            listener: Mutex::new(None),
            receivers: AtomicUsize::new(0),
            synchronization_registered: AtomicBool::new(false),
            clear_required: AtomicBool::new(false),
            remove_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            info,
            session,
            span,
        })
    }

    pub(crate) fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn listener(&self) -> Option<MessageListener> {
        lock(&self.listener).clone()
    }

    fn is_transacted(&self) -> bool {
        self.policy.mode == AckMode::Transacted
    }

    pub(crate) fn start(&self) {
        self.unconsumed.start();
    }

    pub(crate) fn stop(&self) {
        self.unconsumed.stop();
    }

    /// Hand a message from the session channel to this consumer.
    pub(crate) async fn dispatch(self: &Arc<Self>, dispatch: MessageDispatch) {
        if self.is_closed() {
            return;
        }
        match self.listener() {
            // keep order behind anything already waiting here
            Some(listener) if self.unconsumed.is_running() && self.unconsumed.is_empty() => {
                self.deliver(dispatch, listener).await;
            }
            _ => self.unconsumed.enqueue(dispatch),
        }
    }

    /// Deliver one backlogged message to the listener, if any.
    pub(crate) async fn iterate(self: &Arc<Self>) -> bool {
        let Some(listener) = self.listener() else {
            return false;
        };
        match self.unconsumed.dequeue_no_wait() {
            Some(dispatch) => {
                self.deliver(dispatch, listener).await;
                true
            }
            None => false,
        }
    }

    async fn deliver(self: &Arc<Self>, mut dispatch: MessageDispatch, listener: MessageListener) {
        if self.drop_if_expired(&dispatch).await {
            return;
        }
        dispatch.message.set_read_only(true);
        if let Err(e) = self.before_consumed(&dispatch).await {
            warn!(parent: &self.span, error = %e, "could not prepare delivery");
        }
        let message = dispatch.message.clone();
        let outcome = AssertUnwindSafe(async move { listener(message).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(parent: &self.span, error = %e, "message listener failed"),
            Err(_) => error!(parent: &self.span, "message listener panicked"),
        }
        self.after_consumed(&dispatch, false).await;
    }

    async fn drop_if_expired(self: &Arc<Self>, dispatch: &MessageDispatch) -> bool {
        if !self.expiry_check || !dispatch.message.is_expired() {
            return false;
        }
        debug!(parent: &self.span, message = ?dispatch.message.message_id, "dropping expired message");
        if let Err(e) = self.before_consumed(dispatch).await {
            warn!(parent: &self.span, error = %e, "could not account expired message");
        }
        self.after_consumed(dispatch, true).await;
        true
    }

    async fn before_consumed(self: &Arc<Self>, dispatch: &MessageDispatch) -> Result<()> {
        let tx = if self.is_transacted() {
            self.session.do_start_transaction().await?;
            self.register_synchronization();
            self.session.transaction().transaction_id()
        } else {
            None
        };
        let ack = (self.policy.on_delivered)(&mut lock(&self.ledger), dispatch, tx.as_ref());
        if let Some(ack) = ack {
            self.session.send_ack(ack).await;
        }
        Ok(())
    }

    async fn after_consumed(&self, dispatch: &MessageDispatch, expired: bool) {
        let ack = (self.policy.on_consumed)(&mut lock(&self.ledger), dispatch, expired);
        if let Some(ack) = ack {
            self.session.send_ack(ack).await;
        }
    }

    fn register_synchronization(self: &Arc<Self>) {
        if !self.synchronization_registered.swap(true, Ordering::AcqRel) {
            self.session
                .transaction()
                .add_synchronization(Arc::new(ConsumerSynchronization {
                    consumer: self.clone(),
                }));
        }
    }

    async fn receive(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Option<Message>> {
        if self.is_closed() {
            return Err(StompError::usage("consumer is closed"));
        }
        if self.listener().is_some() {
            return Err(StompError::usage(
                "cannot receive synchronously while a message listener is set",
            ));
        }
        self.receivers.fetch_add(1, Ordering::AcqRel);
        let _guard = ReceiverGuard(&self.receivers);
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let next = if remaining == Some(Duration::ZERO) {
                self.unconsumed.dequeue_no_wait()
            } else {
                self.unconsumed.dequeue(remaining).await
            };
            let Some(mut dispatch) = next else {
                return Ok(None);
            };
            if self.drop_if_expired(&dispatch).await {
                continue;
            }
            dispatch.message.set_read_only(true);
            self.before_consumed(&dispatch).await?;
            let message = dispatch.message.clone();
            self.after_consumed(&dispatch, false).await;
            return Ok(Some(message));
        }
    }

    async fn install_listener(self: &Arc<Self>, listener: Option<MessageListener>) -> Result<()> {
        if self.is_closed() {
            return Err(StompError::usage("consumer is closed"));
        }
        if listener.is_some() && self.receivers.load(Ordering::Acquire) > 0 {
            return Err(StompError::usage(
                "cannot set a message listener while a receive is in progress",
            ));
        }
        let was_started = self.session.is_started();
        if was_started {
            self.session.stop().await;
        }
        let has_listener = listener.is_some();
        *lock(&self.listener) = listener;
        if has_listener {
            // queued messages go back through the session so the listener
            // sees them first and in order
            let backlog = self.unconsumed.remove_all();
            trace!(parent: &self.span, count = backlog.len(), "redispatching backlog to listener");
            self.session.redispatch(backlog);
        }
        if was_started {
            self.session.start();
        }
        Ok(())
    }

    async fn acknowledge(&self, id: Option<&MessageId>) -> Result<()> {
        if self.is_closed() {
            return Err(StompError::usage("consumer is closed"));
        }
        let Some(on_acknowledge) = self.policy.on_acknowledge else {
            return Err(StompError::usage(format!(
                "acknowledge in {:?} mode, only client and individual modes acknowledge",
                self.policy.mode
            )));
        };
        let acks = on_acknowledge(&mut lock(&self.ledger), id);
        for ack in acks {
            self.session.send_ack_checked(ack).await?;
        }
        Ok(())
    }

    /// Put every delivered message back at the head of the queue with its
    /// redelivery counter bumped. Delivery pauses for the policy's delay.
    pub(crate) async fn rollback(self: &Arc<Self>) {
        let redelivery = lock(&self.ledger).rollback(&self.redelivery_policy);
        let Some(redelivery) = redelivery else {
            return;
        };
        if self.is_closed() {
            return;
        }
        if redelivery.exhausted {
            warn!(
                parent: &self.span,
                count = redelivery.messages.len(),
                "maximum redeliveries exceeded, redelivering without delay"
            );
        }
        let delay = redelivery.delay;
        if !delay.is_zero() {
            self.unconsumed.stop();
        }
        debug!(parent: &self.span, count = redelivery.messages.len(), ?delay, "rolling back delivered messages");
        for dispatch in redelivery.messages.into_iter().rev() {
            self.unconsumed.enqueue_first(dispatch);
        }
        if delay.is_zero() {
            self.resume_delivery();
        } else {
            let me = Arc::downgrade(self);
            tokio::spawn(
                async move {
                    tokio::time::sleep(delay).await;
                    if let Some(consumer) = me.upgrade() {
                        consumer.resume_delivery();
                    }
                }
                .instrument(self.span.clone()),
            );
        }
    }

    fn resume_delivery(&self) {
        if self.is_closed() {
            return;
        }
        if self.session.is_started() {
            self.unconsumed.start();
        }
        self.session.wakeup();
    }

    pub(crate) fn in_progress_clear_required(&self) {
        self.clear_required.store(true, Ordering::Release);
    }

    /// Forget in-flight messages after a transport interruption; the broker
    /// redelivers them to the replayed subscription.
    pub(crate) fn clear_messages_in_progress(&self) {
        if self.clear_required.swap(false, Ordering::AcqRel) {
            self.unconsumed.clear();
            lock(&self.ledger).clear();
            self.synchronization_registered.store(false, Ordering::Release);
            trace!(parent: &self.span, "in-progress messages cleared");
            self.session
                .connection()
                .transport_interruption_processing_complete();
        }
    }

    pub(crate) async fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.session.remove_consumer(&self.id);
        self.unconsumed.close();
        *lock(&self.listener) = None;
        if self.is_transacted()
            && self.session.transaction().in_transaction()
            && !lock(&self.ledger).is_empty()
        {
            debug!(parent: &self.span, "close deferred until the transaction ends");
            self.remove_pending.store(true, Ordering::Release);
            return Ok(());
        }
        self.remove().await
    }

    async fn remove(&self) -> Result<()> {
        let result = self
            .session
            .connection()
            .oneway(Command::new(CommandBody::RemoveInfo(RemoveInfo::Consumer(
                self.id.clone(),
            ))))
            .await;
        debug!(parent: &self.span, "consumer closed");
        result
    }

    async fn finish_deferred_close(&self) {
        if self.remove_pending.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.remove().await {
                warn!(parent: &self.span, error = %e, "deferred unsubscribe failed");
            }
        }
    }

    /// Local teardown after the connection failed.
    pub(crate) fn dispose(&self) {
        self.closed.store(true, Ordering::Release);
        self.unconsumed.close();
        *lock(&self.listener) = None;
    }
}

struct ReceiverGuard<'a>(&'a AtomicUsize);

impl Drop for ReceiverGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct ConsumerSynchronization {
    consumer: Arc<ConsumerInner>,
}

impl Synchronization for ConsumerSynchronization {
    fn before_end(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let c = &self.consumer;
            let tx = c.session.transaction().transaction_id();
            let ack = lock(&c.ledger).flush(tx.as_ref());
            if let Some(ack) = ack {
                c.session.send_ack_checked(ack).await?;
            }
            Ok(())
        })
    }

    fn after_commit(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let c = &self.consumer;
            c.synchronization_registered.store(false, Ordering::Release);
            lock(&c.ledger).clear();
            c.finish_deferred_close().await;
            Ok(())
        })
    }

    fn after_rollback(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let c = &self.consumer;
            c.synchronization_registered.store(false, Ordering::Release);
            if c.remove_pending.load(Ordering::Acquire) {
                lock(&c.ledger).clear();
                c.finish_deferred_close().await;
            } else {
                c.rollback().await;
            }
            Ok(())
        })
    }
}

/// Receives messages from one destination.
///
/// Messages are either pulled with [`receive`](Self::receive) and friends or
/// pushed to a listener set with
/// [`set_message_listener`](Self::set_message_listener); a consumer cannot do
/// both at once.
#[derive(Clone)]
pub struct MessageConsumer {
    inner: Arc<ConsumerInner>,
}

impl MessageConsumer {
    pub(crate) fn new(inner: Arc<ConsumerInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &ConsumerId {
        self.inner.id()
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.info.destination
    }

    pub fn selector(&self) -> Option<&str> {
        self.inner.info.selector.as_deref()
    }

    pub fn subscription_name(&self) -> Option<&str> {
        self.inner.info.subscription_name.as_deref()
    }

    pub fn prefetch_size(&self) -> i32 {
        self.inner.info.prefetch_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Wait for the next message. A receive that is waiting when the
    /// consumer closes returns `Ok(None)`; calling it afterwards is an error.
    pub async fn receive(&self) -> Result<Option<Message>> {
        self.inner.receive(None).await
    }

    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        self.inner.receive(Some(timeout)).await
    }

    pub async fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.inner.receive(Some(Duration::ZERO)).await
    }

    /// Push every message to `listener`. Messages already buffered for this
    /// consumer are delivered to the listener first, in arrival order.
    ///
    /// A listener error is logged and delivery moves on to the next message.
    pub async fn set_message_listener<F, Fut>(&self, listener: F) -> Result<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let listener: MessageListener = Arc::new(move |m| listener(m).boxed());
        self.inner.install_listener(Some(listener)).await
    }

    pub async fn clear_message_listener(&self) -> Result<()> {
        self.inner.install_listener(None).await
    }

    /// Acknowledge everything delivered so far. Fails with
    /// [`StompError::Usage`] outside [`AckMode::Client`] and
    /// [`AckMode::Individual`].
    pub async fn acknowledge(&self) -> Result<()> {
        self.inner.acknowledge(None).await
    }

    /// Acknowledge one message. Under [`AckMode::Client`] this acknowledges
    /// every message delivered before it too.
    pub async fn acknowledge_message(&self, message: &Message) -> Result<()> {
        self.inner.acknowledge(message.message_id.as_ref()).await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
