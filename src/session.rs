//! Sessions: a single-threaded context for producing and consuming.
//!
//! A session owns its consumers and producers, serialises delivery to its
//! consumers on one worker task and, when transacted, groups sends and
//! acknowledgements into broker transactions.

use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{Span, debug, info, trace, warn};

use crate::ack::AckMode;
use crate::commands::{
    Command, CommandBody, ConsumerInfo, MessageAck, MessageDispatch, ProducerInfo, RemoveInfo,
    RemoveSubscriptionInfo, SessionInfo,
};
use crate::connection::ConnectionInner;
use crate::consumer::{ConsumerInner, MessageConsumer};
use crate::config::ConsumerOptions;
use crate::destination::Destination;
use crate::dispatch::{DispatchTarget, SessionExecutor};
use crate::error::{Result, StompError};
use crate::ids::{ConsumerId, LongSequenceGenerator, ProducerId, SessionId, TransactionId};
use crate::message::Message;
use crate::producer::{MessageProducer, ProducerInner};
use crate::transaction::{ListenerKind, TransactionContext};

#[derive(Default)]
struct Members {
    consumers: BTreeMap<ConsumerId, Arc<ConsumerInner>>,
    producers: HashMap<ProducerId, Arc<ProducerInner>>,
}

pub(crate) struct SessionInner {
    id: SessionId,
    connection: Arc<ConnectionInner>,
    ack_mode: AckMode,
    executor: SessionExecutor,
    members: Mutex<Members>,
    consumer_ids: LongSequenceGenerator,
    producer_ids: LongSequenceGenerator,
    transaction: TransactionContext,
    started: AtomicBool,
    closed: AtomicBool,
    span: Span,
}

impl SessionInner {
    pub(crate) fn new(connection: Arc<ConnectionInner>, id: SessionId, ack_mode: AckMode) -> Arc<Self> {
        let span = tracing::debug_span!("session", id = %id, ?ack_mode);
        let close_timeout = connection.config().close_timeout;
        Arc::new_cyclic(|me: &Weak<SessionInner>| {
            let target: Weak<dyn DispatchTarget> = me.clone();
            SessionInner {
                executor: SessionExecutor::new(target, close_timeout, span.clone()),
                transaction: TransactionContext::new(connection.clone()),
                id,
                connection,
                ack_mode,
                members: Mutex::new(Members::default()),
                consumer_ids: LongSequenceGenerator::new(),
                producer_ids: LongSequenceGenerator::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                span,
            }
        })
    }

    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn consumers(&self) -> Vec<Arc<ConsumerInner>> {
        self.members().consumers.values().cloned().collect()
    }

    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    pub(crate) fn connection(&self) -> &Arc<ConnectionInner> {
        &self.connection
    }

    pub(crate) fn transaction(&self) -> &TransactionContext {
        &self.transaction
    }

    pub(crate) fn is_transacted(&self) -> bool {
        self.ack_mode == AckMode::Transacted
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StompError::usage("session is closed"));
        }
        Ok(())
    }

    pub(crate) async fn do_start_transaction(&self) -> Result<()> {
        if self.is_transacted() {
            self.transaction.begin().await?;
        }
        Ok(())
    }

    /// Send an acknowledgement, logging failures.
    pub(crate) async fn send_ack(&self, ack: MessageAck) {
        if let Err(e) = self.send_ack_checked(ack).await {
            warn!(parent: &self.span, error = %e, "failed to send acknowledgement");
        }
    }

    pub(crate) async fn send_ack_checked(&self, ack: MessageAck) -> Result<()> {
        if self.connection.config().send_acks_async {
            self.connection
                .oneway(Command::new(CommandBody::MessageAck(ack)))
                .await
        } else {
            self.connection
                .sync_request(Command::with_response(CommandBody::MessageAck(ack)))
                .await
                .map(|_| ())
        }
    }

    /// Sends wait for a receipt when forced to, or when the message is
    /// persistent and outside a transaction and async sends are off.
    pub(crate) async fn send_message(&self, message: Message) -> Result<()> {
        let config = self.connection.config();
        let sync = config.always_sync_send
            || (!config.async_send && message.persistent && message.transaction_id.is_none());
        let body = CommandBody::Message(Box::new(message));
        if sync {
            self.connection
                .sync_request(Command::with_response(body))
                .await
                .map(|_| ())
        } else {
            self.connection.oneway(Command::new(body)).await
        }
    }

    /// Route an inbound message to this session's worker.
    pub(crate) fn dispatch(&self, dispatch: MessageDispatch) {
        if self.closed.load(Ordering::Acquire) {
            trace!(parent: &self.span, "session closed, dropping dispatch");
            return;
        }
        self.executor.execute(dispatch);
    }

    /// Put messages back at the head of the session queue, oldest first.
    pub(crate) fn redispatch(&self, dispatches: Vec<MessageDispatch>) {
        for dispatch in dispatches.into_iter().rev() {
            self.executor.execute_first(dispatch);
        }
    }

    pub(crate) fn wakeup(&self) {
        self.executor.wakeup();
    }

    pub(crate) fn start(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.started.store(true, Ordering::Release);
        for consumer in self.consumers() {
            consumer.start();
        }
        self.executor.start();
    }

    pub(crate) async fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.executor.stop().await;
        for consumer in self.consumers() {
            consumer.stop();
        }
    }

    pub(crate) fn remove_consumer(&self, id: &ConsumerId) {
        self.members().consumers.remove(id);
        self.connection.remove_dispatcher(id);
    }

    pub(crate) fn remove_producer(&self, id: &ProducerId) {
        self.members().producers.remove(id);
    }

    /// Called when the transport was interrupted. Queued messages are
    /// dropped and every consumer clears its in-flight state, on the worker
    /// when one is running so an in-progress delivery finishes first.
    pub(crate) fn clear_messages_in_progress(&self) {
        self.executor.channel().clear();
        let consumers = self.consumers();
        for consumer in &consumers {
            consumer.in_progress_clear_required();
        }
        if self.executor.is_running() {
            self.executor.wakeup();
        } else {
            for consumer in &consumers {
                consumer.clear_messages_in_progress();
            }
        }
    }

    async fn iterate_once(&self) -> bool {
        let consumers = self.consumers();
        for consumer in &consumers {
            consumer.clear_messages_in_progress();
        }
        for consumer in &consumers {
            if consumer.iterate().await {
                return true;
            }
        }
        let Some(dispatch) = self.executor.channel().dequeue_no_wait() else {
            return false;
        };
        match consumers.iter().find(|c| c.id() == &dispatch.consumer_id) {
            Some(consumer) => consumer.dispatch(dispatch).await,
            None => debug!(
                parent: &self.span,
                consumer = %dispatch.consumer_id,
                "no such consumer in session, dropping message"
            ),
        }
        true
    }

    async fn create_consumer(
        self: &Arc<Self>,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<MessageConsumer> {
        self.check_closed()?;
        let durable = options.subscription_name.is_some();
        if durable && !destination.is_topic() {
            return Err(StompError::usage(format!(
                "durable subscriptions need a topic, got {destination}"
            )));
        }
        let config = self.connection.config();
        let prefetch = options
            .prefetch
            .unwrap_or_else(|| config.prefetch_policy.for_destination(destination, durable));
        let info = ConsumerInfo {
            consumer_id: ConsumerId::new(&self.id, self.consumer_ids.next_sequence()),
            destination: destination.clone(),
            ack_mode: self.ack_mode,
            selector: options.selector,
            subscription_name: options.subscription_name,
            prefetch_size: prefetch,
            maximum_pending_message_limit: config.prefetch_policy.pending_message_limit(),
            priority: options.priority,
            exclusive: options.exclusive,
            retroactive: options.retroactive,
            no_local: options.no_local,
            dispatch_async: config.dispatch_async,
        };
        let consumer = ConsumerInner::new(self.clone(), info.clone());
        let id = consumer.id().clone();
        // routable before SUBSCRIBE goes out so no early message is lost
        self.members().consumers.insert(id.clone(), consumer.clone());
        self.connection.add_dispatcher(id.clone(), self.clone());
        if self.is_started() {
            consumer.start();
        }
        let subscribed = self
            .connection
            .sync_request(Command::with_response(CommandBody::ConsumerInfo(info)))
            .await;
        if let Err(e) = subscribed {
            consumer.dispose();
            self.remove_consumer(&id);
            return Err(e);
        }
        debug!(parent: &self.span, consumer = %id, destination = %destination, prefetch, "consumer created");
        Ok(MessageConsumer::new(consumer))
    }

    async fn create_producer(self: &Arc<Self>, destination: Option<&Destination>) -> Result<MessageProducer> {
        self.check_closed()?;
        let id = ProducerId::new(&self.id, self.producer_ids.next_sequence());
        self.connection
            .sync_request(Command::with_response(CommandBody::ProducerInfo(ProducerInfo {
                producer_id: id.clone(),
                destination: destination.cloned(),
            })))
            .await?;
        let producer = ProducerInner::new(self.clone(), id.clone(), destination.cloned());
        self.members().producers.insert(id, producer.clone());
        Ok(MessageProducer::new(producer))
    }

    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.stop().await;
        for consumer in self.consumers() {
            if let Err(e) = consumer.close().await {
                warn!(parent: &self.span, consumer = %consumer.id(), error = %e, "error closing consumer");
            }
        }
        let producers: Vec<_> = self.members().producers.values().cloned().collect();
        for producer in producers {
            if let Err(e) = producer.close().await {
                warn!(parent: &self.span, producer = %producer.id(), error = %e, "error closing producer");
            }
        }
        if self.is_transacted() && self.transaction.in_transaction() {
            if let Err(e) = self.transaction.rollback().await {
                warn!(parent: &self.span, error = %e, "rollback on close failed");
            }
        }
        self.closed.store(true, Ordering::Release);
        let removed = self
            .connection
            .oneway(Command::new(CommandBody::RemoveInfo(RemoveInfo::Session(
                self.id.clone(),
            ))))
            .await;
        self.connection.remove_session(&self.id);
        self.executor.close().await;
        debug!(parent: &self.span, "session closed");
        removed
    }

    /// Local teardown after the connection failed. No broker traffic.
    pub(crate) fn dispose(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.started.store(false, Ordering::Release);
        self.executor.shutdown();
        let members = std::mem::take(&mut *self.members());
        for (id, consumer) in members.consumers {
            consumer.dispose();
            self.connection.remove_dispatcher(&id);
        }
        for producer in members.producers.values() {
            producer.dispose();
        }
        debug!(parent: &self.span, "session disposed");
    }
}

impl DispatchTarget for SessionInner {
    fn iterate(self: Arc<Self>) -> BoxFuture<'static, bool> {
        Box::pin(async move { self.iterate_once().await })
    }
}

/// A single-threaded context for producing and consuming messages.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) async fn open(connection: Arc<ConnectionInner>, id: SessionId, ack_mode: AckMode) -> Result<Self> {
        connection
            .sync_request(Command::with_response(CommandBody::SessionInfo(SessionInfo {
                session_id: id.clone(),
            })))
            .await?;
        let inner = SessionInner::new(connection, id, ack_mode);
        info!(parent: &inner.span, "session opened");
        Ok(Self { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    pub fn id(&self) -> &SessionId {
        self.inner.id()
    }

    pub fn ack_mode(&self) -> AckMode {
        self.inner.ack_mode
    }

    pub fn is_transacted(&self) -> bool {
        self.inner.is_transacted()
    }

    /// Id of the running transaction, if any.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.inner.transaction.transaction_id()
    }

    pub async fn create_consumer(&self, destination: &Destination) -> Result<MessageConsumer> {
        self.inner
            .create_consumer(destination, ConsumerOptions::default())
            .await
    }

    pub async fn create_consumer_with(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<MessageConsumer> {
        self.inner.create_consumer(destination, options).await
    }

    /// Durable topic subscriber. The subscription survives the consumer and
    /// is removed with [`unsubscribe`](Self::unsubscribe).
    pub async fn create_durable_consumer(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<MessageConsumer> {
        let mut options = ConsumerOptions::new().durable(name).no_local(no_local);
        if let Some(selector) = selector {
            options = options.selector(selector);
        }
        self.inner.create_consumer(topic, options).await
    }

    pub async fn create_producer(&self, destination: Option<&Destination>) -> Result<MessageProducer> {
        self.inner.create_producer(destination).await
    }

    /// Remove a durable subscription.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.inner.check_closed()?;
        let conn = &self.inner.connection;
        conn.sync_request(Command::with_response(CommandBody::RemoveSubscriptionInfo(
            RemoveSubscriptionInfo {
                client_id: conn.client_id().to_string(),
                subscription_name: name.to_string(),
            },
        )))
        .await
        .map(|_| ())
    }

    pub async fn commit(&self) -> Result<()> {
        self.inner.check_closed()?;
        if !self.is_transacted() {
            return Err(StompError::usage("commit on a session that is not transacted"));
        }
        self.inner.transaction.commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.inner.check_closed()?;
        if !self.is_transacted() {
            return Err(StompError::usage("rollback on a session that is not transacted"));
        }
        self.inner.transaction.rollback().await
    }

    /// Redeliver every unacknowledged message, oldest first.
    pub async fn recover(&self) -> Result<()> {
        self.inner.check_closed()?;
        if self.is_transacted() {
            return Err(StompError::usage("recover on a transacted session, use rollback"));
        }
        let was_started = self.inner.is_started();
        self.inner.stop().await;
        for consumer in self.inner.consumers() {
            consumer.rollback().await;
        }
        if was_started {
            self.inner.start();
        }
        Ok(())
    }

    /// Acknowledge everything delivered on every consumer of this session.
    pub async fn acknowledge(&self) -> Result<()> {
        self.inner.check_closed()?;
        if !self.inner.ack_mode.is_client_acknowledge() {
            return Err(StompError::usage(format!(
                "acknowledge on a session in {:?} mode",
                self.inner.ack_mode
            )));
        }
        for consumer in self.inner.consumers() {
            MessageConsumer::new(consumer).acknowledge().await?;
        }
        Ok(())
    }

    pub fn on_transaction_started(&self, listener: impl Fn(&TransactionId) + Send + Sync + 'static) {
        self.inner
            .transaction
            .set_listener(ListenerKind::Started, Some(Arc::new(listener)));
    }

    pub fn on_transaction_committed(&self, listener: impl Fn(&TransactionId) + Send + Sync + 'static) {
        self.inner
            .transaction
            .set_listener(ListenerKind::Committed, Some(Arc::new(listener)));
    }

    pub fn on_transaction_rolled_back(&self, listener: impl Fn(&TransactionId) + Send + Sync + 'static) {
        self.inner
            .transaction
            .set_listener(ListenerKind::RolledBack, Some(Arc::new(listener)));
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
