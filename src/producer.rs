use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{Span, debug, trace};

use crate::commands::{Command, CommandBody, RemoveInfo};
use crate::destination::Destination;
use crate::error::{Result, StompError};
use crate::ids::{LongSequenceGenerator, MessageId, ProducerId};
use crate::message::{DEFAULT_PRIORITY, Message, now_millis};
use crate::session::SessionInner;

#[derive(Debug, Clone)]
struct ProducerSettings {
    persistent: bool,
    priority: u8,
    time_to_live: Option<Duration>,
    disable_timestamp: bool,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            persistent: true,
            priority: DEFAULT_PRIORITY,
            time_to_live: None,
            disable_timestamp: false,
        }
    }
}

pub(crate) struct ProducerInner {
    id: ProducerId,
    session: Arc<SessionInner>,
    destination: Option<Destination>,
    sequence: LongSequenceGenerator,
    settings: Mutex<ProducerSettings>,
    closed: AtomicBool,
    span: Span,
}

impl ProducerInner {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        id: ProducerId,
        destination: Option<Destination>,
    ) -> Arc<Self> {
        let span = tracing::debug_span!("producer", id = %id);
        Arc::new(Self {
            id,
            session,
            destination,
            sequence: LongSequenceGenerator::new(),
            settings: Mutex::new(ProducerSettings::default()),
            closed: AtomicBool::new(false),
            span,
        })
    }

    pub(crate) fn id(&self) -> &ProducerId {
        &self.id
    }

    fn settings(&self) -> MutexGuard<'_, ProducerSettings> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn dispose(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.session.remove_producer(&self.id);
        let result = self
            .session
            .connection()
            .oneway(Command::new(CommandBody::RemoveInfo(RemoveInfo::Producer(
                self.id.clone(),
            ))))
            .await;
        debug!(parent: &self.span, "producer closed");
        result
    }

    async fn send(
        &self,
        destination: Option<Destination>,
        mut message: Message,
        persistent: bool,
        priority: u8,
        time_to_live: Option<Duration>,
    ) -> Result<MessageId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StompError::usage("producer is closed"));
        }
        let destination = destination
            .or_else(|| self.destination.clone())
            .ok_or_else(|| StompError::usage("no destination given and producer has none"))?;
        if priority > 9 {
            return Err(StompError::usage(format!("priority {priority} is outside 0..=9")));
        }
        let disable_timestamp = self.settings().disable_timestamp;

        let id = MessageId::new(&self.id, self.sequence.next_sequence());
        let now = now_millis();
        message.set_read_only(false);
        message.message_id = Some(id.clone());
        message.destination = Some(destination);
        message.persistent = persistent;
        message.priority = priority;
        message.timestamp = if disable_timestamp { 0 } else { now };
        message.set_time_to_live(time_to_live, now);
        message.transaction_id = if self.session.is_transacted() {
            self.session.do_start_transaction().await?;
            self.session.transaction().transaction_id()
        } else {
            None
        };

        trace!(parent: &self.span, message = %id, "sending");
        self.session.send_message(message).await?;
        Ok(id)
    }
}

/// Sends messages, optionally bound to one destination.
#[derive(Clone)]
pub struct MessageProducer {
    inner: Arc<ProducerInner>,
}

impl MessageProducer {
    pub(crate) fn new(inner: Arc<ProducerInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &ProducerId {
        self.inner.id()
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.inner.destination.as_ref()
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.inner.settings().persistent = persistent;
    }

    pub fn set_priority(&self, priority: u8) {
        self.inner.settings().priority = priority;
    }

    /// `None` or zero means messages never expire.
    pub fn set_time_to_live(&self, ttl: Option<Duration>) {
        self.inner.settings().time_to_live = ttl;
    }

    pub fn set_disable_timestamp(&self, disable: bool) {
        self.inner.settings().disable_timestamp = disable;
    }

    /// Send to the producer's destination with its default delivery mode,
    /// priority and time to live.
    pub async fn send(&self, message: Message) -> Result<MessageId> {
        let s = self.inner.settings().clone();
        self.inner
            .send(None, message, s.persistent, s.priority, s.time_to_live)
            .await
    }

    pub async fn send_to(&self, destination: &Destination, message: Message) -> Result<MessageId> {
        let s = self.inner.settings().clone();
        self.inner
            .send(
                Some(destination.clone()),
                message,
                s.persistent,
                s.priority,
                s.time_to_live,
            )
            .await
    }

    /// Send with explicit delivery mode, priority and time to live.
    pub async fn send_with(
        &self,
        destination: Option<&Destination>,
        message: Message,
        persistent: bool,
        priority: u8,
        time_to_live: Option<Duration>,
    ) -> Result<MessageId> {
        self.inner
            .send(destination.cloned(), message, persistent, priority, time_to_live)
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
