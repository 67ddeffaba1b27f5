//! The logical broker connection.
//!
//! A [`Connection`] is created cheaply and connects lazily on first use. It
//! owns the current [`Transport`], routes inbound messages to the session
//! that owns the target consumer, and turns transport failures into one
//! exception-listener call plus session teardown.

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, trace, warn};

use crate::ack::AckMode;
use crate::commands::{Command, CommandBody, ConnectionInfo, RemoveInfo, Response};
use crate::config::ConnectionConfig;
use crate::destination::{Destination, DestinationKind};
use crate::error::{Result, StompError};
use crate::ids::{
    ConnectionId, ConsumerId, LongSequenceGenerator, SessionId, TransactionId,
    client_id_generator,
};
use crate::latch::CountDownLatch;
use crate::session::{Session, SessionInner};
use crate::transport::{Connector, TcpConnector, Transport, TransportEvent};
use crate::work_queue::WorkQueue;

/// Called once when the connection fails.
pub type ExceptionListener = Arc<dyn Fn(&StompError) + Send + Sync>;
/// Called when the transport is interrupted or resumed.
pub type TransportListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Default)]
struct Listeners {
    exception: Option<ExceptionListener>,
    interrupted: Option<TransportListener>,
    resumed: Option<TransportListener>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    client_id: String,
    config: ConnectionConfig,
    transport: RwLock<Arc<Transport>>,
    state: Mutex<ConnectionState>,
    /// Serialises connect attempts.
    connect_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    transport_failed: AtomicBool,
    first_failure: Mutex<Option<String>>,
    sessions: Mutex<Vec<Arc<SessionInner>>>,
    dispatchers: Mutex<HashMap<ConsumerId, Arc<SessionInner>>>,
    session_ids: LongSequenceGenerator,
    transaction_ids: LongSequenceGenerator,
    temp_destination_ids: LongSequenceGenerator,
    interruption_latch: Mutex<Option<Arc<CountDownLatch>>>,
    listeners: Mutex<Listeners>,
    work_queue: WorkQueue,
    span: Span,
}

impl ConnectionInner {
    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn transport(&self) -> Arc<Transport> {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace_transport(&self, transport: Transport) {
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(transport);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn check_failed(&self) -> Result<()> {
        if self.transport_failed.load(Ordering::Acquire) {
            let reason = lock(&self.first_failure)
                .clone()
                .unwrap_or_else(|| "transport failed".to_string());
            return Err(StompError::ConnectionFailed(reason));
        }
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id.clone(),
            client_id: self.client_id.clone(),
            login: self.config.login.clone(),
            passcode: self.config.passcode.clone(),
            host: self.config.host.clone(),
            heartbeat: self.config.heartbeat,
        }
    }

    /// Make sure the broker link is up, connecting if needed.
    ///
    /// Transient failures are retried with a short linear back-off until
    /// the request timeout runs out. A broker refusal is returned as is.
    pub(crate) async fn check_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => return self.check_failed(),
            ConnectionState::Closing if self.transport().is_started() => {
                return self.check_failed();
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(StompError::ConnectionClosed);
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }
        self.check_failed()?;

        let timeout = self.config.request_timeout;
        let deadline = Instant::now() + timeout;
        let mut attempt: u64 = 0;
        loop {
            let result = {
                let _guard = self.connect_lock.lock().await;
                match self.state() {
                    ConnectionState::Connected => return self.check_failed(),
                    ConnectionState::Closing | ConnectionState::Closed => {
                        return Err(StompError::ConnectionClosed);
                    }
                    _ => {}
                }
                let remaining = deadline
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_millis(1));
                self.try_connect(remaining).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    let backoff = Duration::from_millis(5 * attempt);
                    if Instant::now() + backoff >= deadline {
                        return Err(StompError::ConnectTimeout {
                            timeout,
                            last_error: e.to_string(),
                        });
                    }
                    debug!(parent: &self.span, attempt, error = %e, "connect attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_connect(&self, timeout: Duration) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let transport = self.transport();
        let result = match transport.start().await {
            Ok(()) => {
                transport
                    .request(
                        Command::with_response(CommandBody::ConnectionInfo(self.connection_info())),
                        timeout,
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => {
                self.set_state(ConnectionState::Connected);
                info!(parent: &self.span, client_id = %self.client_id, "connected");
                Ok(())
            }
            Err(e) => {
                // a transport that saw a failed handshake is not reused
                transport.stop(self.config.close_timeout).await;
                self.replace_transport(transport.renew());
                self.set_state(ConnectionState::Disconnected);
                if let StompError::Broker(b) = &e {
                    warn!(parent: &self.span, error = %b, "broker refused the connection");
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn oneway(&self, command: Command) -> Result<()> {
        self.check_connected().await?;
        self.transport().oneway(command).await
    }

    pub(crate) async fn sync_request(&self, command: Command) -> Result<Response> {
        self.check_connected().await?;
        self.transport()
            .request(command, self.config.request_timeout)
            .await
    }

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(&self.id, self.transaction_ids.next_sequence())
    }

    pub(crate) fn add_dispatcher(&self, id: ConsumerId, session: Arc<SessionInner>) {
        lock(&self.dispatchers).insert(id, session);
    }

    pub(crate) fn remove_dispatcher(&self, id: &ConsumerId) {
        lock(&self.dispatchers).remove(id);
    }

    pub(crate) fn remove_session(&self, id: &SessionId) {
        lock(&self.sessions).retain(|s| s.id() != id);
    }

    fn sessions(&self) -> Vec<Arc<SessionInner>> {
        lock(&self.sessions).clone()
    }

    /// One consumer finished clearing its in-flight state after an
    /// interruption.
    pub(crate) fn transport_interruption_processing_complete(&self) {
        if let Some(latch) = lock(&self.interruption_latch).as_ref() {
            latch.count_down();
        }
    }

    async fn on_command(self: &Arc<Self>, command: Command) {
        match command.body {
            CommandBody::MessageDispatch(dispatch) => {
                self.wait_for_interruption_processing().await;
                let session = lock(&self.dispatchers).get(&dispatch.consumer_id).cloned();
                match session {
                    Some(session) => session.dispatch(dispatch),
                    None => warn!(
                        parent: &self.span,
                        consumer = %dispatch.consumer_id,
                        "message for unknown consumer, dropping"
                    ),
                }
            }
            CommandBody::BrokerError(e) => {
                warn!(parent: &self.span, error = %e, "broker error outside any request");
                self.on_exception(StompError::Broker(e));
            }
            CommandBody::KeepAliveInfo => trace!(parent: &self.span, "keep-alive"),
            other => debug!(parent: &self.span, command = other.name(), "ignoring inbound command"),
        }
    }

    async fn wait_for_interruption_processing(&self) {
        let latch = lock(&self.interruption_latch).clone();
        let Some(latch) = latch else {
            return;
        };
        let timeout = self.config.interruption_processing_timeout;
        if !latch.wait(timeout).await {
            warn!(
                parent: &self.span,
                remaining = latch.remaining(),
                "interruption processing not complete after {:?}, resuming delivery",
                timeout
            );
        }
        let mut slot = lock(&self.interruption_latch);
        if slot.as_ref().is_some_and(|l| Arc::ptr_eq(l, &latch)) {
            *slot = None;
        }
    }

    /// Handle a terminal transport failure. Only the first failure of an
    /// established connection is reported; failures while connecting are
    /// returned to the caller instead.
    fn on_exception(self: &Arc<Self>, err: StompError) {
        if self.state() != ConnectionState::Connected {
            debug!(parent: &self.span, error = %err, "transport failure outside an established connection");
            return;
        }
        if self.transport_failed.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.first_failure) = Some(err.to_string());
        error!(parent: &self.span, error = %err, "connection failed");
        let inner = self.clone();
        self.work_queue.execute(Box::pin(async move {
            for session in std::mem::take(&mut *lock(&inner.sessions)) {
                session.dispose();
            }
            lock(&inner.dispatchers).clear();
            inner.transport().stop(inner.config.close_timeout).await;
            let listener = lock(&inner.listeners).exception.clone();
            if let Some(listener) = listener {
                listener(&err);
            }
        }));
    }

    fn on_interrupted(self: &Arc<Self>) {
        let count = lock(&self.dispatchers).len();
        *lock(&self.interruption_latch) = Some(Arc::new(CountDownLatch::new(count)));
        info!(parent: &self.span, consumers = count, "transport interrupted");
        for session in self.sessions() {
            session.clear_messages_in_progress();
        }
        let listener = lock(&self.listeners).interrupted.clone();
        if let Some(listener) = listener {
            self.work_queue.execute(Box::pin(async move { listener() }));
        }
    }

    fn on_resumed(self: &Arc<Self>) {
        info!(parent: &self.span, "transport resumed");
        let listener = lock(&self.listeners).resumed.clone();
        if let Some(listener) = listener {
            self.work_queue.execute(Box::pin(async move { listener() }));
        }
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
                _ => *state = ConnectionState::Closing,
            }
        }
        self.started.store(false, Ordering::Release);
        for session in self.sessions() {
            if let Err(e) = session.close().await {
                warn!(parent: &self.span, session = %session.id(), error = %e, "error closing session");
            }
        }
        let transport = self.transport();
        if transport.is_started() && !self.transport_failed.load(Ordering::Acquire) {
            let goodbye = [
                Command::new(CommandBody::RemoveInfo(RemoveInfo::Connection(self.id.clone()))),
                Command::new(CommandBody::ShutdownInfo),
            ];
            for command in goodbye {
                if let Err(e) = transport.oneway(command).await {
                    debug!(parent: &self.span, error = %e, "could not say goodbye to the broker");
                    break;
                }
            }
        }
        transport.stop(self.config.close_timeout).await;
        self.set_state(ConnectionState::Closed);
        info!(parent: &self.span, "connection closed");
        Ok(())
    }
}

async fn run_events(
    connection: Weak<ConnectionInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = connection.upgrade() else {
            break;
        };
        let handled = AssertUnwindSafe(async {
            match event {
                TransportEvent::Command(command) => inner.on_command(command).await,
                TransportEvent::Exception(e) => inner.on_exception(e),
                TransportEvent::Interrupted => inner.on_interrupted(),
                TransportEvent::Resumed => inner.on_resumed(),
            }
        })
        .catch_unwind()
        .await;
        if handled.is_err() {
            error!(parent: &inner.span, "panic while handling a transport event");
        }
    }
    trace!("connection event loop finished");
}

/// A logical connection to a STOMP broker.
///
/// Cloning is cheap; every clone refers to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect over TCP and complete the STOMP handshake.
    pub async fn connect(addr: &str, config: ConnectionConfig) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(addr, config.transport.clone()));
        let connection = Self::with_connector(connector, config);
        connection.inner.check_connected().await?;
        Ok(connection)
    }

    /// Create a connection over any [`Connector`]. Nothing is sent until the
    /// first operation that needs the broker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_connector(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let id = ConnectionId::generate();
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| client_id_generator().generate_id());
        let span = tracing::info_span!("connection", id = %id);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Transport::new(
            connector,
            config.transport.clone(),
            config.skip_destination_name_formatting,
            Arc::new(AtomicI32::new(0)),
            events_tx,
        );
        let inner = Arc::new(ConnectionInner {
            client_id,
            transport: RwLock::new(Arc::new(transport)),
            state: Mutex::new(ConnectionState::Disconnected),
            connect_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            transport_failed: AtomicBool::new(false),
            first_failure: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
            dispatchers: Mutex::new(HashMap::new()),
            session_ids: LongSequenceGenerator::new(),
            transaction_ids: LongSequenceGenerator::new(),
            temp_destination_ids: LongSequenceGenerator::new(),
            interruption_latch: Mutex::new(None),
            listeners: Mutex::new(Listeners::default()),
            work_queue: WorkQueue::new(64, span.clone()),
            id,
            config,
            span: span.clone(),
        });
        tokio::spawn(run_events(Arc::downgrade(&inner), events_rx).instrument(span));
        Self { inner }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn client_id(&self) -> &str {
        self.inner.client_id()
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.inner.config()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// `true` once the transport failed. A failed connection stays failed.
    pub fn is_failed(&self) -> bool {
        self.inner.transport_failed.load(Ordering::Acquire)
    }

    /// Connect now instead of on first use.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.inner.check_connected().await
    }

    /// Start delivering messages to consumers.
    pub async fn start(&self) -> Result<()> {
        self.inner.check_connected().await?;
        if !self.inner.started.swap(true, Ordering::AcqRel) {
            for session in self.inner.sessions() {
                session.start();
            }
            debug!(parent: &self.inner.span, "delivery started");
        }
        Ok(())
    }

    /// Pause delivery. Messages keep arriving and are queued.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.started.swap(false, Ordering::AcqRel) {
            for session in self.inner.sessions() {
                session.stop().await;
            }
            debug!(parent: &self.inner.span, "delivery stopped");
        }
        Ok(())
    }

    /// Close every session, say DISCONNECT and stop the transport.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    pub async fn create_session(&self, ack_mode: AckMode) -> Result<Session> {
        let id = SessionId::new(&self.inner.id, self.inner.session_ids.next_sequence());
        let session = Session::open(self.inner.clone(), id, ack_mode).await?;
        lock(&self.inner.sessions).push(session.inner().clone());
        if self.inner.is_started() {
            session.inner().start();
        }
        Ok(session)
    }

    pub fn create_temporary_queue(&self) -> Destination {
        self.temporary(DestinationKind::TempQueue)
    }

    pub fn create_temporary_topic(&self) -> Destination {
        self.temporary(DestinationKind::TempTopic)
    }

    fn temporary(&self, kind: DestinationKind) -> Destination {
        let seq = self.inner.temp_destination_ids.next_sequence();
        Destination::temporary(kind, format!("{}:{}", self.inner.id, seq))
    }

    pub fn set_exception_listener(&self, listener: impl Fn(&StompError) + Send + Sync + 'static) {
        lock(&self.inner.listeners).exception = Some(Arc::new(listener));
    }

    pub fn set_transport_interrupted_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.listeners).interrupted = Some(Arc::new(listener));
    }

    pub fn set_transport_resumed_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.listeners).resumed = Some(Arc::new(listener));
    }
}
