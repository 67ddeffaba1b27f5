//! Duplex broker transport.
//!
//! A [`Transport`] owns one I/O task that reads and writes frames through
//! `Framed<_, StompCodec>`, translates them with [`StompWireFormat`], resolves
//! synchronous requests by command id and forwards everything else to the
//! connection as [`TransportEvent`]s. With a [`ReconnectPolicy`] the task
//! survives I/O failures by reconnecting and replaying its session state.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::codec::Framed;
use tracing::{Instrument, Span, debug, info, trace, warn};

use crate::codec::{StompCodec, StompItem};
use crate::commands::{Command, CommandBody, RemoveInfo, Response};
use crate::config::{ReconnectPolicy, TransportOptions};
use crate::error::{Result, StompError};
use crate::translator::{Marshaled, StompWireFormat};

/// Byte stream usable as a transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the byte stream a transport runs over.
///
/// Implement this to run the client over TLS, a proxy or an in-memory pipe.
/// It is called again for every reconnect attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, io::Result<BoxedStream>>;

    /// Human-readable peer description used in logs.
    fn describe(&self) -> String {
        "stream".to_string()
    }
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    options: TransportOptions,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, options: TransportOptions) -> Self {
        Self {
            addr: addr.into(),
            options,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'static, io::Result<BoxedStream>> {
        let addr = self.addr.clone();
        let options = self.options.clone();
        Box::pin(async move {
            let mut last_error = None;
            for peer in tokio::net::lookup_host(addr.as_str()).await? {
                let socket = if peer.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                if let Some(size) = options.send_buffer_size {
                    socket.set_send_buffer_size(size)?;
                }
                if let Some(size) = options.receive_buffer_size {
                    socket.set_recv_buffer_size(size)?;
                }
                match tokio::time::timeout(options.connect_timeout, socket.connect(peer)).await {
                    Ok(Ok(stream)) => {
                        stream.set_nodelay(options.tcp_nodelay)?;
                        return Ok(Box::new(stream) as BoxedStream);
                    }
                    Ok(Err(e)) => last_error = Some(e),
                    Err(_) => {
                        last_error = Some(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connect to {} timed out", peer),
                        ))
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", addr))
            }))
        })
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

/// What the transport reports to its connection.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// An inbound command that is not a response to a request.
    Command(Command),
    /// Terminal failure. The transport is dead.
    Exception(StompError),
    /// The link dropped and a reconnect is in progress.
    Interrupted,
    /// The link is back and session state was replayed.
    Resumed,
}

struct Pending {
    command: Command,
    written: bool,
    tx: oneshot::Sender<Result<Response>>,
}

type PendingMap = HashMap<i32, Pending>;

struct Shared {
    pending: Mutex<PendingMap>,
    failure: Mutex<Option<String>>,
    stopped: AtomicBool,
}

impl Shared {
    fn fail_all(&self, reason: impl Fn() -> StompError) {
        let drained: Vec<Pending> = match self.pending.lock() {
            Ok(mut map) => map.drain().map(|(_, p)| p).collect(),
            Err(_) => return,
        };
        for p in drained {
            let _ = p.tx.send(Err(reason()));
        }
    }

    fn resolve(&self, correlation_id: i32, result: Result<Response>) -> bool {
        let entry = self
            .pending
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&correlation_id));
        match entry {
            Some(p) => {
                let _ = p.tx.send(result);
                true
            }
            None => false,
        }
    }

    fn mark_written(&self, command_id: i32) {
        if let Ok(mut map) = self.pending.lock() {
            if let Some(p) = map.get_mut(&command_id) {
                p.written = true;
            }
        }
    }

    fn failure(&self) -> Option<StompError> {
        if self.stopped.load(Ordering::Acquire) {
            return Some(StompError::ConnectionClosed);
        }
        self.failure
            .lock()
            .ok()
            .and_then(|f| f.clone())
            .map(StompError::ConnectionFailed)
    }
}

struct Running {
    outbound: mpsc::Sender<Command>,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// One physical link to the broker.
pub(crate) struct Transport {
    connector: Arc<dyn Connector>,
    options: TransportOptions,
    skip_destination_formatting: bool,
    command_ids: Arc<AtomicI32>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
    span: Span,
}

impl Transport {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        options: TransportOptions,
        skip_destination_formatting: bool,
        command_ids: Arc<AtomicI32>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let span = tracing::debug_span!("transport", peer = %connector.describe());
        Self {
            connector,
            options,
            skip_destination_formatting,
            command_ids,
            events,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                failure: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
            running: Mutex::new(None),
            span,
        }
    }

    /// A fresh, unstarted transport over the same connector.
    pub(crate) fn renew(&self) -> Self {
        Self::new(
            self.connector.clone(),
            self.options.clone(),
            self.skip_destination_formatting,
            self.command_ids.clone(),
            self.events.clone(),
        )
    }

    pub(crate) fn next_command_id(&self) -> i32 {
        self.command_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn is_started(&self) -> bool {
        self.running.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.shared.failure().is_some()
    }

    /// Open the stream and spawn the I/O task. Starting twice is a no-op.
    pub(crate) async fn start(&self) -> Result<()> {
        if let Some(e) = self.shared.failure() {
            return Err(e);
        }
        if self.is_started() {
            return Ok(());
        }
        let stream = open(self.connector.as_ref(), self.options.connect_timeout).await?;
        let encoding = Arc::new(AtomicBool::new(false));
        let framed = Framed::with_capacity(
            stream,
            StompCodec::with_encoding_flag(encoding.clone())
                .with_max_frame_size(self.options.max_frame_size),
            self.options.read_buffer_capacity,
        );
        let (outbound_tx, outbound_rx) = mpsc::channel(self.options.outbound_queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = IoTask {
            connector: self.connector.clone(),
            options: self.options.clone(),
            wire: StompWireFormat::new(encoding.clone(), self.skip_destination_formatting),
            encoding,
            framed,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            shared: self.shared.clone(),
            events: self.events.clone(),
            connect: None,
            subscriptions: Vec::new(),
        };

        let mut running = self
            .running
            .lock()
            .map_err(|_| StompError::ConnectionFailed("transport state poisoned".into()))?;
        if running.is_some() {
            // lost a start race; the other stream wins
            return Ok(());
        }
        let handle = tokio::spawn(task.run().instrument(self.span.clone()));
        *running = Some(Running {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            handle,
        });
        debug!(parent: &self.span, "transport started");
        Ok(())
    }

    fn outbound(&self) -> Result<mpsc::Sender<Command>> {
        if let Some(e) = self.shared.failure() {
            return Err(e);
        }
        self.running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.outbound.clone()))
            .ok_or_else(|| StompError::ConnectionFailed("transport not started".into()))
    }

    /// Queue a command without waiting for an answer.
    pub(crate) async fn oneway(&self, mut command: Command) -> Result<()> {
        let outbound = self.outbound()?;
        if command.command_id == 0 {
            command.command_id = self.next_command_id();
        }
        trace!(parent: &self.span, command = command.name(), id = command.command_id, "oneway");
        outbound
            .send(command)
            .await
            .map_err(|_| self.shared.failure().unwrap_or(StompError::ConnectionClosed))
    }

    /// Send a command and wait for its correlated response.
    pub(crate) async fn request(&self, mut command: Command, timeout: Duration) -> Result<Response> {
        let outbound = self.outbound()?;
        command.command_id = self.next_command_id();
        command.response_required = true;
        let id = command.command_id;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut map) = self.shared.pending.lock() {
            map.insert(
                id,
                Pending {
                    command: command.clone(),
                    written: false,
                    tx,
                },
            );
        }
        trace!(parent: &self.span, command = command.name(), id, "request");
        if outbound.send(command).await.is_err() {
            self.drop_pending(id);
            return Err(self.shared.failure().unwrap_or(StompError::ConnectionClosed));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.shared.failure().unwrap_or(StompError::ConnectionClosed)),
            Err(_) => {
                self.drop_pending(id);
                Err(StompError::RequestTimeout(timeout))
            }
        }
    }

    fn drop_pending(&self, id: i32) {
        if let Ok(mut map) = self.shared.pending.lock() {
            map.remove(&id);
        }
    }

    /// Stop the I/O task after flushing queued commands. Idempotent.
    pub(crate) async fn stop(&self, timeout: Duration) {
        self.shared.stopped.store(true, Ordering::Release);
        let running = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some(running) = running {
            let _ = running.shutdown.send(());
            drop(running.outbound);
            let mut handle = running.handle;
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!(parent: &self.span, "transport did not stop in time, aborting");
                handle.abort();
            }
            debug!(parent: &self.span, "transport stopped");
        }
        self.shared.fail_all(|| StompError::ConnectionClosed);
    }
}

async fn open(connector: &dyn Connector, timeout: Duration) -> Result<BoxedStream> {
    match tokio::time::timeout(timeout, connector.connect()).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(StompError::Io(e)),
        Err(_) => Err(StompError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out", connector.describe()),
        ))),
    }
}

enum Exit {
    Shutdown,
    Failed(StompError),
}

struct IoTask {
    connector: Arc<dyn Connector>,
    options: TransportOptions,
    wire: StompWireFormat,
    encoding: Arc<AtomicBool>,
    framed: Framed<BoxedStream, StompCodec>,
    outbound: mpsc::Receiver<Command>,
    shutdown: broadcast::Receiver<()>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Last CONNECT, replayed after a reconnect.
    connect: Option<Command>,
    /// Live SUBSCRIBEs in issue order, replayed after a reconnect.
    subscriptions: Vec<Command>,
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

impl IoTask {
    async fn run(mut self) {
        loop {
            let error = match self.pump().await {
                Exit::Shutdown => break,
                Exit::Failed(e) => e,
            };
            let error = match self.options.reconnect {
                Some(policy) if !self.shared.stopped.load(Ordering::Acquire) => {
                    warn!(error = %error, "transport interrupted, reconnecting");
                    let _ = self.events.send(TransportEvent::Interrupted);
                    match self.reconnect(policy).await {
                        Ok(()) => {
                            info!("transport resumed");
                            let _ = self.events.send(TransportEvent::Resumed);
                            continue;
                        }
                        Err(Exit::Shutdown) => break,
                        Err(Exit::Failed(e)) => e,
                    }
                }
                _ => error,
            };
            if self.shared.stopped.load(Ordering::Acquire) {
                break;
            }
            warn!(error = %error, "transport failed");
            if let Ok(mut f) = self.shared.failure.lock() {
                *f = Some(error.to_string());
            }
            let reason = error.to_string();
            self.shared
                .fail_all(|| StompError::ConnectionFailed(reason.clone()));
            let _ = self.events.send(TransportEvent::Exception(error));
            return;
        }
        self.shared.fail_all(|| StompError::ConnectionClosed);
    }

    /// Move frames until shutdown or failure.
    async fn pump(&mut self) -> Exit {
        let mut last_read = Instant::now();
        let mut last_write = Instant::now();
        // already negotiated when pumping a resumed stream
        let mut send_interval = self.wire.negotiated().and_then(|n| n.send_heartbeat);
        let mut receive_interval = self.wire.negotiated().and_then(|n| n.receive_heartbeat);
        let mut write_check: Option<Interval> = send_interval.map(tokio::time::interval);
        let mut read_check: Option<Interval> = receive_interval
            .map(|d| tokio::time::interval((d / 2).max(Duration::from_millis(1))));

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    self.drain().await;
                    let _ = self.framed.close().await;
                    return Exit::Shutdown;
                }
                maybe = self.outbound.recv() => {
                    match maybe {
                        Some(command) => {
                            if let Err(e) = self.write(command).await {
                                return Exit::Failed(e);
                            }
                            last_write = Instant::now();
                        }
                        None => {
                            let _ = self.framed.close().await;
                            return Exit::Shutdown;
                        }
                    }
                }
                item = self.framed.next() => {
                    last_read = Instant::now();
                    match item {
                        Some(Ok(StompItem::Heartbeat)) => trace!("heartbeat received"),
                        Some(Ok(StompItem::Frame(frame))) => {
                            let connected = frame.command == "CONNECTED";
                            if let Err(e) = self.read(frame) {
                                return Exit::Failed(e);
                            }
                            if connected {
                                if let Some(n) = self.wire.negotiated() {
                                    send_interval = n.send_heartbeat;
                                    receive_interval = n.receive_heartbeat;
                                    write_check = send_interval.map(tokio::time::interval);
                                    read_check = receive_interval
                                        .map(|d| tokio::time::interval((d / 2).max(Duration::from_millis(1))));
                                }
                            }
                        }
                        Some(Err(e)) => return Exit::Failed(StompError::Io(e)),
                        None => {
                            return Exit::Failed(StompError::ConnectionFailed(
                                "connection closed by broker".into(),
                            ));
                        }
                    }
                }
                _ = tick(&mut write_check) => {
                    if let Some(interval) = send_interval {
                        if last_write.elapsed() >= interval {
                            if let Err(e) = self.framed.send(StompItem::Heartbeat).await {
                                return Exit::Failed(StompError::Io(e));
                            }
                            last_write = Instant::now();
                        }
                    }
                }
                _ = tick(&mut read_check) => {
                    if let Some(interval) = receive_interval {
                        if last_read.elapsed() > interval * 2 {
                            return Exit::Failed(StompError::ConnectionFailed(format!(
                                "no data from broker for {:?}",
                                last_read.elapsed()
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Write whatever is still queued before closing.
    async fn drain(&mut self) {
        while let Ok(command) = self.outbound.try_recv() {
            if self.write(command).await.is_err() {
                break;
            }
        }
        let _ = self.framed.flush().await;
    }

    fn track(&mut self, command: &Command) {
        match &command.body {
            CommandBody::ConnectionInfo(_) => self.connect = Some(command.clone()),
            CommandBody::ConsumerInfo(_) => self.subscriptions.push(command.clone()),
            CommandBody::RemoveInfo(RemoveInfo::Consumer(id)) => self.subscriptions.retain(
                |c| !matches!(&c.body, CommandBody::ConsumerInfo(info) if &info.consumer_id == id),
            ),
            _ => {}
        }
    }

    async fn write(&mut self, command: Command) -> Result<()> {
        let id = command.command_id;
        match self.wire.marshal(&command) {
            Ok(Marshaled::Frame(frame)) => {
                self.track(&command);
                self.shared.mark_written(id);
                trace!(command = %frame.command, id, "writing frame");
                self.framed.send(StompItem::Frame(frame)).await?;
            }
            Ok(Marshaled::LocalResponse(response)) => {
                self.shared.resolve(response.correlation_id, Ok(response));
            }
            Ok(Marshaled::Heartbeat) => self.framed.send(StompItem::Heartbeat).await?,
            Ok(Marshaled::Nothing) => {}
            Err(e) => {
                let waiter = self
                    .shared
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut map| map.remove(&id));
                match waiter {
                    Some(p) => {
                        let _ = p.tx.send(Err(e));
                    }
                    None => {
                        warn!(command = command.name(), error = %e, "dropping command that cannot be marshaled")
                    }
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, frame: crate::frame::Frame) -> Result<()> {
        let Some(command) = self.wire.unmarshal(frame)? else {
            return Ok(());
        };
        match command.body {
            CommandBody::Response(response) => {
                if !self.shared.resolve(response.correlation_id, Ok(response.clone())) {
                    trace!(id = response.correlation_id, "response with no waiter");
                }
            }
            CommandBody::ExceptionResponse(exception) => {
                let id = exception.correlation_id;
                let error = exception.error;
                if !self
                    .shared
                    .resolve(id, Err(StompError::Broker(error.clone())))
                {
                    let _ = self.events.send(TransportEvent::Command(Command::new(
                        CommandBody::BrokerError(error),
                    )));
                }
            }
            _ => {
                let _ = self.events.send(TransportEvent::Command(command));
            }
        }
        Ok(())
    }

    async fn reconnect(&mut self, policy: ReconnectPolicy) -> std::result::Result<(), Exit> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(max) = policy.max_attempts {
                if attempt > max {
                    return Err(Exit::Failed(StompError::ConnectionFailed(format!(
                        "gave up after {} reconnect attempts",
                        max
                    ))));
                }
            }
            tokio::select! {
                _ = self.shutdown.recv() => return Err(Exit::Shutdown),
                _ = tokio::time::sleep(policy.delay_for(attempt)) => {}
            }
            debug!(attempt, "reconnect attempt");
            let stream = match open(self.connector.as_ref(), self.options.connect_timeout).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(attempt, error = %e, "reconnect failed");
                    continue;
                }
            };
            match self.resume(stream).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(attempt, error = %e, "resume failed"),
            }
        }
    }

    /// Install a new stream and replay CONNECT, subscriptions and written
    /// requests that never got an answer.
    async fn resume(&mut self, stream: BoxedStream) -> Result<()> {
        self.wire.reset();
        self.framed = Framed::with_capacity(
            stream,
            StompCodec::with_encoding_flag(self.encoding.clone())
                .with_max_frame_size(self.options.max_frame_size),
            self.options.read_buffer_capacity,
        );
        if let Some(connect) = self.connect.clone() {
            if let Marshaled::Frame(frame) = self.wire.marshal(&connect)? {
                self.framed.send(StompItem::Frame(frame)).await?;
            }
            self.await_connected().await?;
        }
        let subscriptions = std::mem::take(&mut self.subscriptions);
        for command in &subscriptions {
            if let Marshaled::Frame(frame) = self.wire.marshal(command)? {
                self.framed.send(StompItem::Frame(frame)).await?;
            }
        }
        self.subscriptions = subscriptions;

        let mut replay: Vec<Command> = match self.shared.pending.lock() {
            Ok(map) => map
                .values()
                .filter(|p| p.written)
                .map(|p| p.command.clone())
                .filter(|c| {
                    !matches!(
                        c.body,
                        CommandBody::ConnectionInfo(_) | CommandBody::ConsumerInfo(_)
                    )
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        replay.sort_by_key(|c| c.command_id);
        debug!(
            subscriptions = self.subscriptions.len(),
            requests = replay.len(),
            "replaying session state"
        );
        for command in replay {
            if let Marshaled::Frame(frame) = self.wire.marshal(&command)? {
                self.framed.send(StompItem::Frame(frame)).await?;
            }
        }
        Ok(())
    }

    async fn await_connected(&mut self) -> Result<()> {
        let deadline = self.options.connect_timeout;
        tokio::time::timeout(deadline, self.read_until_connected())
            .await
            .map_err(|_| StompError::RequestTimeout(deadline))??;
        // a CONNECT interrupted before its answer is answered by the replay
        let waiting: Vec<i32> = match self.shared.pending.lock() {
            Ok(map) => map
                .iter()
                .filter(|(_, p)| matches!(p.command.body, CommandBody::ConnectionInfo(_)))
                .map(|(id, _)| *id)
                .collect(),
            Err(_) => Vec::new(),
        };
        for correlation_id in waiting {
            self.shared
                .resolve(correlation_id, Ok(Response { correlation_id }));
        }
        Ok(())
    }

    async fn read_until_connected(&mut self) -> Result<()> {
        loop {
            match self.framed.next().await {
                Some(Ok(StompItem::Frame(frame))) => {
                    let connected = frame.command == "CONNECTED";
                    match self.wire.unmarshal(frame)?.map(|c| c.body) {
                        Some(CommandBody::Response(_)) if connected => return Ok(()),
                        Some(CommandBody::ExceptionResponse(e)) => {
                            return Err(StompError::Broker(e.error));
                        }
                        _ => continue,
                    }
                }
                Some(Ok(StompItem::Heartbeat)) => continue,
                Some(Err(e)) => return Err(StompError::Io(e)),
                None => {
                    return Err(StompError::ConnectionFailed(
                        "connection closed during reconnect".into(),
                    ));
                }
            }
        }
    }
}
