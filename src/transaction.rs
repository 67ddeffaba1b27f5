//! Local session transactions.
//!
//! A transacted session begins a broker transaction lazily, on the first
//! send or delivery. Components that keep per-transaction state register a
//! [`Synchronization`] and are called back around the end of the
//! transaction.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::commands::{Command, CommandBody, TransactionInfo, TransactionType};
use crate::connection::ConnectionInner;
use crate::error::{Result, StompError};
use crate::ids::TransactionId;

/// Callbacks around the end of a transaction.
pub trait Synchronization: Send + Sync {
    /// Runs before COMMIT or ABORT is sent.
    fn before_end(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn after_commit(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn after_rollback(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

pub type TransactionListener = Arc<dyn Fn(&TransactionId) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    started: Option<TransactionListener>,
    committed: Option<TransactionListener>,
    rolled_back: Option<TransactionListener>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerKind {
    Started,
    Committed,
    RolledBack,
}

pub(crate) struct TransactionContext {
    connection: Arc<ConnectionInner>,
    current: Mutex<Option<TransactionId>>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    listeners: Mutex<Listeners>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl TransactionContext {
    pub(crate) fn new(connection: Arc<ConnectionInner>) -> Self {
        Self {
            connection,
            current: Mutex::new(None),
            synchronizations: Mutex::new(Vec::new()),
            listeners: Mutex::new(Listeners::default()),
        }
    }

    pub(crate) fn transaction_id(&self) -> Option<TransactionId> {
        lock(&self.current).clone()
    }

    pub(crate) fn in_transaction(&self) -> bool {
        lock(&self.current).is_some()
    }

    pub(crate) fn add_synchronization(&self, sync: Arc<dyn Synchronization>) {
        lock(&self.synchronizations).push(sync);
    }

    pub(crate) fn set_listener(&self, kind: ListenerKind, listener: Option<TransactionListener>) {
        let mut l = lock(&self.listeners);
        match kind {
            ListenerKind::Started => l.started = listener,
            ListenerKind::Committed => l.committed = listener,
            ListenerKind::RolledBack => l.rolled_back = listener,
        }
    }

    fn fire(&self, kind: ListenerKind, id: &TransactionId) {
        let listener = {
            let l = lock(&self.listeners);
            match kind {
                ListenerKind::Started => l.started.clone(),
                ListenerKind::Committed => l.committed.clone(),
                ListenerKind::RolledBack => l.rolled_back.clone(),
            }
        };
        if let Some(listener) = listener {
            listener(id);
        }
    }

    /// Start a transaction unless one is active.
    pub(crate) async fn begin(&self) -> Result<()> {
        let id = {
            let mut current = lock(&self.current);
            if current.is_some() {
                return Ok(());
            }
            let id = self.connection.next_transaction_id();
            *current = Some(id.clone());
            id
        };
        let command = Command::new(CommandBody::TransactionInfo(TransactionInfo {
            transaction_id: id.clone(),
            kind: TransactionType::Begin,
        }));
        if let Err(e) = self.connection.oneway(command).await {
            *lock(&self.current) = None;
            return Err(e);
        }
        debug!(transaction = %id, "transaction begun");
        self.fire(ListenerKind::Started, &id);
        Ok(())
    }

    pub(crate) async fn commit(&self) -> Result<()> {
        let Some(id) = self.transaction_id() else {
            return Err(StompError::usage("commit without an active transaction"));
        };
        let snapshot: Vec<_> = lock(&self.synchronizations).clone();
        for sync in &snapshot {
            if let Err(e) = sync.before_end().await {
                warn!(transaction = %id, error = %e, "synchronization failed before commit, rolling back");
                self.rollback().await?;
                return Err(e);
            }
        }
        let syncs = self.end();
        let result = self
            .connection
            .sync_request(Command::with_response(CommandBody::TransactionInfo(
                TransactionInfo {
                    transaction_id: id.clone(),
                    kind: TransactionType::Commit,
                },
            )))
            .await;
        match result {
            Ok(_) => {
                debug!(transaction = %id, "transaction committed");
                for sync in &syncs {
                    if let Err(e) = sync.after_commit().await {
                        warn!(transaction = %id, error = %e, "after-commit synchronization failed");
                    }
                }
                self.fire(ListenerKind::Committed, &id);
                Ok(())
            }
            Err(e) => {
                warn!(transaction = %id, error = %e, "commit failed, treating as rolled back");
                for sync in &syncs {
                    if let Err(e) = sync.after_rollback().await {
                        warn!(transaction = %id, error = %e, "after-rollback synchronization failed");
                    }
                }
                self.fire(ListenerKind::RolledBack, &id);
                Err(e)
            }
        }
    }

    /// Roll back the active transaction.
    pub(crate) async fn rollback(&self) -> Result<()> {
        let Some(id) = self.transaction_id() else {
            return Err(StompError::usage("rollback without an active transaction"));
        };
        let snapshot: Vec<_> = lock(&self.synchronizations).clone();
        for sync in &snapshot {
            if let Err(e) = sync.before_end().await {
                warn!(transaction = %id, error = %e, "synchronization failed before rollback");
            }
        }
        let syncs = self.end();
        let result = self
            .connection
            .sync_request(Command::with_response(CommandBody::TransactionInfo(
                TransactionInfo {
                    transaction_id: id.clone(),
                    kind: TransactionType::Rollback,
                },
            )))
            .await;
        for sync in &syncs {
            if let Err(e) = sync.after_rollback().await {
                warn!(transaction = %id, error = %e, "after-rollback synchronization failed");
            }
        }
        self.fire(ListenerKind::RolledBack, &id);
        debug!(transaction = %id, ok = result.is_ok(), "transaction rolled back");
        result.map(|_| ())
    }

    /// Clear the transaction id and take the registered synchronizations.
    /// Both happen before the round-trip so work resumed by the callbacks
    /// starts a fresh transaction.
    fn end(&self) -> Vec<Arc<dyn Synchronization>> {
        *lock(&self.current) = None;
        std::mem::take(&mut *lock(&self.synchronizations))
    }
}
