//! Per-consumer acknowledgement bookkeeping.
//!
//! A consumer owns one [`AckLedger`] holding the messages that were handed to
//! the application but not yet acknowledged. What happens to that list when a
//! message is delivered, consumed or explicitly acknowledged depends on the
//! [`AckMode`], which is resolved once into a static [`AckPolicy`] function
//! table when the consumer is created.

use std::collections::VecDeque;
use std::time::Duration;

use crate::commands::{AckType, MessageAck, MessageDispatch};
use crate::config::RedeliveryPolicy;
use crate::destination::Destination;
use crate::ids::{ConsumerId, MessageId, TransactionId};

/// Acknowledgement mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AckMode {
    /// Each message is acknowledged as soon as the application has consumed it.
    #[default]
    Auto,
    /// `acknowledge` confirms every message delivered so far.
    Client,
    /// Each message is confirmed on its own by id.
    Individual,
    /// Acknowledgements are part of the session transaction.
    Transacted,
}

impl AckMode {
    /// Value of the `ack` header on SUBSCRIBE.
    pub fn subscribe_header(self) -> &'static str {
        match self {
            AckMode::Individual => "client-individual",
            _ => "client",
        }
    }

    /// Whether the application confirms messages itself.
    pub fn is_client_acknowledge(self) -> bool {
        matches!(self, AckMode::Client | AckMode::Individual)
    }

    pub(crate) fn policy(self) -> &'static AckPolicy {
        match self {
            AckMode::Auto => &AUTO,
            AckMode::Client => &CLIENT,
            AckMode::Individual => &INDIVIDUAL,
            AckMode::Transacted => &TRANSACTED,
        }
    }
}

/// Ack-mode behaviour as plain functions over the ledger.
pub(crate) struct AckPolicy {
    pub(crate) mode: AckMode,
    /// Called before a message reaches the application.
    pub(crate) on_delivered:
        fn(&mut AckLedger, &MessageDispatch, Option<&TransactionId>) -> Option<MessageAck>,
    /// Called after the application consumed a message. `expired` is set for
    /// messages that were dropped instead of delivered.
    pub(crate) on_consumed: fn(&mut AckLedger, &MessageDispatch, bool) -> Option<MessageAck>,
    /// Called from `acknowledge`; a `None` id means "everything delivered".
    /// Absent for modes where the application never acknowledges.
    pub(crate) on_acknowledge: Option<fn(&mut AckLedger, Option<&MessageId>) -> Vec<MessageAck>>,
}

static AUTO: AckPolicy = AckPolicy {
    mode: AckMode::Auto,
    on_delivered: record,
    on_consumed: ack_all_consumed,
    on_acknowledge: None,
};

static CLIENT: AckPolicy = AckPolicy {
    mode: AckMode::Client,
    on_delivered: record,
    on_consumed: keep,
    on_acknowledge: Some(acknowledge_all),
};

static INDIVIDUAL: AckPolicy = AckPolicy {
    mode: AckMode::Individual,
    on_delivered: record,
    on_consumed: ack_expired_individually,
    on_acknowledge: Some(acknowledge_individually),
};

static TRANSACTED: AckPolicy = AckPolicy {
    mode: AckMode::Transacted,
    on_delivered: record_and_ack_later,
    on_consumed: keep,
    on_acknowledge: None,
};

fn record(
    ledger: &mut AckLedger,
    dispatch: &MessageDispatch,
    _tx: Option<&TransactionId>,
) -> Option<MessageAck> {
    ledger.push(dispatch);
    None
}

fn record_and_ack_later(
    ledger: &mut AckLedger,
    dispatch: &MessageDispatch,
    tx: Option<&TransactionId>,
) -> Option<MessageAck> {
    ledger.push(dispatch);
    ledger.ack_later(tx)
}

fn keep(_: &mut AckLedger, _: &MessageDispatch, _expired: bool) -> Option<MessageAck> {
    None
}

fn ack_all_consumed(
    ledger: &mut AckLedger,
    _dispatch: &MessageDispatch,
    _expired: bool,
) -> Option<MessageAck> {
    let ack = ledger.make_ack_for_all(None);
    ledger.clear();
    ack
}

fn ack_expired_individually(
    ledger: &mut AckLedger,
    dispatch: &MessageDispatch,
    expired: bool,
) -> Option<MessageAck> {
    if !expired {
        return None;
    }
    let id = dispatch.message.message_id.as_ref()?;
    ledger.take_individual(id)
}

fn acknowledge_all(ledger: &mut AckLedger, _id: Option<&MessageId>) -> Vec<MessageAck> {
    let ack = ledger.make_ack_for_all(None);
    ledger.clear();
    ack.into_iter().collect()
}

fn acknowledge_individually(ledger: &mut AckLedger, id: Option<&MessageId>) -> Vec<MessageAck> {
    match id {
        Some(id) => ledger.take_individual(id).into_iter().collect(),
        None => {
            let ids: Vec<MessageId> = ledger
                .delivered
                .iter()
                .filter_map(|d| d.message.message_id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| ledger.take_individual(id))
                .collect()
        }
    }
}

/// Messages rolled back for redelivery.
#[derive(Debug)]
pub(crate) struct Redelivery {
    /// Oldest first.
    pub(crate) messages: Vec<MessageDispatch>,
    pub(crate) delay: Duration,
    pub(crate) exhausted: bool,
}

/// Delivered-but-unacknowledged messages of one consumer.
#[derive(Debug)]
pub(crate) struct AckLedger {
    consumer_id: ConsumerId,
    destination: Option<Destination>,
    /// Oldest at the front.
    delivered: VecDeque<MessageDispatch>,
    /// Deliveries since the last batched flush.
    delivered_counter: i64,
    /// Deliveries that do not consume broker window (local redeliveries).
    additional_window_size: i64,
    /// Tail of `delivered` not yet covered by a flushed ack.
    unflushed: usize,
    prefetch: i32,
}

impl AckLedger {
    pub(crate) fn new(consumer_id: ConsumerId, destination: Option<Destination>, prefetch: i32) -> Self {
        Self {
            consumer_id,
            destination,
            delivered: VecDeque::new(),
            delivered_counter: 0,
            additional_window_size: 0,
            unflushed: 0,
            prefetch,
        }
    }

    fn push(&mut self, dispatch: &MessageDispatch) {
        self.delivered.push_back(dispatch.clone());
        self.unflushed += 1;
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.delivered.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }

    /// Messages not yet covered by any acknowledgement sent to the broker.
    #[cfg(test)]
    pub(crate) fn unacknowledged(&self) -> usize {
        self.unflushed
    }

    pub(crate) fn clear(&mut self) {
        self.delivered.clear();
        self.delivered_counter = 0;
        self.additional_window_size = 0;
        self.unflushed = 0;
    }

    /// Count a transacted delivery and flush a batched ack once half the
    /// prefetch window is used.
    fn ack_later(&mut self, tx: Option<&TransactionId>) -> Option<MessageAck> {
        self.delivered_counter += 1;
        let threshold = (self.prefetch as f64 * 0.5).max(1.0);
        if (self.delivered_counter - self.additional_window_size) as f64 >= threshold {
            let ack = self.flush(tx);
            self.delivered_counter = 0;
            self.additional_window_size = 0;
            return ack;
        }
        None
    }

    /// Ack covering every delivered message not yet flushed.
    pub(crate) fn flush(&mut self, tx: Option<&TransactionId>) -> Option<MessageAck> {
        if self.unflushed == 0 {
            return None;
        }
        let start = self.delivered.len() - self.unflushed;
        let first = self.delivered.get(start)?.message.message_id.clone();
        let last = self.delivered.back()?.message.message_id.clone();
        let ack = MessageAck {
            ack_type: AckType::Consumed,
            consumer_id: self.consumer_id.clone(),
            destination: self.destination.clone(),
            transaction_id: tx.cloned(),
            first_message_id: first,
            last_message_id: last,
            message_count: self.unflushed,
        };
        self.unflushed = 0;
        Some(ack)
    }

    fn make_ack_for_all(&self, tx: Option<&TransactionId>) -> Option<MessageAck> {
        let first = self.delivered.front()?;
        let last = self.delivered.back()?;
        Some(MessageAck {
            ack_type: AckType::Consumed,
            consumer_id: self.consumer_id.clone(),
            destination: self.destination.clone(),
            transaction_id: tx.cloned(),
            first_message_id: first.message.message_id.clone(),
            last_message_id: last.message.message_id.clone(),
            message_count: self.delivered.len(),
        })
    }

    fn take_individual(&mut self, id: &MessageId) -> Option<MessageAck> {
        let pos = self
            .delivered
            .iter()
            .position(|d| d.message.message_id.as_ref() == Some(id))?;
        let before_flushed = pos < self.delivered.len() - self.unflushed;
        self.delivered.remove(pos);
        if !before_flushed {
            self.unflushed -= 1;
        }
        Some(MessageAck {
            ack_type: AckType::Individual,
            consumer_id: self.consumer_id.clone(),
            destination: self.destination.clone(),
            transaction_id: None,
            first_message_id: Some(id.clone()),
            last_message_id: Some(id.clone()),
            message_count: 1,
        })
    }

    /// Take every delivered message back for redelivery.
    ///
    /// The delay is derived from the oldest message's counter before it is
    /// bumped. Every message's counter then grows by one; when the policy's
    /// maximum is exceeded the messages are handed back without delay.
    pub(crate) fn rollback(&mut self, policy: &RedeliveryPolicy) -> Option<Redelivery> {
        let current = self.delivered.front()?.message.redelivery_counter;
        let mut delay = policy.redelivery_delay(current);
        let mut messages: Vec<MessageDispatch> = self.delivered.drain(..).collect();
        for d in &mut messages {
            d.message.redelivery_counter += 1;
            d.redelivery_counter = d.message.redelivery_counter;
        }
        let exhausted = policy.is_exhausted(current + 1);
        if exhausted {
            delay = Duration::ZERO;
        }
        self.additional_window_size += messages.len() as i64;
        self.delivered_counter = 0;
        self.unflushed = 0;
        Some(Redelivery {
            messages,
            delay,
            exhausted,
        })
    }
}
