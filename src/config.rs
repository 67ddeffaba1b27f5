//! Plain-value configuration for connections, transports and consumers.
//!
//! Every struct has sensible defaults and builder-style setters so a config
//! can be assembled inline:
//!
//! ```
//! use osmium_stomp::{ConnectionConfig, PrefetchPolicy};
//! use std::time::Duration;
//!
//! let config = ConnectionConfig::new()
//!     .login("guest", "guest")
//!     .request_timeout(Duration::from_secs(5))
//!     .prefetch_policy(PrefetchPolicy::default().queue(10));
//! assert_eq!(config.prefetch_policy.queue_prefetch(), 10);
//! ```

use rand::Rng;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::destination::Destination;

/// Upper bound for every prefetch size.
pub const MAX_PREFETCH_SIZE: i32 = i16::MAX as i32 - 1;

/// Maximum number of unacknowledged messages the broker pushes per consumer,
/// by destination kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchPolicy {
    queue: i32,
    topic: i32,
    durable_topic: i32,
    maximum_pending_message_limit: i32,
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        Self {
            queue: 1000,
            topic: MAX_PREFETCH_SIZE,
            durable_topic: 100,
            maximum_pending_message_limit: 0,
        }
    }
}

fn clamp_prefetch(value: i32) -> i32 {
    value.clamp(0, MAX_PREFETCH_SIZE)
}

impl PrefetchPolicy {
    pub fn queue(mut self, value: i32) -> Self {
        self.queue = clamp_prefetch(value);
        self
    }

    pub fn topic(mut self, value: i32) -> Self {
        self.topic = clamp_prefetch(value);
        self
    }

    pub fn durable_topic(mut self, value: i32) -> Self {
        self.durable_topic = clamp_prefetch(value);
        self
    }

    /// Set every destination kind at once.
    pub fn all(self, value: i32) -> Self {
        self.queue(value).topic(value).durable_topic(value)
    }

    pub fn maximum_pending_message_limit(mut self, value: i32) -> Self {
        self.maximum_pending_message_limit = value.max(0);
        self
    }

    pub fn queue_prefetch(&self) -> i32 {
        self.queue
    }

    pub fn topic_prefetch(&self) -> i32 {
        self.topic
    }

    pub fn durable_topic_prefetch(&self) -> i32 {
        self.durable_topic
    }

    pub fn pending_message_limit(&self) -> i32 {
        self.maximum_pending_message_limit
    }

    pub(crate) fn for_destination(&self, destination: &Destination, durable: bool) -> i32 {
        if durable {
            self.durable_topic
        } else if destination.is_topic() {
            self.topic
        } else {
            self.queue
        }
    }
}

/// Back-off schedule applied when a transaction or session rolls back
/// delivered messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedeliveryPolicy {
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub use_exponential_backoff: bool,
    pub use_collision_avoidance: bool,
    /// Jitter applied when collision avoidance is on, in percent.
    pub collision_avoidance_percent: u8,
    /// Negative means unlimited.
    pub maximum_redeliveries: i32,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 5.0,
            use_exponential_backoff: false,
            use_collision_avoidance: false,
            collision_avoidance_percent: 15,
            maximum_redeliveries: 6,
        }
    }
}

impl RedeliveryPolicy {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn exponential_backoff(mut self, on: bool) -> Self {
        self.use_exponential_backoff = on;
        self
    }

    pub fn collision_avoidance(mut self, on: bool, percent: u8) -> Self {
        self.use_collision_avoidance = on;
        self.collision_avoidance_percent = percent.min(100);
        self
    }

    pub fn maximum_redeliveries(mut self, max: i32) -> Self {
        self.maximum_redeliveries = max;
        self
    }

    /// `true` once `counter` is past the configured maximum.
    pub fn is_exhausted(&self, counter: u32) -> bool {
        self.maximum_redeliveries >= 0 && counter as i64 > self.maximum_redeliveries as i64
    }

    /// Delay before redelivering a message whose counter is `counter`.
    ///
    /// Counter 0 is an immediate redelivery. Counter 1 waits the initial
    /// delay; further rollbacks multiply it when exponential back-off is on.
    pub fn redelivery_delay(&self, counter: u32) -> Duration {
        if counter == 0 {
            return Duration::ZERO;
        }
        let mut delay_ms = self.initial_delay.as_millis() as f64;
        if self.use_exponential_backoff && counter > 1 {
            delay_ms *= self.backoff_multiplier.powi(counter as i32 - 1);
        }
        if self.use_collision_avoidance && self.collision_avoidance_percent > 0 {
            let variance = self.collision_avoidance_percent as f64 / 100.0;
            let factor = rand::thread_rng().gen_range(-variance..=variance);
            delay_ms += delay_ms * factor;
        }
        Duration::from_millis(delay_ms.max(0.0).min(u64::MAX as f64) as u64)
    }
}

/// Reconnect schedule for a fault-tolerant transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Socket and framing options for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub send_buffer_size: Option<u32>,
    pub receive_buffer_size: Option<u32>,
    pub tcp_nodelay: bool,
    /// Initial capacity of the codec read buffer.
    pub read_buffer_capacity: usize,
    /// Depth of the outbound command queue.
    pub outbound_queue_depth: usize,
    /// Largest inbound frame accepted; a bigger one fails the transport.
    pub max_frame_size: usize,
    /// When set, I/O failures interrupt the connection instead of failing it.
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            send_buffer_size: None,
            receive_buffer_size: None,
            tcp_nodelay: true,
            read_buffer_capacity: 8 * 1024,
            outbound_queue_depth: 256,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reconnect: None,
        }
    }
}

impl TransportOptions {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn buffer_sizes(mut self, send: u32, receive: u32) -> Self {
        self.send_buffer_size = Some(send);
        self.receive_buffer_size = Some(receive);
        self
    }

    pub fn tcp_nodelay(mut self, on: bool) -> Self {
        self.tcp_nodelay = on;
        self
    }

    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }
}

/// Options for a logical broker connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Generated from the process id and start time when unset.
    pub client_id: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Virtual host sent in the `host` header.
    pub host: Option<String>,
    pub request_timeout: Duration,
    pub close_timeout: Duration,
    pub interruption_processing_timeout: Duration,
    pub prefetch_policy: PrefetchPolicy,
    pub redelivery_policy: RedeliveryPolicy,
    pub async_send: bool,
    pub always_sync_send: bool,
    pub send_acks_async: bool,
    pub dispatch_async: bool,
    /// Heart-beat offer `(send_ms, receive_ms)`. `(0, 0)` disables heartbeats.
    pub heartbeat: (u64, u64),
    pub skip_destination_name_formatting: bool,
    pub message_expiry_check: bool,
    pub transport: TransportOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            login: None,
            passcode: None,
            host: None,
            request_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(15),
            interruption_processing_timeout: Duration::from_secs(10),
            prefetch_policy: PrefetchPolicy::default(),
            redelivery_policy: RedeliveryPolicy::default(),
            async_send: false,
            always_sync_send: false,
            send_acks_async: true,
            dispatch_async: true,
            heartbeat: (0, 0),
            skip_destination_name_formatting: false,
            message_expiry_check: true,
            transport: TransportOptions::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn login(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn interruption_processing_timeout(mut self, timeout: Duration) -> Self {
        self.interruption_processing_timeout = timeout;
        self
    }

    pub fn prefetch_policy(mut self, policy: PrefetchPolicy) -> Self {
        self.prefetch_policy = policy;
        self
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery_policy = policy;
        self
    }

    pub fn async_send(mut self, on: bool) -> Self {
        self.async_send = on;
        self
    }

    pub fn always_sync_send(mut self, on: bool) -> Self {
        self.always_sync_send = on;
        self
    }

    pub fn send_acks_async(mut self, on: bool) -> Self {
        self.send_acks_async = on;
        self
    }

    pub fn heartbeat(mut self, send_ms: u64, receive_ms: u64) -> Self {
        self.heartbeat = (send_ms, receive_ms);
        self
    }

    pub fn skip_destination_name_formatting(mut self, on: bool) -> Self {
        self.skip_destination_name_formatting = on;
        self
    }

    pub fn message_expiry_check(mut self, on: bool) -> Self {
        self.message_expiry_check = on;
        self
    }

    pub fn transport(mut self, options: TransportOptions) -> Self {
        self.transport = options;
        self
    }
}

/// Per-consumer options passed to `Session::create_consumer_with`.
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    pub selector: Option<String>,
    pub no_local: bool,
    pub exclusive: bool,
    pub retroactive: bool,
    pub priority: Option<u8>,
    /// Overrides the connection's prefetch policy.
    pub prefetch: Option<i32>,
    /// Durable subscription name.
    pub subscription_name: Option<String>,
}

impl ConsumerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn no_local(mut self, on: bool) -> Self {
        self.no_local = on;
        self
    }

    pub fn exclusive(mut self, on: bool) -> Self {
        self.exclusive = on;
        self
    }

    pub fn retroactive(mut self, on: bool) -> Self {
        self.retroactive = on;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn prefetch(mut self, size: i32) -> Self {
        self.prefetch = Some(clamp_prefetch(size));
        self
    }

    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.subscription_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefetch_defaults_and_clamp() {
        let p = PrefetchPolicy::default();
        assert_eq!(p.queue_prefetch(), 1000);
        assert_eq!(p.topic_prefetch(), 32766);
        assert_eq!(p.durable_topic_prefetch(), 100);
        let p = p.queue(1_000_000).topic(-5);
        assert_eq!(p.queue_prefetch(), MAX_PREFETCH_SIZE);
        assert_eq!(p.topic_prefetch(), 0);
    }

    #[test]
    fn first_redelivery_is_immediate() {
        let policy = RedeliveryPolicy::default();
        assert_eq!(policy.redelivery_delay(0), Duration::ZERO);
        assert_eq!(policy.redelivery_delay(1), Duration::from_secs(1));
        assert_eq!(policy.redelivery_delay(3), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_multiplies() {
        let policy = RedeliveryPolicy::default()
            .initial_delay(Duration::from_millis(10))
            .exponential_backoff(true)
            .backoff_multiplier(2.0);
        assert_eq!(policy.redelivery_delay(1), Duration::from_millis(10));
        assert_eq!(policy.redelivery_delay(2), Duration::from_millis(20));
        assert_eq!(policy.redelivery_delay(4), Duration::from_millis(80));
    }

    #[test]
    fn collision_avoidance_stays_in_band() {
        let policy = RedeliveryPolicy::default()
            .initial_delay(Duration::from_millis(1000))
            .collision_avoidance(true, 15);
        for _ in 0..200 {
            let d = policy.redelivery_delay(1).as_millis();
            assert!((849..=1150).contains(&d), "delay {} out of band", d);
        }
    }

    #[test]
    fn exhaustion_respects_unlimited() {
        let policy = RedeliveryPolicy::default().maximum_redeliveries(2);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        let unlimited = policy.maximum_redeliveries(-1);
        assert!(!unlimited.is_exhausted(u32::MAX));
    }

    #[test]
    fn reconnect_delay_caps() {
        let policy = ReconnectPolicy::default()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(350));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }
}
