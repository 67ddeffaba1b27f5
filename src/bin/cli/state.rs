use chrono::{DateTime, Local};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Maximum number of messages to keep for the report
pub const MAX_MESSAGES: usize = 1000;

/// Statistics for a single subscription destination
#[derive(Debug, Clone, Default)]
pub struct SubStats {
    pub message_count: u64,
    pub redelivered_count: u64,
}

/// A received message as recorded for the report
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub timestamp: DateTime<Local>,
    pub destination: String,
    pub body: String,
    pub redelivered: bool,
}

/// Console session state shared between the prompt and consumer listeners
pub struct AppState {
    pub start_time: DateTime<Local>,

    pub host: String,
    pub user: String,
    pub ack_mode: String,

    /// Subscriptions: destination -> stats
    pub subscriptions: HashMap<String, SubStats>,

    pub sent_count: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub interruptions: u64,

    pub messages: VecDeque<ReceivedMessage>,
}

impl AppState {
    pub fn new(host: String, user: String, ack_mode: String) -> Self {
        Self {
            start_time: Local::now(),
            host,
            user,
            ack_mode,
            subscriptions: HashMap::new(),
            sent_count: 0,
            commits: 0,
            rollbacks: 0,
            interruptions: 0,
            messages: VecDeque::with_capacity(MAX_MESSAGES),
        }
    }

    pub fn record_message(&mut self, destination: &str, body: String, redelivered: bool) {
        let stats = self.subscriptions.entry(destination.to_string()).or_default();
        stats.message_count += 1;
        if redelivered {
            stats.redelivered_count += 1;
        }

        self.messages.push_back(ReceivedMessage {
            timestamp: Local::now(),
            destination: destination.to_string(),
            body,
            redelivered,
        });
        while self.messages.len() > MAX_MESSAGES {
            self.messages.pop_front();
        }
    }

    pub fn register_subscription(&mut self, destination: &str) {
        self.subscriptions.entry(destination.to_string()).or_default();
    }

    pub fn total_message_count(&self) -> u64 {
        self.subscriptions.values().map(|s| s.message_count).sum()
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    pub fn generate_summary(&self) -> String {
        self.generate_summary_with_options(false, 80)
    }

    /// Session report, optionally followed by the message history
    pub fn generate_summary_with_options(&self, include_messages: bool, max_width: usize) -> String {
        let rule = "═".repeat(max_width);
        let end_time = Local::now();
        let total_secs = end_time.signed_duration_since(self.start_time).num_seconds();

        let mut lines = vec![
            rule.clone(),
            "  osmium-stomp Session Report".to_string(),
            rule.clone(),
            format!("  Host:       {}", self.host),
            format!("  User:       {}", self.user),
            format!("  Ack mode:   {}", self.ack_mode),
            format!("  Started:    {}", self.start_time.format("%Y-%m-%d %H:%M:%S")),
            format!("  Ended:      {}", end_time.format("%Y-%m-%d %H:%M:%S")),
            format!("  Duration:   {}m {}s", total_secs / 60, total_secs % 60),
            String::new(),
            "  Subscriptions:".to_string(),
        ];

        let mut subs: Vec<_> = self.subscriptions.iter().collect();
        subs.sort_by(|a, b| b.1.message_count.cmp(&a.1.message_count).then(a.0.cmp(b.0)));

        let width = subs.iter().map(|(d, _)| d.len()).max().unwrap_or(20).min(40);
        for (dest, stats) in &subs {
            lines.push(format!(
                "    {:width$} {:>6} ({} redelivered)",
                truncate_str(dest, width),
                stats.message_count,
                stats.redelivered_count,
            ));
        }
        lines.push(format!("    {:─>w$}", "", w = width + 7));
        lines.push(format!("    {:width$} {:>6}", "Total", self.total_message_count()));
        lines.push(String::new());
        lines.push(format!("  Messages sent:        {}", self.sent_count));
        lines.push(format!("  Commits / rollbacks:  {} / {}", self.commits, self.rollbacks));
        lines.push(format!("  Transport interrupts: {}", self.interruptions));

        if include_messages && !self.messages.is_empty() {
            let thin = "─".repeat(max_width);
            lines.push(String::new());
            lines.push(thin.clone());
            lines.push("  Message History".to_string());
            lines.push(thin);
            for msg in &self.messages {
                let marker = if msg.redelivered { "*" } else { " " };
                let prefix = format!("  {}{} [{}] ", msg.timestamp.format("%H:%M:%S"), marker, msg.destination);
                let body = truncate_str(&msg.body, max_width.saturating_sub(prefix.chars().count()));
                lines.push(format!("{}{}", prefix, body));
            }
        }

        lines.push(rule);
        lines.join("\n")
    }
}

/// Truncate to `max_len` characters, adding "..." if truncated
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        ".".repeat(max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

/// State shared with listener callbacks, which may run on any worker.
#[derive(Clone)]
pub struct SharedState(Arc<Mutex<AppState>>);

impl SharedState {
    pub fn new(host: String, user: String, ack_mode: String) -> Self {
        Self(Arc::new(Mutex::new(AppState::new(host, user, ack_mode))))
    }

    /// Lock the state. A listener that panicked mid-update leaves counters
    /// that are still good enough for a report.
    pub fn lock(&self) -> MutexGuard<'_, AppState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 8), "hello...");
        assert_eq!(truncate_str("ééééé", 4), "é...");
        assert_eq!(truncate_str("abc", 2), "..");
    }

    #[test]
    fn summary_lists_subscriptions_by_volume() {
        let mut state = AppState::new("localhost:61613".into(), "guest".into(), "auto".into());
        state.register_subscription("/queue/quiet");
        state.record_message("/queue/busy", "a".into(), false);
        state.record_message("/queue/busy", "b".into(), true);

        let summary = state.generate_summary();
        let busy = summary.find("/queue/busy").unwrap();
        let quiet = summary.find("/queue/quiet").unwrap();
        assert!(busy < quiet);
        assert!(summary.contains("(1 redelivered)"));
        assert!(!summary.contains("Message History"));

        let report = state.generate_summary_with_options(true, 80);
        assert!(report.contains("Message History"));
        assert!(report.contains("* [/queue/busy] b"));
    }

    #[test]
    fn history_is_bounded() {
        let mut state = AppState::new("h".into(), "u".into(), "auto".into());
        for i in 0..MAX_MESSAGES + 5 {
            state.record_message("/queue/a", i.to_string(), false);
        }
        assert_eq!(state.messages.len(), MAX_MESSAGES);
        assert_eq!(state.messages.front().unwrap().body, "5");
        assert_eq!(state.total_message_count(), (MAX_MESSAGES + 5) as u64);
    }
}
