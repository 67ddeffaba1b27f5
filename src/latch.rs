use std::time::Duration;

use tokio::sync::watch;

/// A one-shot countdown barrier: `wait` returns once `count_down` has been
/// called as many times as the initial count.
#[derive(Debug)]
pub(crate) struct CountDownLatch {
    remaining: watch::Sender<usize>,
}

impl CountDownLatch {
    pub(crate) fn new(count: usize) -> Self {
        let (remaining, _) = watch::channel(count);
        Self { remaining }
    }

    pub(crate) fn count_down(&self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub(crate) fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Wait until the count reaches zero. Returns `false` on timeout.
    pub(crate) async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.remaining.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}
