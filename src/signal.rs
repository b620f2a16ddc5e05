//! Cooperative stop signals for a generation run

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Cancellation (asked for by the caller) and abort (a fatal upstream error).
///
/// Both only ever go from unset to set. Workers check them before claiming a
/// scene, before each request and after each sleep; nothing in flight is
/// interrupted.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    cancel: CancellationToken,
    abort: CancellationToken,
}

impl StopSignal {
    /// Fresh, unset signals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caller requested a stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A worker hit a fatal error; nobody should start new work.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Has the caller cancelled?
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Has a worker aborted the run?
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Either signal is set.
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.is_aborted()
    }

    /// Sleeps for `delay`, waking early on either signal.
    ///
    /// Returns `true` when the caller may carry on.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
            _ = self.abort.cancelled() => {}
        }
        !self.should_stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn sleep_runs_to_completion_when_unset() {
        let signal = StopSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn cancel_wakes_a_sleeper() {
        let signal = StopSignal::new();
        let sleeper = signal.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        let carried_on = handle.await.expect("join");
        assert!(!carried_on);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(signal.is_cancelled());
        assert!(!signal.is_aborted());
    }

    #[tokio::test]
    async fn abort_is_separate_from_cancel() {
        let signal = StopSignal::new();
        signal.abort();
        assert!(signal.should_stop());
        assert!(!signal.is_cancelled());
        assert!(!signal.sleep(Duration::from_secs(30)).await);
    }
}
