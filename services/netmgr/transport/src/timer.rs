//! Per-socket deadlines.
//!
//! Timers are plain deadlines stored in the socket state. The socket's I/O
//! task sleeps until the earliest armed deadline, so a timer never outlives
//! or leaves the worker that owns its socket.

use std::time::Duration;
use tokio::time::Instant;

/// One restartable deadline
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SocketTimer {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl SocketTimer {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.filter(|t| !t.is_zero()),
            deadline: None,
        }
    }

    /// Change the interval, re-arming if the timer was running
    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout.filter(|t| !t.is_zero());
        if self.is_running() {
            self.restart();
        }
    }

    /// Arm if not already running
    pub(crate) fn start(&mut self) {
        if !self.is_running() {
            self.restart();
        }
    }

    /// Arm from now, replacing any previous deadline
    pub(crate) fn restart(&mut self) {
        self.deadline = self.timeout.map(|t| Instant::now() + t);
    }

    pub(crate) fn stop(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }
}

/// Earliest of two optional deadlines
pub(crate) fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_lifecycle() {
        let mut timer = SocketTimer::new(Some(Duration::from_secs(2)));
        assert!(!timer.is_running());

        timer.start();
        let first = timer.deadline().unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;

        // start() keeps a running deadline, restart() pushes it out
        timer.start();
        assert_eq!(timer.deadline(), Some(first));
        timer.restart();
        assert!(timer.deadline().unwrap() > first);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(timer.expired(Instant::now()));

        timer.stop();
        assert!(!timer.expired(Instant::now()));
    }

    #[test]
    fn test_disabled_timer() {
        let mut timer = SocketTimer::new(None);
        timer.start();
        assert!(!timer.is_running());

        timer.set_timeout(Some(Duration::ZERO));
        timer.start();
        assert!(!timer.is_running());
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(Some(now), Some(later)), Some(now));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(None, None), None);
    }
}
