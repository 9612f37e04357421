use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Lifecycle of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeState {
    /// No link. The pipe reopens lazily on the next acquisition.
    Closed,
    /// Link open, nothing running.
    Idle,
    /// A statement is in flight and exactly one outcome is pending.
    Working,
}

impl fmt::Display for PipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipeState::Closed => "closed",
            PipeState::Idle => "idle",
            PipeState::Working => "working",
        })
    }
}

/// Current state plus the instant it was entered.
#[derive(Debug)]
pub(crate) struct StateClock {
    state: PipeState,
    since: Instant,
}

impl StateClock {
    pub(crate) fn new() -> Self {
        Self {
            state: PipeState::Closed,
            since: Instant::now(),
        }
    }

    pub(crate) fn state(&self) -> PipeState {
        self.state
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.since.elapsed()
    }

    /// Move to `next`, restarting the clock. Returns false when already there.
    pub(crate) fn transition(&mut self, next: PipeState) -> bool {
        if self.state == next {
            return false;
        }
        self.state = next;
        self.since = Instant::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn transition_restarts_clock() {
        let mut clock = StateClock::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(clock.elapsed() >= Duration::from_secs(5));
        assert!(clock.transition(PipeState::Idle));
        assert_eq!(clock.elapsed(), Duration::ZERO);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!clock.transition(PipeState::Idle));
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }
}
