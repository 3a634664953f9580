use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Fresh,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// Emitted once per staleness episode, on the first poll past the threshold.
    BecameStale { silent_for: Duration },
}

/// Command-staleness guard for the host loop.
///
/// Edge-triggered: `poll` reports the Fresh -> Stale transition once, and
/// only an accepted command brings the state back to Fresh.
#[derive(Debug)]
pub struct Watchdog {
    threshold: Duration,
    last_accepted: Instant,
    state: WatchdogState,
}

impl Watchdog {
    pub fn new(threshold: Duration, start: Instant) -> Self {
        Self {
            threshold,
            last_accepted: start,
            state: WatchdogState::Fresh,
        }
    }

    /// Record a structurally valid command. Returns `true` if this ended a
    /// staleness episode.
    pub fn accept(&mut self, now: Instant) -> bool {
        self.last_accepted = now;
        let recovered = self.state == WatchdogState::Stale;
        self.state = WatchdogState::Fresh;
        recovered
    }

    pub fn poll(&mut self, now: Instant) -> Option<WatchdogEvent> {
        let silent_for = now.saturating_duration_since(self.last_accepted);
        if self.state == WatchdogState::Fresh && silent_for > self.threshold {
            self.state = WatchdogState::Stale;
            return Some(WatchdogEvent::BecameStale { silent_for });
        }
        None
    }

    #[cfg(test)]
    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn is_stale(&self) -> bool {
        self.state == WatchdogState::Stale
    }

    #[cfg(test)]
    pub fn last_accepted(&self) -> Instant {
        self.last_accepted
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(500);

    #[test]
    fn starts_fresh() {
        let start = Instant::now();
        let mut w = Watchdog::new(T, start);
        assert_eq!(w.state(), WatchdogState::Fresh);
        assert_eq!(w.poll(start + T), None, "exactly at the threshold is still fresh");
        assert!(!w.is_stale());
    }

    #[test]
    fn goes_stale_once_per_episode() {
        let start = Instant::now();
        let mut w = Watchdog::new(T, start);
        let events: Vec<_> = (0..60)
            .filter_map(|i| w.poll(start + Duration::from_millis(i * 33)))
            .collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            WatchdogEvent::BecameStale { silent_for } if silent_for == Duration::from_millis(528)
        ));
        assert!(w.is_stale());
    }

    #[test]
    fn accept_recovers_regardless_of_how_long_it_was_stale() {
        let start = Instant::now();
        let mut w = Watchdog::new(T, start);
        let late = start + Duration::from_secs(3_600);
        assert!(w.poll(late).is_some());
        assert!(w.accept(late));
        assert_eq!(w.state(), WatchdogState::Fresh);
        assert_eq!(w.last_accepted(), late);
        assert!(!w.accept(late), "second accept is not a recovery");

        // A new silence is a new episode with its own warning.
        assert!(w.poll(late + T + Duration::from_millis(1)).is_some());
    }

    #[test]
    fn polling_does_not_move_the_timestamp() {
        let start = Instant::now();
        let mut w = Watchdog::new(T, start);
        for i in 0..10 {
            w.poll(start + Duration::from_millis(i * 100));
        }
        assert_eq!(w.last_accepted(), start);
    }
}
