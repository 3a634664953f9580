use std::time::{Duration, Instant};

/// Rate limiter for conditions that can fire every tick (no receiver,
/// missed deadlines, malformed frames).
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(n)` when the caller should log now, `n` being how many
    /// occurrences were swallowed since the previous line.
    pub fn ready(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_logs_then_suppresses() {
        let start = Instant::now();
        let mut t = LogThrottle::new(Duration::from_secs(1));
        assert_eq!(t.ready(start), Some(0));
        for i in 1..=29 {
            assert_eq!(t.ready(start + Duration::from_millis(i * 33)), None);
        }
        assert_eq!(t.ready(start + Duration::from_millis(1_000)), Some(29));
        assert_eq!(t.ready(start + Duration::from_millis(1_001)), None);
    }
}
