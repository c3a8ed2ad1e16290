use std::cmp::min;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1);

/// Backoff for a listener's accept loop: the delay starts at a 5ms floor on the first failure
///  and doubles per consecutive failure up to a 1s cap.
///
/// The accept loop only checks the shutdown flag between attempts, so the cap doubles as an
///  upper bound on shutdown latency while the loop is error-looping.
pub struct AcceptBackoff {
    delay: Duration,
}

impl AcceptBackoff {
    pub fn new() -> AcceptBackoff {
        AcceptBackoff {
            delay: Duration::ZERO,
        }
    }

    /// The delay to sleep after a failed accept.
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            BASE_DELAY
        } else {
            min(self.delay * 2, MAX_DELAY)
        };
        self.delay
    }

    /// Called after a successful accept.
    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}
