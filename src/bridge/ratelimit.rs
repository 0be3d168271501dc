
use fnv::FnvHashMap;

use std::time::{Duration, Instant};

// Once the map holds more keys than this, stale entries get swept.  Keeps an
// open-ended stream of one-off speakers from growing the map forever.
const PRUNE_THRESHOLD: usize = 100;
const PRUNE_WINDOW: Duration = Duration::from_secs(10);

/// Per-speaker, per-channel message throttle for relay traffic.  A channel
/// full of people on the far side of the relay can produce a lot of lines;
/// this keeps any one of them from flooding the game side.
///
/// The caller supplies the clock, so tests don't have to sleep.
pub struct RateLimiter {
    min_interval: Duration,
    last_accepted: FnvHashMap<String, Instant>,
}

impl RateLimiter {
    /// `per_second` of zero disables the limiter entirely.
    pub fn new(per_second: u32) -> RateLimiter {
        let min_interval = if per_second == 0 {
            Duration::from_millis(0)
        } else {
            Duration::from_millis((1000 / u64::from(per_second)).max(1))
        };
        RateLimiter {
            min_interval,
            last_accepted: FnvHashMap::default(),
        }
    }

    /// Should a message from `name` on `channel` at time `now` go through?
    /// Accepting a message starts the clock on the next one.
    pub fn allow(&mut self, channel: &str, name: &str, now: Instant) -> bool {
        if self.min_interval == Duration::from_millis(0) {
            return true;
        }

        let key = format!("{}-{}", channel, name);
        if let Some(last) = self.last_accepted.get(&key) {
            if now.duration_since(*last) < self.min_interval {
                return false;
            }
        }
        self.last_accepted.insert(key, now);

        if self.last_accepted.len() > PRUNE_THRESHOLD {
            self.prune(now);
        }
        true
    }

    /// How many speakers we're currently tracking.
    pub fn tracked(&self) -> usize {
        self.last_accepted.len()
    }

    fn prune(&mut self, now: Instant) {
        self.last_accepted
            .retain(|_, last| now.duration_since(*last) < PRUNE_WINDOW);
    }
}
