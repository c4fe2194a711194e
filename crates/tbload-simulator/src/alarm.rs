//! Alarm injection cadence.
//!
//! Runs on its own token bucket so the alarm rate is independent of the base
//! telemetry rate. The injector only decides; the payload registry turns the
//! flag into out-of-range values.

use crate::rate::TokenBucket;
use std::time::Duration;
use tokio::time::Instant;

/// Capacity window for the alarm bucket
const ALARM_BURST_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AlarmInjector {
    bucket: Option<TokenBucket>,
    injected: u64,
}

impl AlarmInjector {
    /// `alarms_per_sec` of zero disables injection.
    pub fn new(alarms_per_sec: f64, now: Instant) -> Self {
        let bucket = (alarms_per_sec > 0.0)
            .then(|| TokenBucket::with_burst_window(alarms_per_sec, ALARM_BURST_WINDOW, now));
        Self {
            bucket,
            injected: 0,
        }
    }

    pub fn disabled() -> Self {
        Self {
            bucket: None,
            injected: 0,
        }
    }

    /// Whether the publish event at `now` should carry an alarm.
    pub fn should_inject(&mut self, now: Instant) -> bool {
        let Some(bucket) = self.bucket.as_mut() else {
            return false;
        };
        bucket.refill(now);
        let inject = bucket.try_take();
        if inject {
            self.injected += 1;
        }
        inject
    }

    pub fn injected(&self) -> u64 {
        self.injected
    }
}
