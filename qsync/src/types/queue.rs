use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Identifier of a tick. Ticks are cut into the queue in increasing order.
pub type TickId = i64;

/// Snapshot of a consumer's progress on a queue, as seen by the provider.
///
/// Fetched fresh on every poll, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    /// Age of the newest tick of the queue.
    pub ticker_lag: Duration,
    /// Age of the last tick the consumer finished. Absent before its first batch.
    pub consumer_lag: Option<Duration>,
    /// Last tick the consumer finished.
    pub last_tick: Option<TickId>,
    /// Provider clock when the information was read.
    pub observed_at: DateTime<Utc>,
}

impl ConsumerInfo {
    /// Point in time up to which the consumer has replayed changes.
    pub fn position(&self) -> Option<DateTime<Utc>> {
        let lag = TimeDelta::from_std(self.consumer_lag?).ok()?;
        Some(self.observed_at - lag)
    }

    /// Returns `true` once the consumer replayed strictly past `timestamp`.
    pub fn has_replayed_past(&self, timestamp: DateTime<Utc>) -> bool {
        self.position().is_some_and(|position| position > timestamp)
    }

    /// Returns `true` once the consumer finished tick `tick_id` or a later one.
    pub fn has_reached_tick(&self, tick_id: TickId) -> bool {
        self.last_tick.is_some_and(|last_tick| last_tick >= tick_id)
    }

    /// Returns `true` if the consumer is not lagging behind the ticker by more than
    /// `margin`.
    ///
    /// A consumer that has never finished a batch is not healthy.
    pub fn is_healthy(&self, margin: Duration) -> bool {
        self.consumer_lag
            .is_some_and(|consumer_lag| consumer_lag < self.ticker_lag + margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(consumer_lag: Option<f64>, last_tick: Option<TickId>) -> ConsumerInfo {
        ConsumerInfo {
            ticker_lag: Duration::from_secs(1),
            consumer_lag: consumer_lag.map(Duration::from_secs_f64),
            last_tick,
            observed_at: DateTime::from_timestamp(1_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_position_subtracts_lag() {
        let info = info(Some(2.5), None);
        assert_eq!(
            info.position(),
            Some(DateTime::from_timestamp_millis(997_500).unwrap())
        );
    }

    #[test]
    fn test_replayed_past_is_strict() {
        let info = info(Some(2.0), None);
        let exactly = DateTime::from_timestamp(998, 0).unwrap();
        let before = DateTime::from_timestamp_millis(997_999).unwrap();

        assert!(!info.has_replayed_past(exactly));
        assert!(info.has_replayed_past(before));
    }

    #[test]
    fn test_unknown_lag_never_counts_as_replayed_or_healthy() {
        let info = info(None, Some(5));
        assert!(!info.has_replayed_past(DateTime::from_timestamp(0, 0).unwrap()));
        assert!(!info.is_healthy(Duration::from_secs(5)));
    }

    #[test]
    fn test_reached_tick() {
        assert!(info(Some(0.0), Some(7)).has_reached_tick(7));
        assert!(info(Some(0.0), Some(8)).has_reached_tick(7));
        assert!(!info(Some(0.0), Some(6)).has_reached_tick(7));
        assert!(!info(Some(0.0), None).has_reached_tick(7));
    }

    #[test]
    fn test_health_margin() {
        // ticker lag 1s, margin 5s: consumer lag must stay below 6s.
        assert!(info(Some(5.9), None).is_healthy(Duration::from_secs(5)));
        assert!(!info(Some(6.0), None).is_healthy(Duration::from_secs(5)));
    }
}
